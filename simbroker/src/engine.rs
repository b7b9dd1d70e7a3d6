//! Replay engine core.
//!
//! The [`Simulator`] owns every piece of mutable simulation state: the
//! order books, the order and account ledgers, the virtual clock, the quote
//! board and the tick sources. A single driving task replays the merged
//! tick streams, matches resting orders against each tick and fans out
//! events to account channels.
//!
//! # Concurrency Model
//! - One coarse `std::sync::RwLock` guards books, orders and accounts. Order
//!   entry and fill application both take it exclusively, so no order is
//!   inserted or removed in the middle of a sweep. It is never held across
//!   an `.await`.
//! - The clock and engine status are atomics, readable from any thread.
//! - Quotes live in a `DashMap` and are read as relaxed snapshots.
//! - Tick sources are moved into the driving task for the duration of a
//!   run and handed back when it ends.

use orderbook::{AccountId, Direction, InstrumentId, Order, OrderBook, OrderId, OrderStatus, Side};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountSummary, Position};
use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::event::{deliver, EventSender, QuoteEvent};
use crate::feed::{FeedLoader, TickSource, TickValue};
use crate::instrument::{Instrument, InstrumentRegistry};
use crate::quote::{Quote, QuoteBoard};
use crate::time::{DateTimeMs, Period};

/// Fills logged at info level per run, the rest go to debug.
const FILLS_LOGGED: u64 = 10;

/// Lifecycle of a simulator: `Idle → Starting → Running → Stopping → Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            _ => EngineState::Idle,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters of one replay run, returned by [`Simulator::wait`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub ticks: u64,
    pub fills: u64,
    pub days: u32,
    pub bar_events: u64,
    pub first_tick: Option<DateTimeMs>,
    pub last_tick: Option<DateTimeMs>,
    pub stopped: bool,
    /// Ticks skipped for being older than the clock.
    pub stale_ticks: u64,
    pub elapsed_secs: f64,
}

impl RunStats {
    pub fn ticks_per_sec(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.ticks as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

/// One price level in a book dump.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LevelDump {
    pub price: f64, // 0 = market
    pub qty: i64,
    pub orders: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BookDump {
    pub symbol: String,
    pub bids: Vec<LevelDump>,
    pub asks: Vec<LevelDump>,
}

/// Order count per status.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OrderStats {
    pub total: usize,
    pub new: usize,
    pub accepted: usize,
    pub partially_filled: usize,
    pub filled: usize,
    pub canceled: usize,
}

struct Fill {
    account: AccountId,
    direction: Direction,
    qty: i64,
    price: f64,
    realized: f64,
}

/// Books, orders and accounts. Orders and accounts are dense, index = id - 1.
#[derive(Default)]
struct Ledger {
    books: HashMap<InstrumentId, OrderBook>,
    orders: Vec<Order>,
    accounts: Vec<Account>,
    // last traded price per instrument, used to mark open positions
    marks: HashMap<InstrumentId, f64>,
}

fn unknown_account(id: AccountId) -> SimError {
    SimError::NotRegistered {
        kind: "account",
        name: id.to_string(),
    }
}

impl Ledger {
    fn account(&self, id: AccountId) -> Result<&Account> {
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|i| self.accounts.get(i))
            .ok_or_else(|| unknown_account(id))
    }

    fn account_mut(&mut self, id: AccountId) -> Result<&mut Account> {
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|i| self.accounts.get_mut(i))
            .ok_or_else(|| unknown_account(id))
    }

    /// Index of an order issued to `account`.
    fn owned_order(&self, account: AccountId, id: OrderId) -> Result<usize> {
        let acct = self.account(account)?;
        if id.0 == 0 || id.0 > self.orders.len() as u64 || !acct.owns(id) {
            return Err(SimError::NoSuchOrder(id));
        }
        Ok(id.0 as usize - 1)
    }

    fn apply_fill(&mut self, inst: &Instrument, id: OrderId, qty: i64, px_ticks: i64, now: DateTimeMs) -> Option<Fill> {
        let order = self.orders.get_mut((id.0 as usize).checked_sub(1)?)?;
        let price = inst.from_ticks(px_ticks);
        let filled = order.qty_filled + qty;
        order.avg_fill_price = (order.avg_fill_price * order.qty_filled as f64 + price * qty as f64) / filled as f64;
        order.qty_filled = filled;
        if filled >= order.qty {
            order.status = OrderStatus::Filled;
            order.close_ms = now.0;
        } else {
            order.status = OrderStatus::PartiallyFilled;
        }
        let (account, direction) = (order.account, order.direction);

        let acct = self.account_mut(account).ok()?;
        let realized = acct.apply_fill(inst, qty * direction.sign(), price);
        Some(Fill {
            account,
            direction,
            qty,
            price,
            realized,
        })
    }
}

#[derive(Default)]
struct FeedSet {
    sources: BTreeMap<InstrumentId, Box<dyn TickSource>>,
    loaded: bool,
}

struct Shared {
    registry: Arc<InstrumentRegistry>,
    default_fund: f64,
    state: AtomicU8,
    clock: AtomicI64,
    ledger: RwLock<Ledger>,
    quotes: QuoteBoard,
    feeds: Mutex<FeedSet>,
    loader: Mutex<Option<Arc<dyn FeedLoader>>>,
    driver: Mutex<Option<JoinHandle<RunStats>>>,
    // true once a stop is requested, reset by start
    stop_signal: watch::Sender<bool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, s: EngineState) {
        self.state.store(s as u8, Ordering::SeqCst);
    }

    fn now(&self) -> DateTimeMs {
        DateTimeMs(self.clock.load(Ordering::SeqCst))
    }

    fn read(&self) -> RwLockReadGuard<'_, Ledger> {
        self.ledger.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ledger> {
        self.ledger.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, symbol: &str) -> Result<&Instrument> {
        self.registry.resolve(symbol)
    }

    fn mark(&self, ledger: &Ledger, id: InstrumentId) -> Option<(&Instrument, f64)> {
        Some((self.registry.get(id)?, *ledger.marks.get(&id)?))
    }
}

/// Handle to one independent simulation. Cheap to clone.
#[derive(Clone)]
pub struct Simulator {
    shared: Arc<Shared>,
}

impl Simulator {
    /// New idle simulator. Accounts opened on it start with `default_fund`.
    pub fn new(registry: Arc<InstrumentRegistry>, default_fund: f64) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                default_fund,
                state: AtomicU8::new(EngineState::Idle as u8),
                clock: AtomicI64::new(0),
                ledger: RwLock::new(Ledger::default()),
                quotes: QuoteBoard::new(),
                feeds: Mutex::new(FeedSet::default()),
                loader: Mutex::new(None),
                driver: Mutex::new(None),
                stop_signal: watch::channel(false).0,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<InstrumentRegistry> {
        &self.shared.registry
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Current virtual time.
    pub fn time_current(&self) -> DateTimeMs {
        self.shared.now()
    }

    pub fn set_feed_loader(&self, loader: Arc<dyn FeedLoader>) {
        *lock(&self.shared.loader) = Some(loader);
    }

    /// Attaches (or replaces) the tick source of `symbol`. Idle only.
    pub fn add_feed(&self, symbol: &str, src: Box<dyn TickSource>) -> Result<()> {
        let state = self.state();
        if state != EngineState::Idle {
            return Err(SimError::EngineState(state));
        }
        let id = self.shared.resolve(symbol)?.id;
        lock(&self.shared.feeds).sources.insert(id, src);
        Ok(())
    }

    /// Opens a new account. Events for it go to `events`, if any.
    pub fn open(&self, events: Option<EventSender>) -> AccountId {
        let mut ledger = self.shared.write();
        let id = AccountId(ledger.accounts.len() as u32 + 1);
        ledger.accounts.push(Account::new(id, self.shared.default_fund, events));
        debug!(account = %id, "account opened");
        id
    }

    /// Subscribes `account` to quote events of `symbols`. Idle only; an
    /// unknown symbol rejects the whole list.
    pub fn subscribe(&self, account: AccountId, symbols: &[&str]) -> Result<()> {
        let state = self.state();
        if state != EngineState::Idle {
            return Err(SimError::EngineState(state));
        }
        let ids = symbols
            .iter()
            .map(|s| self.shared.resolve(s).map(|i| i.id))
            .collect::<Result<Vec<_>>>()?;
        let mut ledger = self.shared.write();
        ledger.account_mut(account)?.subscribed.extend(ids);
        Ok(())
    }

    /// Starts replay on a background task of the current tokio runtime.
    ///
    /// A no-op while starting or running; an error while stopping. Every
    /// start rewinds the tick sources, skips ticks before `config.start` and
    /// drops instruments with nothing left in the window.
    pub fn start(&self, config: &SimConfig) -> Result<()> {
        config.validate()?;
        let sh = &self.shared;
        if let Err(cur) = sh.state.compare_exchange(
            EngineState::Idle as u8,
            EngineState::Starting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return match EngineState::from_u8(cur) {
                EngineState::Starting | EngineState::Running => Ok(()),
                other => Err(SimError::EngineState(other)),
            };
        }
        let Ok(handle) = Handle::try_current() else {
            sh.set_state(EngineState::Idle);
            return Err(SimError::NoRuntime);
        };

        sh.stop_signal.send_replace(false);
        let run = self.prepare(config);
        sh.clock.store(run.clock.0, Ordering::SeqCst);
        info!(
            start = %run.clock,
            end = ?config.end.map(|t| t.to_string()),
            period = %config.period,
            instruments = run.live.len(),
            subscribers = run.fanout.targets.len(),
            "replay starting"
        );
        sh.set_state(EngineState::Running);
        let task = handle.spawn(drive(sh.clone(), run));
        *lock(&sh.driver) = Some(task);
        Ok(())
    }

    /// Asks the driving task to stop. It emits end-of-stream and returns to
    /// `Idle` on its own; use [`Simulator::wait`] to join it.
    ///
    /// A send blocked on a full event channel is abandoned, so a consumer
    /// that stopped reading cannot hold the replay.
    pub fn stop(&self) -> Result<()> {
        match self.shared.state.compare_exchange(
            EngineState::Running as u8,
            EngineState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.shared.stop_signal.send_replace(true);
                info!(time = %self.time_current(), "stop requested");
                Ok(())
            }
            Err(cur) => match EngineState::from_u8(cur) {
                EngineState::Idle | EngineState::Stopping => Ok(()),
                other => Err(SimError::EngineState(other)),
            },
        }
    }

    /// Waits for the current run to finish. None if nothing was started
    /// since the last wait.
    pub async fn wait(&self) -> Option<RunStats> {
        let task = lock(&self.shared.driver).take()?;
        task.await.ok()
    }

    fn prepare(&self, config: &SimConfig) -> Run {
        let sh = &self.shared;
        let mut subscribed = BTreeSet::new();
        let mut targets = Vec::new();
        {
            let ledger = sh.read();
            for acct in &ledger.accounts {
                subscribed.extend(acct.subscribed.iter().copied());
                if let Some(tx) = &acct.events {
                    let symbols = acct
                        .subscribed
                        .iter()
                        .filter_map(|id| sh.registry.get(*id).map(|i| (*id, i.ticker.clone())))
                        .collect();
                    targets.push(Target {
                        account: acct.id,
                        tx: tx.clone(),
                        symbols,
                    });
                }
            }
        }

        let mut feeds = lock(&sh.feeds);
        if !feeds.loaded {
            let loader = lock(&sh.loader).clone();
            if let Some(loader) = loader {
                for id in &subscribed {
                    let Some(inst) = sh.registry.get(*id) else { continue };
                    if feeds.sources.contains_key(id) {
                        continue;
                    }
                    match loader.load(inst) {
                        Ok(Some(src)) => {
                            feeds.sources.insert(*id, src);
                        }
                        Ok(None) => debug!(symbol = %inst.ticker, "no tick data"),
                        Err(e) => warn!(symbol = %inst.ticker, error = %e, "loading ticks failed"),
                    }
                }
            }
            feeds.loaded = true;
        }
        let sources = std::mem::take(&mut feeds.sources);
        drop(feeds);

        let mut live = Vec::new();
        let mut parked = Vec::new();
        for (id, mut src) in sources {
            src.reset();
            let Some(inst) = sh.registry.get(id).cloned() else {
                parked.push((id, src));
                continue;
            };
            let has_tick = match config.start {
                Some(t) => src.seek(t),
                None => src.left() > 0,
            };
            if has_tick {
                live.push(Live { inst, src });
            } else {
                warn!(symbol = %inst.ticker, "no ticks in replay window, dropped");
                parked.push((id, src));
            }
        }

        let clock = live
            .iter()
            .map(|l| l.src.time())
            .min()
            .or(config.start)
            .unwrap_or_default();
        sh.quotes.clear();

        Run {
            config: config.clone(),
            live,
            parked,
            fanout: Fanout {
                targets,
                stop: sh.stop_signal.subscribe(),
            },
            clock,
        }
    }

    // ── order entry ──

    /// Places a limit (price > 0) or market (price 0) order.
    pub fn send_order(
        &self,
        account: AccountId,
        symbol: &str,
        direction: Direction,
        qty: i64,
        price: f64,
        stop_price: f64,
    ) -> Result<OrderId> {
        let inst = self.shared.resolve(symbol)?;
        if qty <= 0 {
            return Err(SimError::InvalidOrder(format!("quantity {qty} must be positive")));
        }
        if price < 0.0 || stop_price < 0.0 {
            return Err(SimError::InvalidOrder(format!("negative price {price}/{stop_price}")));
        }
        let now = self.time_current();

        let mut ledger = self.shared.write();
        ledger.account(account)?;
        let id = OrderId(ledger.orders.len() as u64 + 1);
        let order = Order {
            id,
            account,
            instrument: inst.id,
            symbol: inst.ticker.clone(),
            direction,
            price,
            px_ticks: inst.to_ticks(price),
            stop_price,
            qty,
            qty_filled: 0,
            status: OrderStatus::Accepted,
            open_ms: now.0,
            close_ms: 0,
            avg_fill_price: 0.0,
        };
        ledger.books.entry(inst.id).or_default().insert(order.resting())?;
        ledger.orders.push(order);
        ledger.account_mut(account)?.orders.push(id);
        debug!(order = %id, %account, symbol, %direction, qty, price, "order accepted");
        Ok(id)
    }

    pub fn cancel_order(&self, account: AccountId, id: OrderId) -> Result<()> {
        let now = self.time_current();
        let mut ledger = self.shared.write();
        let idx = ledger.owned_order(account, id)?;
        let Ledger { books, orders, .. } = &mut *ledger;
        let order = &mut orders[idx];
        if order.status.is_terminal() {
            return Err(SimError::CannotCancel(id, order.status));
        }
        if let Some(book) = books.get_mut(&order.instrument) {
            book.remove(&order.resting());
        }
        order.status = OrderStatus::Canceled;
        order.close_ms = now.0;
        debug!(order = %id, %account, "order canceled");
        Ok(())
    }

    /// Turns a resting order into a market order so the next tick fills it.
    /// Filled orders are left alone, anything else is canceled.
    pub fn close_order(&self, account: AccountId, id: OrderId) -> Result<()> {
        let now = self.time_current();
        let mut ledger = self.shared.write();
        let idx = ledger.owned_order(account, id)?;
        let Ledger { books, orders, .. } = &mut *ledger;
        let order = &mut orders[idx];
        match order.status {
            OrderStatus::Filled => {}
            s if s.is_resting() => {
                if order.px_ticks != 0 || order.stop_price != 0.0 {
                    let book = books.entry(order.instrument).or_default();
                    book.remove(&order.resting());
                    order.price = 0.0;
                    order.px_ticks = 0;
                    order.stop_price = 0.0;
                    book.insert(order.resting())?;
                    debug!(order = %id, %account, "order converted to market");
                }
            }
            _ => {
                if order.status != OrderStatus::Canceled {
                    order.close_ms = now.0;
                }
                order.status = OrderStatus::Canceled;
            }
        }
        Ok(())
    }

    // ── queries ──

    pub fn get_order(&self, id: OrderId) -> Option<Order> {
        let ledger = self.shared.read();
        (id.0 as usize).checked_sub(1).and_then(|i| ledger.orders.get(i)).cloned()
    }

    pub fn get_orders(&self, account: AccountId) -> Vec<OrderId> {
        self.shared
            .read()
            .account(account)
            .map(|a| a.orders.clone())
            .unwrap_or_default()
    }

    /// Position of `account` in `symbol`, flat if it never traded it.
    pub fn get_position(&self, account: AccountId, symbol: &str) -> Position {
        let Ok(inst) = self.shared.resolve(symbol) else {
            return Position::flat(symbol);
        };
        let ledger = self.shared.read();
        ledger
            .account(account)
            .ok()
            .and_then(|a| a.positions.get(&inst.id).cloned())
            .unwrap_or_else(|| Position::flat(symbol))
    }

    /// Open positions of `account`.
    pub fn get_positions(&self, account: AccountId) -> Vec<Position> {
        let ledger = self.shared.read();
        ledger
            .account(account)
            .map(|a| a.positions.values().filter(|p| !p.is_flat()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        let id = self.shared.resolve(symbol).ok()?.id;
        self.shared.quotes.get(id)
    }

    pub fn cash(&self, account: AccountId) -> f64 {
        self.shared.read().account(account).map(|a| a.cash).unwrap_or(0.0)
    }

    pub fn balance(&self, account: AccountId) -> f64 {
        self.shared.read().account(account).map(|a| a.balance).unwrap_or(0.0)
    }

    /// Balance plus open profit at the last traded prices.
    pub fn equity(&self, account: AccountId) -> f64 {
        let ledger = self.shared.read();
        ledger
            .account(account)
            .map(|a| a.equity(|id| self.shared.mark(&ledger, id)))
            .unwrap_or(0.0)
    }

    pub fn margin(&self, account: AccountId) -> f64 {
        let ledger = self.shared.read();
        ledger
            .account(account)
            .map(|a| a.margin(|id| self.shared.registry.get(id)))
            .unwrap_or(0.0)
    }

    pub fn free_margin(&self, account: AccountId) -> f64 {
        self.equity(account) - self.margin(account)
    }

    // ── diagnostics ──

    pub fn account_summaries(&self) -> Vec<AccountSummary> {
        let ledger = self.shared.read();
        ledger
            .accounts
            .iter()
            .map(|a| AccountSummary {
                id: a.id.0,
                fund: a.fund,
                cash: a.cash,
                balance: a.balance,
                equity: a.equity(|id| self.shared.mark(&ledger, id)),
                margin: a.margin(|id| self.shared.registry.get(id)),
                trades: a.trades,
                orders: a.orders.len(),
                win_trades: a.win_trades,
                loss_trades: a.loss_trades,
                profit: a.profit,
                loss: a.loss,
                positions: a.positions.values().filter(|p| !p.is_flat()).cloned().collect(),
            })
            .collect()
    }

    /// Logs every account and returns them as JSON.
    pub fn dump_accounts(&self) -> String {
        let summaries = self.account_summaries();
        for s in &summaries {
            info!(
                account = s.id,
                fund = s.fund,
                cash = s.cash,
                equity = s.equity,
                trades = s.trades,
                orders = s.orders,
                "win/loss({}/{}) profit/loss({:.3}/{:.3})",
                s.win_trades,
                s.loss_trades,
                s.profit,
                s.loss
            );
        }
        serde_json::to_string_pretty(&summaries).unwrap_or_default()
    }

    pub fn dump_order_book(&self, symbol: &str) -> Result<BookDump> {
        let inst = self.shared.resolve(symbol)?;
        let ledger = self.shared.read();
        let levels = |side: Side| -> Vec<LevelDump> {
            let Some(book) = ledger.books.get(&inst.id) else {
                return Vec::new();
            };
            let side = match side {
                Side::Bid => &book.bids,
                Side::Ask => &book.asks,
            };
            side.iter_levels_best_first()
                .into_iter()
                .map(|(px, qty, orders)| LevelDump {
                    price: inst.from_ticks(px),
                    qty,
                    orders,
                })
                .collect()
        };
        let dump = BookDump {
            symbol: inst.ticker.clone(),
            bids: levels(Side::Bid),
            asks: levels(Side::Ask),
        };
        info!(
            symbol,
            bid_levels = dump.bids.len(),
            ask_levels = dump.asks.len(),
            best_bid = ?dump.bids.first().map(|l| l.price),
            best_ask = ?dump.asks.first().map(|l| l.price),
            "order book"
        );
        Ok(dump)
    }

    pub fn dump_order_stats(&self) -> OrderStats {
        let ledger = self.shared.read();
        let mut stats = OrderStats {
            total: ledger.orders.len(),
            ..OrderStats::default()
        };
        for o in &ledger.orders {
            match o.status {
                OrderStatus::New => stats.new += 1,
                OrderStatus::Accepted => stats.accepted += 1,
                OrderStatus::PartiallyFilled => stats.partially_filled += 1,
                OrderStatus::Filled => stats.filled += 1,
                OrderStatus::Canceled => stats.canceled += 1,
            }
        }
        info!(
            total = stats.total,
            accepted = stats.accepted,
            partially_filled = stats.partially_filled,
            filled = stats.filled,
            canceled = stats.canceled,
            "order stats"
        );
        stats
    }
}

// ── replay ──

struct Live {
    inst: Instrument,
    src: Box<dyn TickSource>,
}

struct Target {
    account: AccountId,
    tx: EventSender,
    symbols: Vec<(InstrumentId, String)>,
}

/// Resolves once a stop has been requested.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let live = rx.wait_for(|stop| *stop).await.is_ok();
    if !live {
        std::future::pending::<()>().await;
    }
}

/// Event channels of the accounts taking part in a run.
struct Fanout {
    targets: Vec<Target>,
    stop: watch::Receiver<bool>,
}

impl Fanout {
    /// Sends `make(symbol)` for every subscribed symbol, or only for `only`.
    /// Waits for channel capacity until a stop is requested. Returns the
    /// number delivered.
    async fn send(&mut self, shared: &Shared, only: Option<InstrumentId>, make: impl Fn(&str) -> QuoteEvent) -> u64 {
        let mut sent = 0;
        let mut closed = Vec::new();
        'targets: for (i, t) in self.targets.iter().enumerate() {
            for (id, symbol) in &t.symbols {
                if only.is_some_and(|o| o != *id) {
                    continue;
                }
                let delivered = tokio::select! {
                    biased;
                    _ = stop_requested(&mut self.stop) => None,
                    ok = deliver(&t.tx, make(symbol)) => Some(ok),
                };
                match delivered {
                    Some(true) => sent += 1,
                    Some(false) => {
                        closed.push(i);
                        break;
                    }
                    None => break 'targets,
                }
            }
        }
        self.detach(shared, closed);
        sent
    }

    /// Ends every stream. After a stop, a channel without room gets its
    /// end-of-stream from a detached task instead of holding the driver.
    async fn end_of_stream(&mut self) {
        for t in std::mem::take(&mut self.targets) {
            let delivered = tokio::select! {
                biased;
                ok = deliver(&t.tx, QuoteEvent::EndOfStream) => Some(ok),
                _ = stop_requested(&mut self.stop) => None,
            };
            match delivered {
                Some(true) => {}
                Some(false) => debug!(account = %t.account, "end of stream not delivered, channel closed"),
                None => {
                    debug!(account = %t.account, "event channel full, end of stream left pending");
                    tokio::spawn(async move { deliver(&t.tx, QuoteEvent::EndOfStream).await });
                }
            }
        }
    }

    fn detach(&mut self, shared: &Shared, closed: Vec<usize>) {
        if closed.is_empty() {
            return;
        }
        let mut ledger = shared.write();
        for i in closed.into_iter().rev() {
            let t = self.targets.remove(i);
            warn!(account = %t.account, "event channel closed, detached");
            if let Ok(acct) = ledger.account_mut(t.account) {
                acct.events = None;
            }
        }
    }
}

struct Run {
    config: SimConfig,
    live: Vec<Live>, // ordered by instrument id
    parked: Vec<(InstrumentId, Box<dyn TickSource>)>,
    fanout: Fanout,
    clock: DateTimeMs,
}

impl Run {
    /// Processes every instrument due at `clock`, skips ticks older than
    /// `clock` and retires exhausted sources. Returns the instruments that
    /// ticked.
    fn step(&mut self, shared: &Shared, clock: DateTimeMs, stats: &mut RunStats) -> Vec<InstrumentId> {
        let mut ticked = Vec::new();
        {
            let mut ledger = shared.write();
            for l in self.live.iter_mut() {
                if l.src.time() != clock {
                    continue;
                }
                process_tick(shared, &mut ledger, &l.inst, l.src.tick_value(), clock, stats);
                ticked.push(l.inst.id);
                l.src.advance();
            }
        }
        stats.ticks += ticked.len() as u64;
        stats.first_tick.get_or_insert(clock);
        stats.last_tick = Some(clock);

        for l in self.live.iter_mut() {
            while l.src.left() > 0 && l.src.time() < clock {
                warn!(symbol = %l.inst.ticker, time = %l.src.time(), clock = %clock, "tick out of order, skipped");
                stats.stale_ticks += 1;
                l.src.advance();
            }
        }

        let (keep, gone): (Vec<Live>, Vec<Live>) =
            std::mem::take(&mut self.live).into_iter().partition(|l| l.src.left() > 0);
        self.live = keep;
        for l in gone {
            debug!(symbol = %l.inst.ticker, "end of tick data");
            self.parked.push((l.inst.id, l.src));
        }
        ticked
    }

    /// Hands every source back to the simulator.
    fn finish(self, shared: &Shared) {
        let mut feeds = lock(&shared.feeds);
        for l in self.live {
            feeds.sources.insert(l.inst.id, l.src);
        }
        for (id, src) in self.parked {
            feeds.sources.insert(id, src);
        }
    }
}

/// Quote update, sweep of both sides, resting cross, then fills.
///
/// Quote-only instruments fill buys at the ask and sells at the bid and
/// take the bid as last price. Everything else fills at the last price.
fn process_tick(
    shared: &Shared,
    ledger: &mut Ledger,
    inst: &Instrument,
    v: TickValue,
    now: DateTimeMs,
    stats: &mut RunStats,
) {
    let (last_px, buy_px, sell_px) = if inst.quote_only {
        (v.bid, v.ask, v.bid)
    } else {
        (v.last, v.last, v.last)
    };
    let last = inst.from_ticks(last_px);
    shared
        .quotes
        .update(inst.id, now, inst.from_ticks(v.bid), inst.from_ticks(v.ask), last, v.volume);
    ledger.marks.insert(inst.id, last);

    let Some(book) = ledger.books.get_mut(&inst.id) else {
        return;
    };
    if book.is_empty() {
        return;
    }
    let mut fills: Vec<(OrderId, i64, i64)> = Vec::new();
    fills.extend(book.sweep_crossable(Side::Bid, buy_px).into_iter().map(|r| (r.id, r.qty, buy_px)));
    fills.extend(book.sweep_crossable(Side::Ask, sell_px).into_iter().map(|r| (r.id, r.qty, sell_px)));
    for c in book.cross_resting() {
        fills.push((c.bid, c.qty, c.px_ticks));
        fills.push((c.ask, c.qty, c.px_ticks));
    }

    for (id, qty, px) in fills {
        let Some(fill) = ledger.apply_fill(inst, id, qty, px, now) else {
            warn!(order = %id, "fill for unknown order");
            continue;
        };
        stats.fills += 1;
        if stats.fills <= FILLS_LOGGED {
            info!(
                order = %id,
                account = %fill.account,
                symbol = %inst.ticker,
                direction = %fill.direction,
                qty = fill.qty,
                price = fill.price,
                pnl = fill.realized,
                "filled"
            );
        } else {
            debug!(order = %id, account = %fill.account, qty = fill.qty, price = fill.price, "filled");
        }
    }
}

fn bar_close(symbol: &str, period: Period, bar_time: DateTimeMs) -> QuoteEvent {
    QuoteEvent::BarClose {
        symbol: symbol.to_string(),
        period,
        bar_time,
    }
}

/// The driving task. Runs until data runs out, the end time is reached or
/// a stop is requested.
async fn drive(shared: Arc<Shared>, mut run: Run) -> RunStats {
    let started = Instant::now();
    let config = run.config.clone();
    let period = config.period;
    let mut clock = run.clock;
    let mut stats = RunStats::default();

    let mut bar_start = period.floor(clock);
    let mut next_bar = period.next_boundary(clock);
    let mut day_start = Period::Daily.floor(clock);
    let mut next_day = Period::Daily.next_boundary(clock);

    loop {
        if shared.state() == EngineState::Stopping {
            info!(time = %clock, "replay stopped");
            stats.stopped = true;
            break;
        }
        if run.live.is_empty() || config.end.is_some_and(|end| clock > end) {
            break;
        }

        let ticked = run.step(&shared, clock, &mut stats);
        if config.emit_ticks {
            for id in ticked {
                run.fanout
                    .send(&shared, Some(id), |symbol| QuoteEvent::Tick {
                        symbol: symbol.to_string(),
                        time: clock,
                    })
                    .await;
            }
        }

        let Some(next) = run.live.iter().map(|l| l.src.time()).min() else {
            break;
        };
        clock = next;
        shared.clock.store(clock.0, Ordering::SeqCst);
        if config.end.is_some_and(|end| clock > end) {
            break;
        }

        let new_day = clock >= next_day;
        if new_day {
            shared.quotes.rollover_all();
            stats.days += 1;
        }
        if clock >= next_bar && period != Period::Daily {
            let bar_time = bar_start;
            stats.bar_events += run.fanout.send(&shared, None, |s| bar_close(s, period, bar_time)).await;
            bar_start = period.floor(clock);
            next_bar = period.next_boundary(clock);
        }
        if new_day {
            let bar_time = day_start;
            stats.bar_events += run
                .fanout
                .send(&shared, None, |s| bar_close(s, Period::Daily, bar_time))
                .await;
            day_start = Period::Daily.floor(clock);
            next_day = Period::Daily.next_boundary(clock);
            if period == Period::Daily {
                bar_start = day_start;
            }
        }
    }

    // close the bar in progress unless stopped by hand
    if !stats.stopped && stats.ticks > 0 {
        let bar_time = bar_start;
        stats.bar_events += run.fanout.send(&shared, None, |s| bar_close(s, period, bar_time)).await;
    }
    run.fanout.end_of_stream().await;
    run.finish(&shared);

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    info!(
        ticks = stats.ticks,
        fills = stats.fills,
        days = stats.days,
        secs = stats.elapsed_secs,
        tps = stats.ticks_per_sec() as u64,
        "replay finished"
    );
    shared.set_state(EngineState::Idle);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::TickSeries;
    use crate::instrument::InstrumentSpec;

    fn sim() -> Simulator {
        let reg = InstrumentRegistry::from_specs(&[
            InstrumentSpec {
                quote_only: true,
                ..InstrumentSpec::new("EURUSD")
            },
            InstrumentSpec::new("ES"),
        ])
        .unwrap();
        Simulator::new(Arc::new(reg), 10_000.0)
    }

    #[test]
    fn orders_get_dense_ids_and_rest_in_book() {
        let sim = sim();
        let a = sim.open(None);
        let b = sim.open(None);
        assert_eq!((a, b), (AccountId(1), AccountId(2)));

        let o1 = sim.send_order(a, "EURUSD", Direction::Buy, 1, 11355.0, 0.0).unwrap();
        let o2 = sim.send_order(b, "EURUSD", Direction::Sell, 2, 11370.0, 0.0).unwrap();
        assert_eq!((o1, o2), (OrderId(1), OrderId(2)));
        assert_eq!(sim.get_orders(a), vec![o1]);
        assert_eq!(sim.get_order(o2).unwrap().status, OrderStatus::Accepted);

        let dump = sim.dump_order_book("EURUSD").unwrap();
        assert_eq!(dump.bids.len(), 1);
        assert_eq!(dump.asks[0].qty, 2);
    }

    #[test]
    fn send_order_validates_input() {
        let sim = sim();
        let a = sim.open(None);
        assert!(matches!(
            sim.send_order(a, "GBPUSD", Direction::Buy, 1, 1.0, 0.0),
            Err(SimError::UnknownSymbol(_))
        ));
        assert!(matches!(
            sim.send_order(a, "ES", Direction::Buy, 0, 1.0, 0.0),
            Err(SimError::InvalidOrder(_))
        ));
        assert!(matches!(
            sim.send_order(AccountId(9), "ES", Direction::Buy, 1, 1.0, 0.0),
            Err(SimError::NotRegistered { kind: "account", .. })
        ));
    }

    #[test]
    fn cancel_checks_ownership_and_state() {
        let sim = sim();
        let a = sim.open(None);
        let b = sim.open(None);
        let o1 = sim.send_order(a, "ES", Direction::Buy, 1, 100.0, 0.0).unwrap();
        let o2 = sim.send_order(b, "ES", Direction::Buy, 1, 100.0, 0.0).unwrap();

        assert!(matches!(sim.cancel_order(a, o2), Err(SimError::NoSuchOrder(_))));
        sim.cancel_order(a, o1).unwrap();
        assert!(matches!(
            sim.cancel_order(a, o1),
            Err(SimError::CannotCancel(_, OrderStatus::Canceled))
        ));
        assert_eq!(sim.dump_order_book("ES").unwrap().bids[0].orders, 1);
    }

    #[test]
    fn close_order_converts_to_market() {
        let sim = sim();
        let a = sim.open(None);
        let o = sim.send_order(a, "ES", Direction::Sell, 1, 105.0, 0.0).unwrap();
        sim.close_order(a, o).unwrap();

        let order = sim.get_order(o).unwrap();
        assert_eq!(order.price, 0.0);
        assert_eq!(order.status, OrderStatus::Accepted);
        let dump = sim.dump_order_book("ES").unwrap();
        assert_eq!(dump.asks.len(), 1);
        assert_eq!(dump.asks[0].price, 0.0);

        sim.cancel_order(a, o).unwrap();
        sim.close_order(a, o).unwrap();
        assert_eq!(sim.get_order(o).unwrap().status, OrderStatus::Canceled);
        assert_eq!(sim.dump_order_stats().canceled, 1);
    }

    #[test]
    fn start_needs_a_runtime() {
        let sim = sim();
        assert!(matches!(sim.start(&SimConfig::default()), Err(SimError::NoRuntime)));
        assert_eq!(sim.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn subscribe_and_add_feed_are_idle_only() {
        let sim = sim();
        let a = sim.open(None);
        assert!(matches!(sim.subscribe(a, &["EURUSD", "XXX"]), Err(SimError::UnknownSymbol(_))));
        sim.subscribe(a, &["EURUSD"]).unwrap();

        let mut ticks = TickSeries::new();
        ticks.push_quote(DateTimeMs(100), 11350, 11355, 1);
        sim.add_feed("EURUSD", Box::new(ticks)).unwrap();

        sim.start(&SimConfig::default()).unwrap();
        assert!(matches!(sim.subscribe(a, &["ES"]), Err(SimError::EngineState(EngineState::Running))));
        let stats = sim.wait().await.unwrap();
        assert_eq!(stats.ticks, 1);
        assert_eq!(sim.state(), EngineState::Idle);
        assert_eq!(sim.quote("EURUSD").unwrap().bid, 11350.0);
    }

    #[tokio::test]
    async fn replay_can_be_repeated() {
        let sim = sim();
        let mut ticks = TickSeries::new();
        for i in 0..5 {
            ticks.push(
                DateTimeMs(i * 1000),
                TickValue {
                    bid: 100,
                    ask: 100,
                    last: 100 + i,
                    volume: 1,
                },
            );
        }
        sim.add_feed("ES", Box::new(ticks)).unwrap();

        sim.start(&SimConfig::default()).unwrap();
        assert_eq!(sim.wait().await.unwrap().ticks, 5);

        let cfg = SimConfig {
            start: Some(DateTimeMs(2000)),
            ..SimConfig::default()
        };
        sim.start(&cfg).unwrap();
        let stats = sim.wait().await.unwrap();
        assert_eq!(stats.ticks, 3);
        assert_eq!(stats.first_tick, Some(DateTimeMs(2000)));
        assert_eq!(sim.time_current(), DateTimeMs(4000));
        assert!(sim.wait().await.is_none());
    }
}
