//! Strategy runner: one task per runner reads the account's event channel
//! and calls the strategy subscribed to each event's symbol.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bars::BarSource;
use crate::broker::{Broker, BrokerRegistry};
use crate::config::{RunnerConfig, SimConfig};
use crate::error::{Result, SimError};
use crate::event::{channel, EventReceiver, QuoteEvent};
use crate::strategy::{Config, Context, Strategy, StrategyRegistry, UNIVERSE};

/// Events handed to strategies by one runner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub ticks: u64,
    pub bars: u64,
    /// Events for symbols no strategy trades
    pub unrouted: u64,
}

struct Slot {
    name: String,
    ctx: Context,
    strategy: Box<dyn Strategy>,
}

type Dispatch = JoinHandle<(Vec<Slot>, DispatchStats)>;

pub struct StrategyRunner {
    broker: Arc<dyn Broker>,
    events: Option<EventReceiver>,
    slots: Vec<Slot>,
    by_symbol: HashMap<String, usize>,
    task: Option<Dispatch>,
}

impl StrategyRunner {
    /// Opens an account at `config.broker`, initializes every listed
    /// strategy and subscribes the union of their universes.
    ///
    /// A symbol traded by several strategies goes to the first one listed.
    /// Strategies whose init fails are skipped; if none is left the load
    /// fails with [`SimError::NoStrategy`].
    pub fn load(
        config: &RunnerConfig,
        brokers: &BrokerRegistry,
        strategies: &StrategyRegistry,
        bars: Arc<dyn BarSource>,
    ) -> Result<Self> {
        let (tx, rx) = channel(config.event_buffer);
        let broker = brokers.open(&config.broker, Some(tx))?;
        let empty = BTreeMap::new();

        let mut slots = Vec::new();
        let mut by_symbol = HashMap::new();
        for name in &config.strategies {
            let factory = strategies.get(name)?;
            let params = Config::from_params(&factory.param_set(), config.params.get(name).unwrap_or(&empty))?;
            let mut ctx = Context::new(broker.clone(), params, bars.clone());
            let strategy = match factory.init(&mut ctx) {
                Ok(s) => s,
                Err(e) => {
                    warn!(strategy = %name, error = %e, "strategy init failed, skipped");
                    continue;
                }
            };

            // init may have rewritten the universe
            let universe = ctx.config().get_strings(UNIVERSE).map(<[String]>::to_vec).unwrap_or_default();
            for symbol in universe {
                if let Err(e) = broker.instrument(&symbol) {
                    warn!(strategy = %name, error = %e, "symbol skipped");
                    continue;
                }
                by_symbol.entry(symbol).or_insert(slots.len());
            }
            slots.push(Slot {
                name: name.clone(),
                ctx,
                strategy,
            });
        }
        if by_symbol.is_empty() {
            return Err(SimError::NoStrategy);
        }

        let mut symbols: Vec<&str> = by_symbol.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        broker.subscribe_quotes(&symbols)?;
        info!(
            account = %broker.id(),
            strategies = slots.len(),
            symbols = symbols.len(),
            "strategies loaded"
        );

        Ok(Self {
            broker,
            events: Some(rx),
            slots,
            by_symbol,
            task: None,
        })
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Symbols routed to a strategy, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut v: Vec<String> = self.by_symbol.keys().cloned().collect();
        v.sort();
        v
    }

    /// Starts the broker and the dispatch task. The task ends on
    /// end-of-stream or when the channel closes. A failed call leaves the
    /// runner as it was, so it can be retried.
    pub fn run_strategy(&mut self, sim: &SimConfig) -> Result<()> {
        if self.events.is_none() {
            return Err(SimError::NoEventChannel);
        }
        if self.slots.is_empty() {
            return Err(SimError::NoStrategy);
        }
        let handle = Handle::try_current().map_err(|_| SimError::NoRuntime)?;
        self.broker.start(sim)?;
        let Some(events) = self.events.take() else {
            return Err(SimError::NoEventChannel);
        };

        let slots = std::mem::take(&mut self.slots);
        let by_symbol = self.by_symbol.clone();
        self.task = Some(handle.spawn(dispatch(events, slots, by_symbol)));
        Ok(())
    }

    /// Waits for the dispatch task to end, then de-initializes every
    /// strategy.
    pub async fn stop_strategy(&mut self) -> Result<DispatchStats> {
        let Some(task) = self.task.take() else {
            return Ok(DispatchStats::default());
        };
        let (mut slots, stats) = task.await.map_err(|e| SimError::TaskFailed(e.to_string()))?;
        for slot in slots.iter_mut() {
            slot.strategy.de_init();
            debug!(strategy = %slot.name, "de-initialized");
        }
        info!(ticks = stats.ticks, bars = stats.bars, unrouted = stats.unrouted, "strategies stopped");
        Ok(stats)
    }
}

async fn dispatch(
    mut events: EventReceiver,
    mut slots: Vec<Slot>,
    by_symbol: HashMap<String, usize>,
) -> (Vec<Slot>, DispatchStats) {
    let mut stats = DispatchStats::default();
    while let Some(ev) = events.recv().await {
        let (symbol, period) = match &ev {
            QuoteEvent::EndOfStream => break,
            QuoteEvent::Tick { symbol, .. } => (symbol, None),
            QuoteEvent::BarClose { symbol, period, .. } => (symbol, Some(*period)),
        };
        let Some(Slot { ctx, strategy, .. }) = by_symbol.get(symbol).and_then(|i| slots.get_mut(*i)) else {
            stats.unrouted += 1;
            continue;
        };
        match period {
            None => {
                strategy.on_tick(ctx, symbol);
                stats.ticks += 1;
            }
            Some(p) => {
                strategy.on_bar(ctx, symbol, p);
                stats.bars += 1;
            }
        }
    }
    (slots, stats)
}
