//! Account and position ledger for simulated brokers.

use orderbook::{AccountId, InstrumentId, OrderId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::event::EventSender;
use crate::instrument::Instrument;

/// Net position in one instrument. Positive is long.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    pub qty: i64,
    pub avg_price: f64,
}

impl Position {
    pub fn flat(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            qty: 0,
            avg_price: 0.0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.qty == 0
    }

    /// Applies a signed fill and returns the realized profit.
    ///
    /// A fill against the position first closes up to |qty| at the current
    /// average; whatever is left opens a new position at `price`. Average
    /// price is never blended across a sign change.
    pub fn apply_fill(&mut self, instrument: &Instrument, signed_qty: i64, price: f64) -> f64 {
        let mut realized = 0.0;
        let mut rest = signed_qty;

        if self.qty != 0 && self.qty.signum() != rest.signum() {
            let closed = rest.abs().min(self.qty.abs());
            realized = instrument.calc_profit(self.avg_price, price, closed * self.qty.signum());
            self.qty += closed * rest.signum();
            rest -= closed * rest.signum();
            if self.qty == 0 {
                self.avg_price = 0.0;
            }
        }

        if rest != 0 {
            let total = self.qty + rest;
            let cost = self.avg_price * self.qty.abs() as f64 + price * rest.abs() as f64;
            self.avg_price = cost / total.abs() as f64;
            self.qty = total;
        }
        realized
    }
}

/// One simulated broker instance.
#[derive(Debug)]
pub struct Account {
    pub id: AccountId,
    pub fund: f64,
    pub cash: f64,
    pub balance: f64,
    pub trades: u32,
    pub win_trades: u32,
    pub loss_trades: u32,
    pub profit: f64,
    pub loss: f64, // cumulative, <= 0
    pub orders: Vec<OrderId>, // ascending
    pub positions: BTreeMap<InstrumentId, Position>,
    pub subscribed: BTreeSet<InstrumentId>,
    pub(crate) events: Option<EventSender>,
}

impl Account {
    pub fn new(id: AccountId, fund: f64, events: Option<EventSender>) -> Self {
        Self {
            id,
            fund,
            cash: fund,
            balance: fund,
            trades: 0,
            win_trades: 0,
            loss_trades: 0,
            profit: 0.0,
            loss: 0.0,
            orders: Vec::new(),
            positions: BTreeMap::new(),
            subscribed: BTreeSet::new(),
            events,
        }
    }

    pub fn owns(&self, id: OrderId) -> bool {
        self.orders.binary_search(&id).is_ok()
    }

    /// Books a fill against the position and settles realized profit.
    pub fn apply_fill(&mut self, instrument: &Instrument, signed_qty: i64, price: f64) -> f64 {
        if signed_qty == 0 {
            return 0.0;
        }
        self.trades += 1;
        let pos = self
            .positions
            .entry(instrument.id)
            .or_insert_with(|| Position::flat(instrument.ticker.as_str()));
        let was_open = !pos.is_flat() && pos.qty.signum() != signed_qty.signum();
        let realized = pos.apply_fill(instrument, signed_qty, price);

        if was_open {
            self.cash += realized;
            self.balance += realized;
            if realized >= 0.0 {
                self.profit += realized;
                self.win_trades += 1;
            } else {
                self.loss += realized;
                self.loss_trades += 1;
            }
        }
        realized
    }

    /// Balance plus open profit. `lookup` gives each instrument and its mark
    /// price; positions without a mark are left out.
    pub fn equity<'a>(&self, lookup: impl Fn(InstrumentId) -> Option<(&'a Instrument, f64)>) -> f64 {
        let open: f64 = self
            .positions
            .iter()
            .filter(|(_, p)| !p.is_flat())
            .filter_map(|(id, p)| {
                let (inst, mark) = lookup(*id)?;
                Some(inst.calc_profit(p.avg_price, mark, p.qty))
            })
            .sum();
        self.balance + open
    }

    pub fn margin<'a>(&self, lookup: impl Fn(InstrumentId) -> Option<&'a Instrument>) -> f64 {
        self.positions
            .iter()
            .filter_map(|(id, p)| Some(lookup(*id)?.calc_margin(p.avg_price, p.qty)))
            .sum()
    }
}

/// Serializable account snapshot used by the diagnostics dumps.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccountSummary {
    pub id: u32,
    pub fund: f64,
    pub cash: f64,
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub trades: u32,
    pub orders: usize,
    pub win_trades: u32,
    pub loss_trades: u32,
    pub profit: f64,
    pub loss: f64,
    pub positions: Vec<Position>,
}
