//! Broker contract seen by strategies, plus the simulated implementation.

use orderbook::{AccountId, Direction, Order, OrderId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::account::Position;
use crate::config::SimConfig;
use crate::engine::Simulator;
use crate::error::{Result, SimError};
use crate::event::EventSender;
use crate::instrument::Instrument;
use crate::quote::Quote;
use crate::time::DateTimeMs;

/// One trading account at some broker.
pub trait Broker: Send + Sync {
    fn id(&self) -> AccountId;

    fn start(&self, config: &SimConfig) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Only allowed before the broker is started.
    fn subscribe_quotes(&self, symbols: &[&str]) -> Result<()>;

    fn equity(&self) -> f64;

    fn balance(&self) -> f64;

    fn cash(&self) -> f64;

    fn free_margin(&self) -> f64;

    /// Price 0 places a market order.
    fn send_order(&self, symbol: &str, direction: Direction, qty: i64, price: f64, stop_price: f64) -> Result<OrderId>;

    fn cancel_order(&self, id: OrderId) -> Result<()>;

    fn close_order(&self, id: OrderId) -> Result<()>;

    fn get_order(&self, id: OrderId) -> Option<Order>;

    fn get_orders(&self) -> Vec<OrderId>;

    fn get_position(&self, symbol: &str) -> Position;

    fn get_positions(&self) -> Vec<Position>;

    fn time_current(&self) -> DateTimeMs;

    fn quote(&self, symbol: &str) -> Option<Quote>;

    fn instrument(&self, symbol: &str) -> Result<Instrument>;
}

/// Opens accounts. `events` receives quote events for subscribed symbols.
pub trait BrokerFactory: Send + Sync {
    fn open(&self, events: Option<EventSender>) -> Result<Arc<dyn Broker>>;
}

/// Account on a [`Simulator`].
#[derive(Clone)]
pub struct SimAccount {
    sim: Simulator,
    id: AccountId,
}

impl SimAccount {
    pub fn open(sim: &Simulator, events: Option<EventSender>) -> Self {
        Self {
            id: sim.open(events),
            sim: sim.clone(),
        }
    }

    pub fn simulator(&self) -> &Simulator {
        &self.sim
    }
}

impl Broker for SimAccount {
    fn id(&self) -> AccountId {
        self.id
    }

    fn start(&self, config: &SimConfig) -> Result<()> {
        self.sim.start(config)
    }

    fn stop(&self) -> Result<()> {
        self.sim.stop()
    }

    fn subscribe_quotes(&self, symbols: &[&str]) -> Result<()> {
        self.sim.subscribe(self.id, symbols)
    }

    fn equity(&self) -> f64 {
        self.sim.equity(self.id)
    }

    fn balance(&self) -> f64 {
        self.sim.balance(self.id)
    }

    fn cash(&self) -> f64 {
        self.sim.cash(self.id)
    }

    fn free_margin(&self) -> f64 {
        self.sim.free_margin(self.id)
    }

    fn send_order(&self, symbol: &str, direction: Direction, qty: i64, price: f64, stop_price: f64) -> Result<OrderId> {
        self.sim.send_order(self.id, symbol, direction, qty, price, stop_price)
    }

    fn cancel_order(&self, id: OrderId) -> Result<()> {
        self.sim.cancel_order(self.id, id)
    }

    fn close_order(&self, id: OrderId) -> Result<()> {
        self.sim.close_order(self.id, id)
    }

    fn get_order(&self, id: OrderId) -> Option<Order> {
        self.sim.get_order(id).filter(|o| o.account == self.id)
    }

    fn get_orders(&self) -> Vec<OrderId> {
        self.sim.get_orders(self.id)
    }

    fn get_position(&self, symbol: &str) -> Position {
        self.sim.get_position(self.id, symbol)
    }

    fn get_positions(&self) -> Vec<Position> {
        self.sim.get_positions(self.id)
    }

    fn time_current(&self) -> DateTimeMs {
        self.sim.time_current()
    }

    fn quote(&self, symbol: &str) -> Option<Quote> {
        self.sim.quote(symbol)
    }

    fn instrument(&self, symbol: &str) -> Result<Instrument> {
        self.sim.registry().resolve(symbol).cloned()
    }
}

/// Factory handing out accounts on one shared simulator.
#[derive(Clone)]
pub struct SimBrokerFactory {
    sim: Simulator,
}

impl SimBrokerFactory {
    pub fn new(sim: Simulator) -> Self {
        Self { sim }
    }
}

impl BrokerFactory for SimBrokerFactory {
    fn open(&self, events: Option<EventSender>) -> Result<Arc<dyn Broker>> {
        Ok(Arc::new(SimAccount::open(&self.sim, events)))
    }
}

/// Name → broker factory.
#[derive(Default)]
pub struct BrokerRegistry {
    factories: HashMap<String, Arc<dyn BrokerFactory>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn BrokerFactory>) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(SimError::Duplicate {
                kind: "broker",
                name: name.to_string(),
            });
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BrokerFactory>> {
        self.factories.get(name).cloned().ok_or_else(|| SimError::NotRegistered {
            kind: "broker",
            name: name.to_string(),
        })
    }

    /// Opens an account at the broker registered as `name`.
    pub fn open(&self, name: &str, events: Option<EventSender>) -> Result<Arc<dyn Broker>> {
        self.get(name)?.open(events)
    }
}
