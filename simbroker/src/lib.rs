//! Tick-replay simulated broker and strategy runtime.
//!
//! Core features:
//! - Deterministic replay of per-instrument tick sources merged by time
//! - One order book per instrument, swept against every tick
//! - Per-account positions, realized/unrealized P&L and margin
//! - Bar-close and tick events fanned out over bounded channels
//! - Strategy runner dispatching events to plug-in strategies
//!
//! ```no_run
//! # async fn demo() -> simbroker::Result<()> {
//! use std::sync::Arc;
//! use simbroker::{InstrumentRegistry, InstrumentSpec, SimConfig, Simulator, TickSeries};
//!
//! let reg = InstrumentRegistry::from_specs(&[InstrumentSpec::new("ES")])?;
//! let sim = Simulator::new(Arc::new(reg), 10_000.0);
//! sim.add_feed("ES", Box::new(TickSeries::new()))?;
//! sim.start(&SimConfig::default())?;
//! let stats = sim.wait().await;
//! # Ok(()) }
//! ```

pub mod account;
pub mod bars;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod feed;
pub mod instrument;
pub mod quote;
pub mod runner;
pub mod strategy;
pub mod time;

pub use account::{Account, AccountSummary, Position};
pub use bars::{BarCache, BarSource, Bars};
pub use broker::{Broker, BrokerFactory, BrokerRegistry, SimAccount, SimBrokerFactory};
pub use config::{AppConfig, FeedSpec, RunnerConfig, SimConfig};
pub use engine::{BookDump, EngineState, LevelDump, OrderStats, RunStats, Simulator};
pub use error::{Result, SimError};
pub use event::{channel, EventReceiver, EventSender, QuoteEvent, DEFAULT_EVENT_BUFFER};
pub use feed::{validate_feed, FeedLoader, FeedReport, Tick, TickSeries, TickSource, TickValue};
pub use instrument::{Instrument, InstrumentRegistry, InstrumentSpec};
pub use quote::{Quote, QuoteBoard};
pub use runner::{DispatchStats, StrategyRunner};
pub use strategy::{Config, ConfigValue, Context, ParamSpec, ParamValue, Strategy, StrategyFactory, StrategyRegistry};
pub use time::{DateTimeMs, Period};

pub use orderbook::{AccountId, Direction, InstrumentId, Order, OrderId, OrderStatus};
