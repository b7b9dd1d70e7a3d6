use orderbook::{BookError, OrderId, OrderStatus};
use thiserror::Error;

use crate::engine::EngineState;
use crate::time::Period;

/// Errors returned by the simulated broker and its collaborators.
#[derive(Debug, Error)]
pub enum SimError {
    // configuration / identity
    #[error("symbol not found: {0}")]
    UnknownSymbol(String),

    #[error("{kind} already registered: {name}")]
    Duplicate { kind: &'static str, name: String },

    #[error("{kind} not registered: {name}")]
    NotRegistered { kind: &'static str, name: String },

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("invalid period {0} for this operation")]
    InvalidPeriod(Period),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // state
    #[error("simulator is {0}, operation not allowed")]
    EngineState(EngineState),

    #[error("can't cancel order {0}: already {1:?}")]
    CannotCancel(OrderId, OrderStatus),

    #[error("start must be called from inside a tokio runtime")]
    NoRuntime,

    #[error("runner has no event channel")]
    NoEventChannel,

    #[error("no strategy loaded")]
    NoStrategy,

    #[error("strategy task failed: {0}")]
    TaskFailed(String),

    // not found
    #[error("no such order {0}")]
    NoSuchOrder(OrderId),

    #[error("no cached base bars for {symbol} at {period}")]
    NoBaseBars { symbol: String, period: Period },

    #[error("tick data for {0} does not exist")]
    NoTickData(String),

    #[error("tick data for {symbol} out of order at index {index}")]
    TickOrder { symbol: String, index: usize },

    #[error(transparent)]
    Book(#[from] BookError),
}

pub type Result<T> = std::result::Result<T, SimError>;
