use serde::Serialize;
use tokio::sync::mpsc;

use crate::time::{DateTimeMs, Period};

/// Buffer of an account's event channel unless configured otherwise.
pub const DEFAULT_EVENT_BUFFER: usize = 10;

/// What the replay loop tells strategy runners.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum QuoteEvent {
    /// The quote of `symbol` changed at `time`.
    Tick { symbol: String, time: DateTimeMs },
    /// The bar of `period` starting at `bar_time` has closed.
    BarClose {
        symbol: String,
        period: Period,
        bar_time: DateTimeMs,
    },
    /// Replay finished, sent once per channel.
    EndOfStream,
}

impl QuoteEvent {
    /// Numeric event id: 0 for ticks, the period in seconds for bar
    /// closes, -1 for end of stream.
    pub fn code(&self) -> i64 {
        match self {
            QuoteEvent::Tick { .. } => 0,
            QuoteEvent::BarClose { period, .. } => period.secs(),
            QuoteEvent::EndOfStream => -1,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            QuoteEvent::Tick { symbol, .. } | QuoteEvent::BarClose { symbol, .. } => Some(symbol),
            QuoteEvent::EndOfStream => None,
        }
    }
}

pub type EventSender = mpsc::Sender<QuoteEvent>;
pub type EventReceiver = mpsc::Receiver<QuoteEvent>;

pub fn channel(buffer: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(buffer.max(1))
}

/// Waits for room in the channel. Returns false once the receiver is gone.
pub async fn deliver(tx: &EventSender, ev: QuoteEvent) -> bool {
    tx.send(ev).await.is_ok()
}
