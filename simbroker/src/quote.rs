use dashmap::DashMap;
use orderbook::InstrumentId;
use serde::Serialize;

use crate::time::DateTimeMs;

/// Live quote for one instrument. Written by the replay loop only.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    // session stats, reset on day rollover
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub prev_close: f64,
    pub volume: u64,
    pub update_time: DateTimeMs,
}

impl Quote {
    pub fn update(&mut self, time: DateTimeMs, bid: f64, ask: f64, last: f64, volume: u64) {
        self.bid = bid;
        self.ask = ask;
        self.last = last;
        if self.open == 0.0 {
            self.open = last;
            self.high = last;
            self.low = last;
        } else {
            self.high = self.high.max(last);
            self.low = self.low.min(last);
        }
        self.volume += volume;
        self.update_time = time;
    }

    /// Starts a new session, carrying the last price into `prev_close`.
    pub fn rollover(&mut self) {
        if self.last != 0.0 {
            self.prev_close = self.last;
        }
        self.open = 0.0;
        self.high = 0.0;
        self.low = 0.0;
        self.volume = 0;
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// Concurrent map of live quotes. Readers get relaxed snapshots.
#[derive(Debug, Default)]
pub struct QuoteBoard {
    quotes: DashMap<InstrumentId, Quote>,
}

impl QuoteBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, id: InstrumentId, time: DateTimeMs, bid: f64, ask: f64, last: f64, volume: u64) {
        self.quotes
            .entry(id)
            .or_default()
            .update(time, bid, ask, last, volume);
    }

    pub fn get(&self, id: InstrumentId) -> Option<Quote> {
        self.quotes.get(&id).map(|q| q.value().clone())
    }

    pub fn rollover_all(&self) {
        for mut q in self.quotes.iter_mut() {
            q.rollover();
        }
    }

    pub fn clear(&self) {
        self.quotes.clear();
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}
