//! Tick replay sources.
//!
//! The engine drives any [`TickSource`]: a positioned, time-ordered
//! sequence of ticks for one instrument. [`TickSeries`] is the in-memory
//! implementation, filled from decoded files or forged from bars.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::bars::Bars;
use crate::error::{Result, SimError};
use crate::instrument::Instrument;
use crate::time::DateTimeMs;

/// Prices of one tick in integer ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickValue {
    pub bid: i64,
    pub ask: i64,
    pub last: i64,
    pub volume: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tick {
    pub time: DateTimeMs,
    pub value: TickValue,
}

/// Cursor over one instrument's ticks.
///
/// `time` and `tick_value` read the tick under the cursor and panic when
/// the cursor is past the end; check `left() > 0` first.
pub trait TickSource: Send {
    fn len(&self) -> usize;

    /// Ticks from the cursor (inclusive) to the end.
    fn left(&self) -> usize;

    fn time(&self) -> DateTimeMs;

    fn time_at(&self, index: usize) -> DateTimeMs;

    /// Moves to the next tick. Returns false at end of stream.
    fn advance(&mut self) -> bool;

    fn tick_value(&self) -> TickValue;

    fn reset(&mut self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Skips every tick before `t`. Returns false if none is left.
    fn seek(&mut self, t: DateTimeMs) -> bool {
        while self.left() > 0 && self.time() < t {
            if !self.advance() {
                return false;
            }
        }
        self.left() > 0
    }
}

/// Supplies tick sources for subscribed instruments that have none yet.
/// Called at most once per simulator, on the first start.
pub trait FeedLoader: Send + Sync {
    fn load(&self, instrument: &Instrument) -> Result<Option<Box<dyn TickSource>>>;
}

/// Vec-backed tick source.
#[derive(Clone, Debug, Default)]
pub struct TickSeries {
    ticks: Vec<Tick>,
    pos: usize,
}

impl TickSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ticks(ticks: Vec<Tick>) -> Self {
        Self { ticks, pos: 0 }
    }

    pub fn push(&mut self, time: DateTimeMs, value: TickValue) {
        self.ticks.push(Tick { time, value });
    }

    /// Convenience for quote-style ticks, `last` is the bid.
    pub fn push_quote(&mut self, time: DateTimeMs, bid: i64, ask: i64, volume: u64) {
        self.push(time, TickValue { bid, ask, last: bid, volume });
    }

    pub fn ticks(&self) -> &[Tick] {
        &self.ticks
    }

    /// Builds four ticks per bar: open at the bar start, high and low at
    /// random offsets inside the bar, close one millisecond before its end.
    /// Volume is split 3/8, 1/8, 1/8, 3/8.
    pub fn forge_from_bars(bars: &Bars, instrument: &Instrument, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let span = bars.period.millis();
        let spread = if instrument.quote_only {
            instrument.to_ticks(instrument.default_spread)
        } else {
            0
        };
        let mut series = Self::new();
        series.ticks.reserve(bars.len() * 4);

        for i in 0..bars.len() {
            let t0 = bars.time[i];
            // 0 < a < b < span - 1
            let (a, b) = if span > 3 {
                let a = rng.gen_range(1..span - 2);
                (a, rng.gen_range(a + 1..span - 1))
            } else {
                (1, 2)
            };
            let (first, second) = if rng.gen_bool(0.5) {
                (bars.high[i], bars.low[i])
            } else {
                (bars.low[i], bars.high[i])
            };
            let vol = bars.volume[i].max(0.0) as u64;
            let quarter = vol / 8;
            let rows = [
                (t0, bars.open[i], vol * 3 / 8),
                (t0 + a, first, quarter),
                (t0 + b, second, quarter),
                (t0 + (span - 1), bars.close[i], vol - vol * 3 / 8 - 2 * quarter),
            ];
            for (t, px, v) in rows {
                let bid = instrument.to_ticks(px);
                series.push(
                    t,
                    TickValue {
                        bid,
                        ask: bid + spread,
                        last: bid,
                        volume: v,
                    },
                );
            }
        }
        series
    }
}

impl TickSource for TickSeries {
    fn len(&self) -> usize {
        self.ticks.len()
    }

    fn left(&self) -> usize {
        self.ticks.len().saturating_sub(self.pos)
    }

    fn time(&self) -> DateTimeMs {
        self.ticks[self.pos].time
    }

    fn time_at(&self, index: usize) -> DateTimeMs {
        self.ticks[index].time
    }

    fn advance(&mut self) -> bool {
        if self.pos < self.ticks.len() {
            self.pos += 1;
        }
        self.pos < self.ticks.len()
    }

    fn tick_value(&self) -> TickValue {
        self.ticks[self.pos].value
    }

    fn reset(&mut self) {
        self.pos = 0;
    }
}

/// Summary produced by [`validate_feed`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FeedReport {
    pub symbol: String,
    pub ticks: usize,
    pub first: Option<DateTimeMs>,
    pub last: Option<DateTimeMs>,
    pub min_bid: f64,
    pub max_ask: f64,
}

/// Checks that timestamps never go backwards and reports the price range.
/// The source is rewound before and after the scan.
pub fn validate_feed(src: &mut dyn TickSource, instrument: &Instrument) -> Result<FeedReport> {
    src.reset();
    let mut report = FeedReport {
        symbol: instrument.ticker.clone(),
        ticks: src.len(),
        first: None,
        last: None,
        min_bid: 0.0,
        max_ask: 0.0,
    };
    if src.left() == 0 {
        return Ok(report);
    }

    let mut min_bid = i64::MAX;
    let mut max_ask = i64::MIN;
    let mut prev = src.time();
    report.first = Some(prev);
    let mut index = 0;
    loop {
        let t = src.time();
        if t < prev {
            src.reset();
            return Err(SimError::TickOrder {
                symbol: instrument.ticker.clone(),
                index,
            });
        }
        let v = src.tick_value();
        if v.bid > 0 {
            min_bid = min_bid.min(v.bid);
        }
        max_ask = max_ask.max(v.ask);
        prev = t;
        index += 1;
        if !src.advance() {
            break;
        }
    }
    src.reset();

    report.last = Some(prev);
    if min_bid != i64::MAX {
        report.min_bid = instrument.from_ticks(min_bid);
    }
    report.max_ask = instrument.from_ticks(max_ask);
    Ok(report)
}
