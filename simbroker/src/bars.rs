//! OHLCV bar series and the resample-on-demand cache behind
//! `Context::get_bars`.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{Result, SimError};
use crate::time::{DateTimeMs, Period};

/// Column-oriented bar series. `time` is each bar's period-aligned start.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Bars {
    pub period: Period,
    pub time: Vec<DateTimeMs>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl Bars {
    pub fn new(period: Period) -> Self {
        Self {
            period,
            time: Vec::new(),
            open: Vec::new(),
            high: Vec::new(),
            low: Vec::new(),
            close: Vec::new(),
            volume: Vec::new(),
        }
    }

    pub fn push(&mut self, time: DateTimeMs, open: f64, high: f64, low: f64, close: f64, volume: f64) {
        self.time.push(time);
        self.open.push(open);
        self.high.push(high);
        self.low.push(low);
        self.close.push(close);
        self.volume.push(volume);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Aggregates into a coarser period. Bars are bucketed by `period.floor`.
    pub fn resample(&self, period: Period) -> Result<Bars> {
        if period < self.period {
            return Err(SimError::InvalidPeriod(period));
        }
        if period == self.period {
            return Ok(self.clone());
        }
        let mut out = Bars::new(period);
        let mut bucket: Option<DateTimeMs> = None;
        for i in 0..self.len() {
            let start = period.floor(self.time[i]);
            if bucket == Some(start) {
                let last = out.len() - 1;
                out.high[last] = out.high[last].max(self.high[i]);
                out.low[last] = out.low[last].min(self.low[i]);
                out.close[last] = self.close[i];
                out.volume[last] += self.volume[i];
            } else {
                out.push(start, self.open[i], self.high[i], self.low[i], self.close[i], self.volume[i]);
                bucket = Some(start);
            }
        }
        Ok(out)
    }

    /// Bars whose period has fully elapsed at `now`.
    pub fn completed_before(&self, now: DateTimeMs) -> Bars {
        let n = self
            .time
            .iter()
            .take_while(|t| self.period.next_boundary(**t) <= now)
            .count();
        Bars {
            period: self.period,
            time: self.time[..n].to_vec(),
            open: self.open[..n].to_vec(),
            high: self.high[..n].to_vec(),
            low: self.low[..n].to_vec(),
            close: self.close[..n].to_vec(),
            volume: self.volume[..n].to_vec(),
        }
    }
}

/// Read access to historical bars for strategies.
pub trait BarSource: Send + Sync {
    /// Bars of `symbol` at `period` that completed before `now`.
    fn bars(&self, symbol: &str, period: Period, now: DateTimeMs) -> Result<Bars>;
}

/// Base Min1 or Daily series per symbol, resampled lazily and cached.
#[derive(Default)]
pub struct BarCache {
    base: DashMap<(String, Period), Arc<Bars>>,
    resampled: DashMap<(String, Period), Arc<Bars>>,
}

impl BarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a base series. Only Min1 and Daily are accepted as bases.
    pub fn insert_base(&self, symbol: &str, bars: Bars) -> Result<()> {
        if !matches!(bars.period, Period::Min1 | Period::Daily) {
            return Err(SimError::InvalidPeriod(bars.period));
        }
        let key = (symbol.to_string(), bars.period);
        self.resampled.retain(|(s, _), _| s != symbol);
        self.base.insert(key, Arc::new(bars));
        Ok(())
    }

    fn base_for(&self, symbol: &str, period: Period) -> Option<Arc<Bars>> {
        let daily = || self.base.get(&(symbol.to_string(), Period::Daily)).map(|b| b.clone());
        let min1 = || self.base.get(&(symbol.to_string(), Period::Min1)).map(|b| b.clone());
        if period.is_intraday() {
            min1()
        } else {
            daily().or_else(min1)
        }
    }

    /// Full series at `period`, resampling from the base on first use.
    pub fn series(&self, symbol: &str, period: Period) -> Result<Arc<Bars>> {
        let key = (symbol.to_string(), period);
        if let Some(hit) = self.resampled.get(&key) {
            return Ok(hit.clone());
        }
        let base = self.base_for(symbol, period).ok_or_else(|| SimError::NoBaseBars {
            symbol: symbol.to_string(),
            period,
        })?;
        let bars = if base.period == period {
            base
        } else {
            Arc::new(base.resample(period)?)
        };
        self.resampled.insert(key, bars.clone());
        Ok(bars)
    }
}

impl BarSource for BarCache {
    fn bars(&self, symbol: &str, period: Period, now: DateTimeMs) -> Result<Bars> {
        Ok(self.series(symbol, period)?.completed_before(now))
    }
}
