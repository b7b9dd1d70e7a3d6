//! CSV tick files.
//!
//! Columns: `time,bid,ask,last,volume`. `time` is epoch milliseconds or a
//! date/time string, prices are decimals. An empty `last` takes the bid.

use anyhow::{Context, Result};
use serde::Deserialize;
use simbroker::{
    BarCache, Bars, DateTimeMs, FeedLoader, Instrument, Period, SimError, TickSeries, TickSource, TickValue,
};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct TickRow {
    time: String,
    bid: f64,
    ask: f64,
    #[serde(default)]
    last: Option<f64>,
    #[serde(default)]
    volume: Option<u64>,
}

fn parse_time(s: &str) -> Result<DateTimeMs> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(DateTimeMs(ms));
    }
    Ok(DateTimeMs::parse(s)?)
}

pub fn read_ticks<R: Read>(rdr: R, instrument: &Instrument) -> Result<TickSeries> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(rdr);
    let mut series = TickSeries::new();
    for (i, row) in rdr.deserialize::<TickRow>().enumerate() {
        let row = row.with_context(|| format!("tick row {}", i + 1))?;
        let time = parse_time(&row.time).with_context(|| format!("tick row {} time", i + 1))?;
        let bid = instrument.to_ticks(row.bid);
        series.push(
            time,
            TickValue {
                bid,
                ask: instrument.to_ticks(row.ask),
                last: row.last.map_or(bid, |px| instrument.to_ticks(px)),
                volume: row.volume.unwrap_or(0),
            },
        );
    }
    Ok(series)
}

pub fn load_ticks(path: &Path, instrument: &Instrument) -> Result<TickSeries> {
    let file = std::fs::File::open(path).with_context(|| format!("open tick csv: {}", path.display()))?;
    read_ticks(file, instrument).with_context(|| format!("read tick csv: {}", path.display()))
}

/// Min1 bars built from the last price of each tick.
pub fn minute_bars(ticks: &TickSeries, instrument: &Instrument) -> Bars {
    let mut bars = Bars::new(Period::Min1);
    let mut current: Option<(DateTimeMs, f64, f64, f64, f64, f64)> = None;
    for tick in ticks.ticks() {
        let px = instrument.from_ticks(tick.value.last);
        let start = Period::Min1.floor(tick.time);
        match current.as_mut() {
            Some((t, _, high, low, close, volume)) if *t == start => {
                *high = high.max(px);
                *low = low.min(px);
                *close = px;
                *volume += tick.value.volume as f64;
            }
            _ => {
                if let Some((t, o, h, l, c, v)) = current.take() {
                    bars.push(t, o, h, l, c, v);
                }
                current = Some((start, px, px, px, px, tick.value.volume as f64));
            }
        }
    }
    if let Some((t, o, h, l, c, v)) = current {
        bars.push(t, o, h, l, c, v);
    }
    bars
}

/// Loads the configured CSV file of an instrument on the first start and
/// caches its minute bars for strategies.
pub struct CsvFeedLoader {
    paths: HashMap<String, PathBuf>,
    bars: Arc<BarCache>,
}

impl CsvFeedLoader {
    pub fn new(paths: HashMap<String, PathBuf>, bars: Arc<BarCache>) -> Self {
        Self { paths, bars }
    }
}

impl FeedLoader for CsvFeedLoader {
    fn load(&self, instrument: &Instrument) -> simbroker::Result<Option<Box<dyn TickSource>>> {
        let Some(path) = self.paths.get(&instrument.ticker) else {
            return Ok(None);
        };
        let ticks = load_ticks(path, instrument).map_err(|e| SimError::Config(format!("{e:#}")))?;
        self.bars.insert_base(&instrument.ticker, minute_bars(&ticks, instrument))?;
        info!(symbol = %instrument.ticker, ticks = ticks.ticks().len(), "feed loaded");
        Ok(Some(Box::new(ticks)))
    }
}
