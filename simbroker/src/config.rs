//! TOML configuration.
//!
//! ```toml
//! [sim]
//! start = "2018-01-02"
//! end = "2018-02-01"
//! period = "Min5"
//! emit_ticks = false
//! fund = 10000.0
//!
//! [[instrument]]
//! ticker = "EURUSD"
//! price_digits = 5
//! quote_only = true
//!
//! [[feed]]
//! symbol = "EURUSD"
//! path = "data/eurusd.csv"
//!
//! [runner]
//! broker = "simBroker"
//! strategies = ["ma_cross"]
//! event_buffer = 10
//!
//! [strategy.ma_cross]
//! universe = ["EURUSD"]
//! fast = 5
//! ```

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SimError};
use crate::event::DEFAULT_EVENT_BUFFER;
use crate::instrument::InstrumentSpec;
use crate::strategy::ConfigValue;
use crate::time::{DateTimeMs, Period};

#[derive(Deserialize)]
#[serde(untagged)]
enum TimeRepr {
    Millis(i64),
    Text(String),
}

fn de_opt_time<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<DateTimeMs>, D::Error> {
    match Option::<TimeRepr>::deserialize(d)? {
        None => Ok(None),
        Some(TimeRepr::Millis(ms)) => Ok(Some(DateTimeMs(ms))),
        Some(TimeRepr::Text(s)) => DateTimeMs::parse(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

fn default_period() -> Period {
    Period::Min1
}

fn default_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

fn default_fund() -> f64 {
    10_000.0
}

/// Replay window and event options for one simulator run.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    /// First tick time considered, inclusive
    #[serde(default, deserialize_with = "de_opt_time")]
    pub start: Option<DateTimeMs>,
    /// Last tick time replayed, inclusive
    #[serde(default, deserialize_with = "de_opt_time")]
    pub end: Option<DateTimeMs>,
    #[serde(default = "default_period")]
    pub period: Period,
    #[serde(default)]
    pub emit_ticks: bool,
    /// Starting fund of each opened account
    #[serde(default = "default_fund")]
    pub fund: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            period: default_period(),
            emit_ticks: false,
            fund: default_fund(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if let (Some(s), Some(e)) = (self.start, self.end) {
            if e <= s {
                return Err(SimError::Config(format!("end {e} is not after start {s}")));
            }
        }
        Ok(())
    }
}

/// Which broker a runner opens and which strategies it drives.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct RunnerConfig {
    pub broker: String,
    #[serde(default)]
    pub strategies: Vec<String>,
    /// Capacity of the event channel the runner creates
    #[serde(default = "default_buffer")]
    pub event_buffer: usize,
    /// Parameter overrides per strategy, from the `[strategy.<name>]` tables
    #[serde(skip)]
    pub params: BTreeMap<String, BTreeMap<String, ConfigValue>>,
}

/// A CSV tick file for one instrument.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FeedSpec {
    pub symbol: String,
    pub path: PathBuf,
}

/// Everything in one config file.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(default, rename = "instrument")]
    pub instruments: Vec<InstrumentSpec>,
    #[serde(default, rename = "feed")]
    pub feeds: Vec<FeedSpec>,
    #[serde(default)]
    pub runner: Option<RunnerConfig>,
    #[serde(default)]
    strategy: BTreeMap<String, BTreeMap<String, ConfigValue>>,
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: AppConfig = toml::from_str(s)?;
        cfg.sim.validate()?;
        let params = std::mem::take(&mut cfg.strategy);
        if let Some(runner) = cfg.runner.as_mut() {
            runner.params = params;
        }
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [sim]
        start = "2018-01-02"
        end = 1517443200000
        period = "Min5"

        [[instrument]]
        ticker = "EURUSD"
        price_digits = 5
        quote_only = true
        default_spread = 0.0002

        [[instrument]]
        ticker = "ES"
        lot_size = 50.0

        [[feed]]
        symbol = "EURUSD"
        path = "data/eurusd.csv"

        [runner]
        broker = "simBroker"
        strategies = ["ma_cross"]

        [strategy.ma_cross]
        universe = ["EURUSD", "ES"]
        fast = 5
        threshold = 0.5
        label = "x"
    "#;

    #[test]
    fn parses_full_file() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.sim.start, Some(DateTimeMs::parse("2018-01-02").unwrap()));
        assert_eq!(cfg.sim.end, Some(DateTimeMs(1_517_443_200_000)));
        assert_eq!(cfg.sim.period, Period::Min5);
        assert!(!cfg.sim.emit_ticks);
        assert_eq!(cfg.instruments.len(), 2);
        assert_eq!(cfg.instruments[1].lot_size, 50.0);
        assert_eq!(cfg.instruments[0].lot_size, 1.0);
        assert_eq!(cfg.feeds[0].path, PathBuf::from("data/eurusd.csv"));

        let runner = cfg.runner.unwrap();
        assert_eq!(runner.broker, "simBroker");
        assert_eq!(runner.event_buffer, DEFAULT_EVENT_BUFFER);
        let params = &runner.params["ma_cross"];
        assert_eq!(params["fast"], ConfigValue::Int(5));
        assert_eq!(params["threshold"], ConfigValue::Float(0.5));
        assert_eq!(params["label"], ConfigValue::Str("x".into()));
        assert_eq!(params["universe"], ConfigValue::List(vec!["EURUSD".into(), "ES".into()]));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.sim, SimConfig::default());
        assert!(cfg.runner.is_none());
    }

    #[test]
    fn rejects_bad_window_and_bad_time() {
        let err = AppConfig::from_toml_str("[sim]\nstart = 200\nend = 100\n").unwrap_err();
        assert!(matches!(err, SimError::Config(_)));
        assert!(matches!(
            AppConfig::from_toml_str("[sim]\nstart = \"someday\"\n"),
            Err(SimError::Toml(_))
        ));
    }

    #[test]
    fn event_buffer_belongs_to_runner() {
        let cfg = AppConfig::from_toml_str("[runner]\nbroker = \"simBroker\"\nevent_buffer = 3\n").unwrap();
        assert_eq!(cfg.runner.unwrap().event_buffer, 3);
        assert!(matches!(
            AppConfig::from_toml_str("[sim]\nevent_buffer = 3\n"),
            Err(SimError::Toml(_))
        ));
    }
}
