//! Instrument registry: ticker → dense handle plus static trading parameters.

use orderbook::InstrumentId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, SimError};

fn default_lot_size() -> f64 {
    1.0
}

/// Static parameters for one tradable instrument, as read from config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub ticker: String,
    /// Decimal places of a price, e.g. 4 for 1.1355
    #[serde(default)]
    pub price_digits: u32,
    /// Decimal places of a volume figure
    #[serde(default)]
    pub volume_digits: u32,
    #[serde(default = "default_lot_size")]
    pub lot_size: f64,
    /// Margin rate, 0.02 = 2%
    #[serde(default)]
    pub margin: f64,
    /// Bid/ask only feed with no trade prints (FX style)
    #[serde(default)]
    pub quote_only: bool,
    /// Spread in price units added to forged ticks
    #[serde(default)]
    pub default_spread: f64,
}

impl InstrumentSpec {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            price_digits: 0,
            volume_digits: 0,
            lot_size: 1.0,
            margin: 0.0,
            quote_only: false,
            default_spread: 0.0,
        }
    }
}

/// Resolved view of an instrument used by the engine and the ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct Instrument {
    pub id: InstrumentId,
    pub ticker: String,
    pub price_scale: f64,  // 10^price_digits
    pub volume_scale: f64, // 10^volume_digits
    pub multiplier: f64,   // lot_size / volume_scale
    pub margin: f64,
    pub quote_only: bool,
    pub default_spread: f64,
}

impl Instrument {
    fn from_spec(id: InstrumentId, spec: &InstrumentSpec) -> Self {
        let price_scale = 10f64.powi(spec.price_digits as i32);
        let volume_scale = 10f64.powi(spec.volume_digits as i32);
        let lot = if spec.lot_size == 0.0 { 1.0 } else { spec.lot_size };
        Self {
            id,
            ticker: spec.ticker.clone(),
            price_scale,
            volume_scale,
            multiplier: lot / volume_scale,
            margin: spec.margin,
            quote_only: spec.quote_only,
            default_spread: spec.default_spread,
        }
    }

    /// Price in integer ticks, rounded to the nearest tick.
    pub fn to_ticks(&self, price: f64) -> i64 {
        (price * self.price_scale).round() as i64
    }

    pub fn from_ticks(&self, ticks: i64) -> f64 {
        ticks as f64 / self.price_scale
    }

    /// Realized or unrealized profit of `signed_qty` opened at `open` and
    /// closed at `close`.
    pub fn calc_profit(&self, open: f64, close: f64, signed_qty: i64) -> f64 {
        (close - open) * signed_qty as f64 * self.multiplier
    }

    /// Margin held by a position of `qty` at `price`.
    pub fn calc_margin(&self, price: f64, qty: i64) -> f64 {
        qty.unsigned_abs() as f64 * price * self.multiplier * self.margin
    }
}

/// Registration-ordered set of instruments. Ids are 1-based and dense.
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    instruments: Vec<Instrument>,
    by_ticker: HashMap<String, InstrumentId>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a InstrumentSpec>) -> Result<Self> {
        let mut reg = Self::new();
        for spec in specs {
            reg.register(spec)?;
        }
        Ok(reg)
    }

    pub fn register(&mut self, spec: &InstrumentSpec) -> Result<InstrumentId> {
        if self.by_ticker.contains_key(&spec.ticker) {
            return Err(SimError::Duplicate {
                kind: "instrument",
                name: spec.ticker.clone(),
            });
        }
        let id = InstrumentId(self.instruments.len() as u32 + 1);
        self.instruments.push(Instrument::from_spec(id, spec));
        self.by_ticker.insert(spec.ticker.clone(), id);
        Ok(id)
    }

    pub fn resolve(&self, ticker: &str) -> Result<&Instrument> {
        self.by_ticker
            .get(ticker)
            .and_then(|id| self.get(*id))
            .ok_or_else(|| SimError::UnknownSymbol(ticker.to_string()))
    }

    pub fn get(&self, id: InstrumentId) -> Option<&Instrument> {
        (id.0 as usize).checked_sub(1).and_then(|i| self.instruments.get(i))
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eurusd() -> InstrumentSpec {
        InstrumentSpec {
            price_digits: 4,
            quote_only: true,
            default_spread: 0.0002,
            margin: 0.02,
            ..InstrumentSpec::new("EURUSD")
        }
    }

    #[test]
    fn ids_are_dense_and_duplicates_rejected() {
        let mut reg = InstrumentRegistry::new();
        assert_eq!(reg.register(&eurusd()).unwrap(), InstrumentId(1));
        assert_eq!(reg.register(&InstrumentSpec::new("AAPL")).unwrap(), InstrumentId(2));
        assert!(matches!(
            reg.register(&eurusd()),
            Err(SimError::Duplicate { kind: "instrument", .. })
        ));
        assert_eq!(reg.resolve("AAPL").unwrap().id, InstrumentId(2));
        assert!(matches!(reg.resolve("MSFT"), Err(SimError::UnknownSymbol(_))));
        assert!(reg.get(InstrumentId(0)).is_none());
    }

    #[test]
    fn ticks_round_to_nearest() {
        let reg = InstrumentRegistry::from_specs(&[eurusd()]).unwrap();
        let eur = reg.resolve("EURUSD").unwrap();
        assert_eq!(eur.to_ticks(1.1355), 11355);
        assert_eq!(eur.to_ticks(1.13549999), 11355);
        assert!((eur.from_ticks(11355) - 1.1355).abs() < 1e-12);
    }

    #[test]
    fn profit_and_margin_use_multiplier() {
        let spec = InstrumentSpec {
            volume_digits: 2,
            lot_size: 100_000.0,
            margin: 0.02,
            ..InstrumentSpec::new("GBPUSD")
        };
        let reg = InstrumentRegistry::from_specs(&[spec]).unwrap();
        let gbp = reg.resolve("GBPUSD").unwrap();
        assert_eq!(gbp.multiplier, 1000.0);
        assert!((gbp.calc_profit(1.3000, 1.3010, 10) - 10.0).abs() < 1e-9);
        assert!((gbp.calc_profit(1.3000, 1.3010, -10) + 10.0).abs() < 1e-9);
        assert!((gbp.calc_margin(1.3, -10) - 260.0).abs() < 1e-9);
    }

    #[test]
    fn zero_lot_size_means_one() {
        let spec = InstrumentSpec { lot_size: 0.0, ..InstrumentSpec::new("X") };
        let reg = InstrumentRegistry::from_specs(&[spec]).unwrap();
        assert_eq!(reg.resolve("X").unwrap().multiplier, 1.0);
    }
}
