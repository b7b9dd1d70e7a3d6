//! Strategy plug-in contract, typed parameters and the strategy registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::bars::{BarSource, Bars};
use crate::broker::Broker;
use crate::error::{Result, SimError};
use crate::time::Period;

/// Config key holding the symbols a strategy trades.
pub const UNIVERSE: &str = "universe";

/// A value in a strategy's config store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

/// Typed default of a declared strategy parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "string",
        }
    }
}

impl From<ParamValue> for ConfigValue {
    fn from(v: ParamValue) -> Self {
        match v {
            ParamValue::Int(i) => ConfigValue::Int(i),
            ParamValue::Float(f) => ConfigValue::Float(f),
            ParamValue::Str(s) => ConfigValue::Str(s),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub default: ParamValue,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, default: ParamValue) -> Self {
        Self {
            name: name.into(),
            default,
        }
    }
}

/// Key/value store handed to a strategy at init.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    values: BTreeMap<String, ConfigValue>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared parameters with their defaults, overridden from `overrides`.
    ///
    /// Overrides must match the declared type; an int is accepted where a
    /// float is declared. `universe` may be a list or a single string.
    /// Undeclared keys are kept as given.
    pub fn from_params(specs: &[ParamSpec], overrides: &BTreeMap<String, ConfigValue>) -> Result<Self> {
        let mut cfg = Config::new();
        for spec in specs {
            let value: ConfigValue = match (overrides.get(&spec.name), &spec.default) {
                (None, d) => d.clone().into(),
                (Some(ConfigValue::Int(i)), ParamValue::Int(_)) => ConfigValue::Int(*i),
                (Some(ConfigValue::Int(i)), ParamValue::Float(_)) => ConfigValue::Float(*i as f64),
                (Some(ConfigValue::Float(f)), ParamValue::Float(_)) => ConfigValue::Float(*f),
                (Some(ConfigValue::Str(s)), ParamValue::Str(_)) => ConfigValue::Str(s.clone()),
                (Some(other), d) => {
                    return Err(SimError::Config(format!(
                        "parameter {}: expected {}, got {:?}",
                        spec.name,
                        d.kind(),
                        other
                    )))
                }
            };
            cfg.put(&spec.name, value);
        }
        for (key, value) in overrides {
            if specs.iter().any(|s| &s.name == key) {
                continue;
            }
            let value = match (key.as_str(), value) {
                (UNIVERSE, ConfigValue::Str(s)) => ConfigValue::List(vec![s.clone()]),
                (UNIVERSE, ConfigValue::List(_)) => value.clone(),
                (UNIVERSE, other) => {
                    return Err(SimError::Config(format!("universe must be a list of symbols, got {other:?}")))
                }
                _ => value.clone(),
            };
            cfg.put(key, value);
        }
        Ok(cfg)
    }

    pub fn put(&mut self, key: &str, value: ConfigValue) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_strings(&self, key: &str) -> Option<&[String]> {
        match self.values.get(key)? {
            ConfigValue::List(v) => Some(v),
            ConfigValue::Str(s) => Some(std::slice::from_ref(s)),
            _ => None,
        }
    }
}

/// What a strategy sees: its broker, its config and historical bars.
pub struct Context {
    broker: Arc<dyn Broker>,
    config: Config,
    bars: Arc<dyn BarSource>,
}

impl Context {
    pub fn new(broker: Arc<dyn Broker>, config: Config, bars: Arc<dyn BarSource>) -> Self {
        Self { broker, config, bars }
    }

    pub fn broker(&self) -> &dyn Broker {
        self.broker.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Completed bars of `symbol` as of the broker's current time.
    pub fn get_bars(&self, symbol: &str, period: Period) -> Result<Bars> {
        self.bars.bars(symbol, period, self.broker.time_current())
    }
}

/// A running strategy instance. Callbacks run on the runner's task, one at
/// a time.
pub trait Strategy: Send {
    fn on_tick(&mut self, ctx: &Context, symbol: &str);

    fn on_bar(&mut self, ctx: &Context, symbol: &str, period: Period);

    fn de_init(&mut self) {}
}

/// Creates strategy instances.
pub trait StrategyFactory: Send + Sync {
    fn param_set(&self) -> Vec<ParamSpec>;

    /// May adjust the config, e.g. narrow the `universe`.
    fn init(&self, ctx: &mut Context) -> Result<Box<dyn Strategy>>;
}

/// Name → strategy factory.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: HashMap<String, Arc<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn StrategyFactory>) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(SimError::Duplicate {
                kind: "strategy",
                name: name.to_string(),
            });
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StrategyFactory>> {
        self.factories.get(name).cloned().ok_or_else(|| SimError::NotRegistered {
            kind: "strategy",
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("fast", ParamValue::Int(5)),
            ParamSpec::new("threshold", ParamValue::Float(0.5)),
            ParamSpec::new("mode", ParamValue::Str("long".into())),
        ]
    }

    #[test]
    fn defaults_and_overrides() {
        let mut over = BTreeMap::new();
        over.insert("threshold".to_string(), ConfigValue::Int(2));
        over.insert(UNIVERSE.to_string(), ConfigValue::Str("EURUSD".into()));
        over.insert("extra".to_string(), ConfigValue::Float(1.5));

        let cfg = Config::from_params(&specs(), &over).unwrap();
        assert_eq!(cfg.get_int("fast"), Some(5));
        assert_eq!(cfg.get_float("threshold"), Some(2.0));
        assert_eq!(cfg.get_string("mode"), Some("long"));
        assert_eq!(cfg.get_strings(UNIVERSE), Some(&["EURUSD".to_string()][..]));
        assert_eq!(cfg.get_float("extra"), Some(1.5));
        assert_eq!(cfg.get_int("threshold"), None);
        assert_eq!(cfg.get_string("missing"), None);
    }

    #[test]
    fn wrong_override_type_is_rejected() {
        let mut over = BTreeMap::new();
        over.insert("fast".to_string(), ConfigValue::Str("five".into()));
        assert!(matches!(Config::from_params(&specs(), &over), Err(SimError::Config(_))));

        let mut over = BTreeMap::new();
        over.insert(UNIVERSE.to_string(), ConfigValue::Int(1));
        assert!(matches!(Config::from_params(&specs(), &over), Err(SimError::Config(_))));
    }

    struct Nop;

    impl StrategyFactory for Nop {
        fn param_set(&self) -> Vec<ParamSpec> {
            Vec::new()
        }

        fn init(&self, _ctx: &mut Context) -> Result<Box<dyn Strategy>> {
            Err(SimError::NoStrategy)
        }
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut reg = StrategyRegistry::new();
        reg.register("nop", Arc::new(Nop)).unwrap();
        assert!(matches!(
            reg.register("nop", Arc::new(Nop)),
            Err(SimError::Duplicate { kind: "strategy", .. })
        ));
        assert!(reg.get("nop").is_ok());
        assert!(matches!(reg.get("other"), Err(SimError::NotRegistered { .. })));
        assert_eq!(reg.names(), vec!["nop".to_string()]);
    }
}
