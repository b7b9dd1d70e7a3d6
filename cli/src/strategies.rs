//! Built-in strategies.

use simbroker::{
    Context, Direction, ParamSpec, ParamValue, Period, SimError, Strategy, StrategyFactory, StrategyRegistry,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub fn register_all(reg: &mut StrategyRegistry) -> simbroker::Result<()> {
    reg.register(MaCross::NAME, Arc::new(MaCrossFactory))
}

fn sma(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Fast/slow simple moving average cross on closed bars. Goes long when
/// the fast average crosses above the slow one, short when it crosses
/// below.
pub struct MaCross {
    fast: usize,
    slow: usize,
    size: i64,
    /// Closed bars already evaluated per symbol
    seen: HashMap<String, usize>,
}

impl MaCross {
    pub const NAME: &'static str = "ma_cross";

    /// +1 on a cross up, -1 on a cross down between the last two bars.
    fn signal(&self, closes: &[f64]) -> i32 {
        let n = closes.len();
        if n < self.slow + 1 {
            return 0;
        }
        let now = sma(&closes[n - self.fast..]) - sma(&closes[n - self.slow..]);
        let before = sma(&closes[n - 1 - self.fast..n - 1]) - sma(&closes[n - 1 - self.slow..n - 1]);
        if before <= 0.0 && now > 0.0 {
            1
        } else if before >= 0.0 && now < 0.0 {
            -1
        } else {
            0
        }
    }

    fn target(&self, ctx: &Context, symbol: &str, want: i64) {
        let broker = ctx.broker();
        let held = broker.get_position(symbol).qty;
        if held == want {
            return;
        }
        let mut orders = Vec::new();
        if held > 0 {
            orders.push((Direction::Close, held));
        } else if held < 0 {
            orders.push((Direction::Cover, -held));
        }
        if want > 0 {
            orders.push((Direction::Buy, want));
        } else if want < 0 {
            orders.push((Direction::Sell, -want));
        }
        for (dir, qty) in orders {
            match broker.send_order(symbol, dir, qty, 0.0, 0.0) {
                Ok(id) => debug!(symbol, %dir, qty, order = %id, "ma_cross order"),
                Err(e) => warn!(symbol, error = %e, "ma_cross order rejected"),
            }
        }
    }
}

impl Strategy for MaCross {
    fn on_tick(&mut self, _ctx: &Context, _symbol: &str) {}

    fn on_bar(&mut self, ctx: &Context, symbol: &str, period: Period) {
        let bars = match ctx.get_bars(symbol, period) {
            Ok(b) => b,
            Err(e) => {
                debug!(symbol, %period, error = %e, "no bars");
                return;
            }
        };
        // the replay may be ahead of this event, so check every new bar
        let closes = &bars.close;
        let seen = self.seen.insert(symbol.to_string(), closes.len()).unwrap_or(0);
        let signal = ((seen + 1)..=closes.len())
            .map(|n| self.signal(&closes[..n]))
            .filter(|s| *s != 0)
            .last()
            .unwrap_or(0);
        match signal {
            1 => self.target(ctx, symbol, self.size),
            -1 => self.target(ctx, symbol, -self.size),
            _ => {}
        }
    }
}

pub struct MaCrossFactory;

impl StrategyFactory for MaCrossFactory {
    fn param_set(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("fast", ParamValue::Int(5)),
            ParamSpec::new("slow", ParamValue::Int(20)),
            ParamSpec::new("size", ParamValue::Int(1)),
        ]
    }

    fn init(&self, ctx: &mut Context) -> simbroker::Result<Box<dyn Strategy>> {
        let cfg = ctx.config();
        let fast = cfg.get_int("fast").unwrap_or(5);
        let slow = cfg.get_int("slow").unwrap_or(20);
        let size = cfg.get_int("size").unwrap_or(1);
        if fast < 1 || slow <= fast {
            return Err(SimError::Config(format!("ma_cross needs 0 < fast < slow, got {fast}/{slow}")));
        }
        if size < 1 {
            return Err(SimError::Config(format!("ma_cross size {size} must be positive")));
        }
        Ok(Box::new(MaCross {
            fast: fast as usize,
            slow: slow as usize,
            size,
            seen: HashMap::new(),
        }))
    }
}
