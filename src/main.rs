//! Tick Replay Performance Lab
//!
//! Runs order book latency tests, replay throughput tests, then a short
//! demo of one account trading against replayed ticks.

use simbroker::{Direction, InstrumentRegistry, InstrumentSpec, SimConfig, Simulator, TickSeries};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod latency_test;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("=== Tick Replay Performance Lab ===");

    latency_test::run_latency_tests();
    latency_test::run_replay_throughput_test().await;
    latency_test::run_throughput_test(10);

    println!("\n=== Basic Demo ===");
    if let Err(e) = run_basic_demo().await {
        println!("demo failed: {e}");
    }
}

/// One buy limit filled by the first crossing tick, then marked to market.
async fn run_basic_demo() -> simbroker::Result<()> {
    let registry = InstrumentRegistry::from_specs(&[InstrumentSpec {
        price_digits: 2,
        ..InstrumentSpec::new("AAPL")
    }])?;
    let sim = Simulator::new(Arc::new(registry), 100_000.0);

    let mut ticks = TickSeries::new();
    for (i, px) in [15050, 15020, 14990, 15010, 15080].into_iter().enumerate() {
        ticks.push_quote(simbroker::DateTimeMs::from_secs(60 * i as i64), px, px + 2, 100);
    }
    sim.add_feed("AAPL", Box::new(ticks))?;

    let account = sim.open(None);
    let id = sim.send_order(account, "AAPL", Direction::Buy, 10, 150.00, 0.0)?;
    println!("Submitted buy limit {}: 10 @ 150.00", id);

    sim.start(&SimConfig::default())?;
    let stats = sim.wait().await.unwrap_or_default();
    println!("Ticks replayed: {}", stats.ticks);

    if let Some(order) = sim.get_order(id) {
        println!("Order {}: {:?}, filled {} @ {:.2}", id, order.status, order.qty_filled, order.avg_fill_price);
    }
    let pos = sim.get_position(account, "AAPL");
    println!("Position: {} @ {:.2}", pos.qty, pos.avg_price);
    println!("Equity: {:.2}", sim.equity(account));
    println!("{}", sim.dump_accounts());
    Ok(())
}
