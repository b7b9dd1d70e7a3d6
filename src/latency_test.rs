//! Performance testing suite for the order book and the replay engine.
//!
//! Measures latency and throughput under various scenarios:
//! - Best price lookup, order insert, tick sweep, resting cross, removal
//! - Replay throughput in ticks per second with resting orders on the book
//! - Statistical analysis with multiple iterations

use orderbook::{Direction, OrderBook, OrderId, Resting, Side};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simbroker::{
    DateTimeMs, InstrumentRegistry, InstrumentSpec, Period, RunStats, SimConfig, Simulator, TickSeries, TickValue,
};
use std::sync::Arc;
use std::time::Instant;

/// Runs complete latency test suite.
pub fn run_latency_tests() {
    println!(" Tick Replay Lab - Order Book Latency Tests\n");

    test_market_data_latency();
    test_order_insert_latency();
    test_sweep_latency();
    test_cross_latency();
    test_removal_latency();
}

fn create_order(id: u64, side: Side, price: i64, qty: i64) -> Resting {
    Resting {
        id: OrderId(id),
        side,
        px_ticks: price,
        qty,
    }
}

fn populated_book(depth: u64) -> OrderBook {
    let mut ob = OrderBook::new();
    for i in 0..depth {
        let _ = ob.insert(create_order(i + 1, Side::Ask, 10000 + i as i64, 100));
        let _ = ob.insert(create_order(depth + i + 1, Side::Bid, 9999 - i as i64, 100));
    }
    ob
}

/// Tests best bid/ask lookup performance.
fn test_market_data_latency() {
    println!(" Market Data Latency Test");

    let ob = populated_book(100);
    let iterations = 1_000_000;

    let start = Instant::now();
    for _ in 0..iterations {
        std::hint::black_box(ob.best_bid());
    }
    let bid_duration = start.elapsed();

    let start = Instant::now();
    for _ in 0..iterations {
        std::hint::black_box(ob.best_ask());
    }
    let ask_duration = start.elapsed();

    println!("  Best bid lookup: {:.2} ns/call", bid_duration.as_nanos() as f64 / iterations as f64);
    println!("  Best ask lookup: {:.2} ns/call", ask_duration.as_nanos() as f64 / iterations as f64);
    println!(
        "  Combined latency: {:.2} ns\n",
        (bid_duration.as_nanos() + ask_duration.as_nanos()) as f64 / iterations as f64
    );
}

/// Tests insert latency into a book of 100 levels per side.
fn test_order_insert_latency() {
    println!(" Order Insert Latency Test");

    let iterations = 10_000u64;
    let mut ob = populated_book(100);
    let mut total_time = 0u128;

    for i in 0..iterations {
        let order = create_order(1_000 + i, Side::Bid, 9900 - (i % 50) as i64, 100);
        let start = Instant::now();
        let _ = ob.insert(order);
        total_time += start.elapsed().as_nanos();
    }

    let avg_latency = total_time as f64 / iterations as f64;
    println!("  Average order insert: {:.2} ns", avg_latency);
    println!("  Throughput: {:.0} orders/second\n", 1_000_000_000.0 / avg_latency);
}

/// Tests one tick sweeping ten resting asks.
fn test_sweep_latency() {
    println!(" Tick Sweep Latency Test");

    let iterations = 1_000;
    let mut total_setup_time = 0u128;
    let mut total_sweep_time = 0u128;

    for _ in 0..iterations {
        let setup_start = Instant::now();
        let mut ob = OrderBook::new();
        for j in 0..10u64 {
            let _ = ob.insert(create_order(j + 1, Side::Ask, 10000 + j as i64, 100));
        }
        total_setup_time += setup_start.elapsed().as_nanos();

        let sweep_start = Instant::now();
        let swept = ob.sweep_crossable(Side::Ask, 10009);
        total_sweep_time += sweep_start.elapsed().as_nanos();

        std::hint::black_box(swept);
    }

    println!("  Setup (10 resting orders): {:.2} ns", total_setup_time as f64 / iterations as f64);
    println!("  Sweep of 10 orders: {:.2} ns", total_sweep_time as f64 / iterations as f64);
    println!(
        "  Total tick-to-fill: {:.2} ns\n",
        (total_setup_time + total_sweep_time) as f64 / iterations as f64
    );
}

/// Tests matching a crossed book of ten bids against ten asks.
fn test_cross_latency() {
    println!(" Resting Cross Latency Test");

    let iterations = 1_000;
    let mut total_time = 0u128;
    let mut crosses = 0usize;

    for _ in 0..iterations {
        let mut ob = OrderBook::new();
        for j in 0..10u64 {
            let _ = ob.insert(create_order(j + 1, Side::Ask, 10000 + j as i64, 50));
            let _ = ob.insert(create_order(j + 11, Side::Bid, 10010 - j as i64, 70));
        }

        let start = Instant::now();
        let matched = ob.cross_resting();
        total_time += start.elapsed().as_nanos();
        crosses += matched.len();
    }

    println!("  Cross of 20 orders: {:.2} ns", total_time as f64 / iterations as f64);
    println!("  Trades per cross: {:.1}\n", crosses as f64 / iterations as f64);
}

/// Tests removing half of a single price level by id.
fn test_removal_latency() {
    println!(" Cancellation Latency Test");

    let iterations = 1_000u64;
    let orders_per_test = 100u64;
    let mut total_time = 0u128;

    for i in 0..iterations {
        let mut ob = OrderBook::new();
        let mut orders = Vec::new();
        for j in 0..orders_per_test {
            let order = create_order(i * orders_per_test + j + 1, Side::Bid, 10000, 100);
            orders.push(order);
            let _ = ob.insert(order);
        }

        let start = Instant::now();
        for order in orders.iter().step_by(2) {
            std::hint::black_box(ob.remove(order));
        }
        total_time += start.elapsed().as_nanos();
    }

    println!(
        "  Removal by id: {:.2} ns per order\n",
        total_time as f64 / (iterations * orders_per_test / 2) as f64
    );
}

/// Random-walk ticks, one per second, spread of two ticks.
fn synthetic_ticks(count: usize, seed: u64) -> TickSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut series = TickSeries::new();
    let mut last = 10_000i64;
    for i in 0..count {
        last = (last + rng.gen_range(-3..=3)).max(100);
        series.push(
            DateTimeMs::from_secs(i as i64),
            TickValue {
                bid: last - 1,
                ask: last + 1,
                last,
                volume: rng.gen_range(1..50),
            },
        );
    }
    series
}

/// Replays `ticks` synthetic ticks over `symbols` instruments while
/// `accounts` accounts keep limit orders resting around the market.
async fn replay(symbols: usize, ticks: usize, accounts: usize) -> Option<RunStats> {
    let specs: Vec<InstrumentSpec> = (0..symbols)
        .map(|i| InstrumentSpec {
            price_digits: 2,
            ..InstrumentSpec::new(format!("SYM{i}"))
        })
        .collect();
    let registry = InstrumentRegistry::from_specs(&specs).ok()?;
    let sim = Simulator::new(Arc::new(registry), 1_000_000.0);

    for (i, spec) in specs.iter().enumerate() {
        sim.add_feed(&spec.ticker, Box::new(synthetic_ticks(ticks, i as u64))).ok()?;
    }

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..accounts {
        let account = sim.open(None);
        for spec in &specs {
            for k in 0..20 {
                let (dir, px) = if k % 2 == 0 {
                    (Direction::Buy, 100.0 - rng.gen_range(0.0..0.5))
                } else {
                    (Direction::Sell, 100.0 + rng.gen_range(0.0..0.5))
                };
                sim.send_order(account, &spec.ticker, dir, 1, px, 0.0).ok()?;
            }
        }
    }

    let config = SimConfig {
        period: Period::Min5,
        ..SimConfig::default()
    };
    sim.start(&config).ok()?;
    sim.wait().await
}

/// Runs replay throughput tests at increasing sizes.
pub async fn run_replay_throughput_test() {
    println!(" Replay Throughput Test");

    for &(symbols, ticks, accounts) in &[(1usize, 100_000usize, 1usize), (4, 100_000, 4), (16, 50_000, 8)] {
        match replay(symbols, ticks, accounts).await {
            Some(stats) => {
                println!(
                    "  {} symbols x {} ticks, {} accounts: {:.0} ticks/second ({} fills, {} bar events)",
                    symbols,
                    ticks,
                    accounts,
                    stats.ticks_per_sec(),
                    stats.fills,
                    stats.bar_events
                );
                if let Ok(json) = serde_json::to_string(&stats) {
                    tracing::debug!(stats = %json, "replay finished");
                }
            }
            None => println!("  {} symbols x {} ticks: replay failed", symbols, ticks),
        }
    }
    println!();
}

/// Runs sustained throughput test with mixed workload.
pub fn run_throughput_test(secs: u64) {
    println!(" Sustained Book Throughput Test ({} seconds)", secs);

    let mut ob = OrderBook::new();
    let mut order_id = 1u64;
    let mut orders_processed = 0u64;
    let mut fills = 0u64;

    let start_time = Instant::now();
    let duration = std::time::Duration::from_secs(secs);

    while start_time.elapsed() < duration {
        // 25% each of resting bids, resting asks, bid-side sweeps, ask-side sweeps
        match order_id % 4 {
            0 => {
                let _ = ob.insert(create_order(order_id, Side::Bid, 9999 - (order_id % 100) as i64, 100));
            }
            1 => {
                let _ = ob.insert(create_order(order_id, Side::Ask, 10001 + (order_id % 100) as i64, 100));
            }
            2 => {
                fills += ob.sweep_crossable(Side::Bid, 9999 - (order_id % 7) as i64).len() as u64;
            }
            3 => {
                fills += ob.sweep_crossable(Side::Ask, 10001 + (order_id % 7) as i64).len() as u64;
            }
            _ => unreachable!(),
        }

        order_id += 1;
        orders_processed += 1;

        if order_id % 100 == 0 {
            std::hint::black_box(ob.best_bid());
            std::hint::black_box(ob.best_ask());
        }
    }

    let elapsed = start_time.elapsed();

    println!("  Duration: {:.1} seconds", elapsed.as_secs_f64());
    println!("  Operations processed: {}", orders_processed);
    println!("  Orders filled: {}", fills);
    println!("  Operation throughput: {:.0} ops/second", orders_processed as f64 / elapsed.as_secs_f64());
    println!("  Fill throughput: {:.0} fills/second", fills as f64 / elapsed.as_secs_f64());
    println!("  Final book state: bid={:?}, ask={:?}", ob.best_bid(), ob.best_ask());
}
