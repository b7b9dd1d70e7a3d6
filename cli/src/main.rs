//! Command line front end for the tick-replay simulator.
//!
//! Commands:
//! - `run`: replay the configured feeds through the configured strategies
//! - `validate`: check one CSV tick file and report its range

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use simbroker::{
    AccountSummary, AppConfig, BarCache, BookDump, BrokerRegistry, DispatchStats, InstrumentRegistry,
    InstrumentSpec, OrderStats, RunStats, SimBrokerFactory, Simulator, StrategyRegistry, StrategyRunner,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod feeds;
mod strategies;

const SIM_BROKER: &str = "simBroker";

#[derive(Parser)]
#[command(name = "atsim-cli")]
#[command(about = "Tick-replay backtester - runs strategies against a simulated broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay the feeds of a TOML config through its strategies.
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Also print the final order book of every instrument.
        #[arg(long, default_value_t = false)]
        books: bool,
    },
    /// Check a CSV tick file for time order and print its price range.
    Validate {
        #[arg(short = 's', long)]
        symbol: String,
        #[arg(short, long)]
        file: PathBuf,
        /// Take the instrument definition from this config.
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 2)]
        price_digits: u32,
    },
}

#[derive(Serialize)]
struct RunReport {
    run: RunStats,
    dispatch: DispatchStats,
    orders: OrderStats,
    accounts: Vec<AccountSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    books: Vec<BookDump>,
}

async fn run_backtest(config: &Path, books: bool) -> Result<RunReport> {
    let cfg = AppConfig::load(config).with_context(|| format!("load config: {}", config.display()))?;
    let Some(runner_cfg) = cfg.runner.as_ref() else {
        bail!("config has no [runner] section");
    };
    let registry = Arc::new(InstrumentRegistry::from_specs(&cfg.instruments)?);
    let sim = Simulator::new(registry.clone(), cfg.sim.fund);

    let bars = Arc::new(BarCache::new());
    let paths: HashMap<String, PathBuf> = cfg.feeds.iter().map(|f| (f.symbol.clone(), f.path.clone())).collect();
    sim.set_feed_loader(Arc::new(feeds::CsvFeedLoader::new(paths, bars.clone())));

    let mut brokers = BrokerRegistry::new();
    brokers.register(SIM_BROKER, Arc::new(SimBrokerFactory::new(sim.clone())))?;
    let mut strats = StrategyRegistry::new();
    strategies::register_all(&mut strats)?;

    let mut runner = StrategyRunner::load(runner_cfg, &brokers, &strats, bars)?;
    info!(symbols = ?runner.symbols(), "starting replay");
    runner.run_strategy(&cfg.sim)?;

    let stopper = sim.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt(&stopper);
        }
    });
    let run = sim.wait().await.unwrap_or_default();
    ctrl_c.abort();
    let dispatch = runner.stop_strategy().await?;

    let books = if books {
        registry
            .iter()
            .map(|inst| sim.dump_order_book(&inst.ticker))
            .collect::<simbroker::Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    Ok(RunReport {
        run,
        dispatch,
        orders: sim.dump_order_stats(),
        accounts: sim.account_summaries(),
        books,
    })
}

/// Stops the replay on Ctrl-C.
fn interrupt(sim: &Simulator) -> bool {
    warn!("interrupted, stopping replay");
    match sim.stop() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "stop failed");
            false
        }
    }
}

fn validate(symbol: &str, file: &Path, config: Option<&Path>, price_digits: u32) -> Result<simbroker::FeedReport> {
    let registry = match config {
        Some(path) => {
            let cfg = AppConfig::load(path).with_context(|| format!("load config: {}", path.display()))?;
            InstrumentRegistry::from_specs(&cfg.instruments)?
        }
        None => InstrumentRegistry::from_specs(&[InstrumentSpec {
            price_digits,
            ..InstrumentSpec::new(symbol)
        }])?,
    };
    let inst = registry.resolve(symbol)?;
    let mut ticks = feeds::load_ticks(file, inst)?;
    Ok(simbroker::validate_feed(&mut ticks, inst)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, books } => {
            let report = run_backtest(&config, books).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Validate {
            symbol,
            file,
            config,
            price_digits,
        } => {
            let report = validate(&symbol, &file, config.as_deref(), price_digits)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
