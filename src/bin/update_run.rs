//! One-shot update runner
//!
//! Runs a single coordinator pass and exits, for deployments that prefer
//! an external scheduler (cron, systemd timers) over the in-process loop.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin update_run -- --db ./predictbot.db --tickers AAPL,MSFT
//! cargo run --bin update_run -- --as-of 2025-07-02
//! ```
//!
//! # Exit Codes
//!
//! - 0: Pass completed cleanly
//! - 1: Pass completed with erroneous instruments (retried next run)
//! - 2: Another run holds the update lock
//! - 3: Runtime error (database, calendar source)

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use predictbot_backend::{
    forecast::ModelCache,
    models::Config,
    scrapers::{market_data::MarketData, stooq::StooqClient},
    storage::LedgerDb,
    updater::UpdateCoordinator,
};

#[derive(Debug, Parser)]
#[command(name = "update_run", about = "Run one forecast update pass and exit")]
struct Args {
    /// Ledger database path (falls back to DATABASE_PATH, then ./predictbot.db)
    #[arg(long, env = "DATABASE_PATH")]
    db: Option<String>,

    /// Comma-separated tickers to track (falls back to TICKERS)
    #[arg(long, value_delimiter = ',')]
    tickers: Option<Vec<String>>,

    /// Run as of this ISO date instead of today (useful for backfills)
    #[arg(long, value_name = "YYYY-MM-DD")]
    as_of: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "predictbot_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("Update run failed: {:#}", e);
            3
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(tickers) = args.tickers {
        config.tickers = tickers
            .iter()
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();
    }

    let db = LedgerDb::new(&config.database_path)?;
    let market: Arc<dyn MarketData> = Arc::new(
        StooqClient::new(&config.quote_base_url, &config.calendar_ticker)
            .context("Failed to build quote client")?,
    );
    let cache = Arc::new(ModelCache::new(config.model_cache_capacity));
    let coordinator = UpdateCoordinator::new(db, market, cache, config);

    let report = match &args.as_of {
        Some(date) => coordinator.run_as_of(date).await?,
        None => coordinator.run().await?,
    };

    if report.locked_out {
        info!("Another update run is active; nothing to do");
        return Ok(2);
    }

    info!(
        "Day {}: {} backfilled, {} refreshed, {} accuracy rows",
        report.today,
        report.backfilled,
        report.updated.len(),
        report.accuracy_rows
    );

    if report.erroneous.is_empty() {
        Ok(0)
    } else {
        for (ticker, err) in &report.erroneous {
            warn!("{}: {}", ticker, err);
        }
        Ok(1)
    }
}
