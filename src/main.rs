//! PredictBot - daily stock forecast ledger
//!
//! Tracks multi-day price forecasts per instrument, reconciles them
//! against realized closes, and serves running accuracy metrics over a
//! read-only API. A scheduled coordinator task refreshes every model once
//! per trading day; the persisted ledger makes the whole pipeline
//! resumable after a crash.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::{env, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::interval};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use predictbot_backend::{
    api::{self, AppState},
    forecast::ModelCache,
    models::Config,
    scrapers::{market_data::MarketData, stooq::StooqClient},
    storage::LedgerDb,
    updater::UpdateCoordinator,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 PredictBot starting - forecast ledger + update coordinator");

    let mut config = Config::from_env()?;

    // IMPORTANT: This defaults to the crate directory so running from
    // elsewhere doesn't accidentally create a new empty DB in a different
    // working directory.
    let db_path = resolve_data_path(env::var("DATABASE_PATH").ok(), "predictbot.db");
    config.database_path = db_path.clone();

    let db = LedgerDb::new(&db_path)?;
    info!(
        "📈 Tracking {} instrument(s): {}",
        config.tickers.len(),
        config.tickers.join(", ")
    );

    let market: Arc<dyn MarketData> = Arc::new(
        StooqClient::new(&config.quote_base_url, &config.calendar_ticker)
            .context("Failed to build quote client")?,
    );
    let cache = Arc::new(ModelCache::new(config.model_cache_capacity));

    let coordinator = UpdateCoordinator::new(db.clone(), market, cache, config.clone());
    tokio::spawn(update_polling(coordinator, config.update_interval_secs));

    let app_state = AppState {
        db,
        config: config.clone(),
    };

    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/api/instruments", get(api::get_instruments))
        .route("/api/instruments/:ticker", get(api::get_instrument))
        .with_state(app_state)
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Scheduled update loop. The first tick fires immediately so a restart
/// catches up right away; after that the coordinator's own lock keeps
/// overlapping ticks harmless.
async fn update_polling(coordinator: UpdateCoordinator, poll_secs: u64) {
    info!(
        "⏱️ Update coordinator polling every {}s",
        poll_secs.max(60)
    );
    let mut ticker = interval(Duration::from_secs(poll_secs.max(60)));

    loop {
        ticker.tick().await;
        match coordinator.run().await {
            Ok(report) if report.locked_out => {
                info!("🔒 Update tick skipped - another run is active");
            }
            Ok(report) => {
                info!(
                    "📊 Update tick done (day {}): {} backfilled, {} refreshed, {} accuracy rows, {} erroneous",
                    report.today,
                    report.backfilled,
                    report.updated.len(),
                    report.accuracy_rows,
                    report.erroneous.len()
                );
            }
            Err(e) => warn!("Update tick failed: {:#}", e),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "predictbot_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    // Treat relative paths as relative to the crate dir, not the caller's cwd.
    base.join(p).to_string_lossy().to_string()
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try the crate-root .env (common when running with
    //    --manifest-path from elsewhere).
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
