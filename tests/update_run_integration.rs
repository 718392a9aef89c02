//! Integration tests for the update coordinator pipeline
//!
//! Drives full coordinator passes against a real on-disk SQLite ledger
//! with a scripted market-data source: forecasts recorded, closes
//! reconciled, accuracy folded, lifecycle unwound. No network.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use std::collections::BTreeMap;
use std::sync::Arc;

use predictbot_backend::{
    forecast::ModelCache,
    models::{Config, ForecastPoint, LifecycleState},
    scrapers::market_data::{DailyClose, MarketData},
    storage::LedgerDb,
    updater::UpdateCoordinator,
};

/// Scripted quote source over a fixed trading-date axis.
struct ScriptedMarket {
    dates: Vec<String>,
    closes: BTreeMap<String, BTreeMap<String, f64>>,
}

impl ScriptedMarket {
    fn new(num_days: usize) -> Self {
        let start = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();
        let dates = (0..num_days)
            .map(|i| {
                start
                    .checked_add_days(Days::new(i as u64))
                    .unwrap()
                    .format("%Y-%m-%d")
                    .to_string()
            })
            .collect();
        Self {
            dates,
            closes: BTreeMap::new(),
        }
    }

    fn with_series(mut self, ticker: &str, closes: &[f64]) -> Self {
        assert_eq!(closes.len(), self.dates.len());
        let map = self
            .dates
            .iter()
            .cloned()
            .zip(closes.iter().copied())
            .collect();
        self.closes.insert(ticker.to_string(), map);
        self
    }

    fn date(&self, i: usize) -> &str {
        &self.dates[i]
    }
}

#[async_trait]
impl MarketData for ScriptedMarket {
    async fn close_price(&self, symbol: &str, date: &str) -> Result<f64> {
        self.closes
            .get(symbol)
            .and_then(|m| m.get(date))
            .copied()
            .with_context(|| format!("no close for {} on {}", symbol, date))
    }

    async fn trading_dates_since(&self, date: &str) -> Result<Vec<String>> {
        let dates: Vec<String> = self
            .dates
            .iter()
            .filter(|d| d.as_str() >= date)
            .cloned()
            .collect();
        if dates.is_empty() {
            bail!("no trading dates since {}", date);
        }
        Ok(dates)
    }

    async fn close_history(&self, symbol: &str, start_date: &str) -> Result<Vec<DailyClose>> {
        let map = self
            .closes
            .get(symbol)
            .with_context(|| format!("unknown symbol {}", symbol))?;
        Ok(map
            .iter()
            .filter(|(d, _)| d.as_str() >= start_date)
            .map(|(d, c)| DailyClose {
                date: d.clone(),
                close: *c,
            })
            .collect())
    }
}

fn config_for(tickers: &[&str], db_path: &str) -> Config {
    Config {
        database_path: db_path.to_string(),
        port: 0,
        tickers: tickers.iter().map(|s| s.to_string()).collect(),
        update_interval_secs: 86_400,
        history_start_date: "2025-03-03".to_string(),
        forecast_horizon: 5,
        model_cache_capacity: 8,
        quote_base_url: String::new(),
        calendar_ticker: "X".to_string(),
        image_dir: "static/images".to_string(),
    }
}

/// Closes [100, 102, 99] on the last three trading days, with a known
/// day-38 forecast of 101 for day 39 recommending long. Reconciling day 39
/// at 102 yields ape = |102-101|/102*100, a directional hit, and a
/// simulated balance of exactly 102.0.
#[tokio::test]
async fn known_forecast_scores_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ledger.db");
    let db_path = db_path.to_str().unwrap();

    let mut closes = vec![100.0; 40];
    closes[37] = 100.0;
    closes[38] = 102.0;
    closes[39] = 99.0;
    let market = ScriptedMarket::new(40).with_series("X", &closes);
    let day38 = market.date(37).to_string();
    let day39 = market.date(38).to_string();
    let day40 = market.date(39).to_string();

    let db = LedgerDb::new(db_path).unwrap();
    let coordinator = UpdateCoordinator::new(
        db.clone(),
        Arc::new(market),
        Arc::new(ModelCache::new(8)),
        config_for(&["X"], db_path),
    );

    // Day 38: bootstrap run (calendar, seeding, first forecast).
    let report = coordinator.run_as_of(&day38).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.today, 38);

    // Pin the day-38 -> day-39 forecast to the known values; the upsert
    // replaces the model's own row without duplicating it.
    db.predictions()
        .record_forecast(
            "X",
            38,
            &[ForecastPoint {
                day_offset: 1,
                predicted_close: 101.0,
                recommend_long: true,
            }],
        )
        .unwrap();

    // Days 39 and 40: reconcile and fold.
    coordinator.run_as_of(&day39).await.unwrap();
    let report = coordinator.run_as_of(&day40).await.unwrap();
    assert!(report.is_clean());
    assert!(report.backfilled >= 1);

    let row = db.predictions().prediction_for("X", 38, 39).unwrap().unwrap();
    assert_eq!(row.actual_close, Some(102.0));
    let ape = row.ape.expect("scored after the fold");
    assert!((ape - 100.0 / 102.0).abs() < 1e-9, "ape = {}", ape);

    let acc = db.accuracy().get("X", 39).unwrap().unwrap();
    assert_eq!(acc.buy_accuracy, Some(1));
    assert_eq!(acc.simulated_balance, Some(102.0));
    // Single known forecast so far, so MAPE equals its APE.
    assert!((acc.mape.unwrap() - ape).abs() < 1e-9);

    // The all-time summary landed on the instrument record.
    let model = db.instruments().find("X").unwrap().unwrap();
    assert_eq!(model.summary_balance, Some(102.0));
    assert_eq!(model.status, LifecycleState::Completed);
}

/// The stored balance series must be reproducible from the stored
/// prediction flags and closes alone.
#[tokio::test]
async fn balance_series_matches_replay_from_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ledger.db");
    let db_path = db_path.to_str().unwrap();

    let closes: Vec<f64> = (0..45)
        .map(|i| 100.0 + (i as f64 * 0.9).sin() * 4.0 + i as f64 * 0.2)
        .collect();
    let market = ScriptedMarket::new(45).with_series("X", &closes);
    let dates: Vec<String> = (38..45).map(|i| market.date(i).to_string()).collect();

    let db = LedgerDb::new(db_path).unwrap();
    let coordinator = UpdateCoordinator::new(
        db.clone(),
        Arc::new(market),
        Arc::new(ModelCache::new(8)),
        config_for(&["X"], db_path),
    );

    for date in &dates {
        let report = coordinator.run_as_of(date).await.unwrap();
        assert!(report.is_clean(), "run for {} not clean: {:?}", date, report);
    }

    // Replay the recurrence from raw ledger rows.
    let accuracy = db.accuracy();
    let predictions = db.predictions();
    let last_scored = accuracy.latest_populated("X").unwrap().unwrap().day;

    let mut balance = 100.0;
    for day in 2..=last_scored {
        if let Some(p) = predictions.prediction_for("X", day - 1, day).unwrap() {
            let today = accuracy.get("X", day).unwrap().unwrap().close.unwrap();
            let yesterday = accuracy.get("X", day - 1).unwrap().unwrap().close.unwrap();
            if p.recommend_long {
                balance = (balance * (1.0 + (today - yesterday) / yesterday) * 100.0).round() / 100.0;
            }
        }
        let stored = accuracy
            .get("X", day)
            .unwrap()
            .unwrap()
            .simulated_balance
            .unwrap();
        assert_eq!(stored, balance, "balance diverged at day {}", day);
    }
}

/// A run that observes a live lock must leave the ledger untouched.
#[tokio::test]
async fn locked_out_run_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ledger.db");
    let db_path = db_path.to_str().unwrap();

    let closes = vec![100.0; 40];
    let market = ScriptedMarket::new(40).with_series("X", &closes);
    let today = market.date(39).to_string();

    let db = LedgerDb::new(db_path).unwrap();
    let coordinator = UpdateCoordinator::new(
        db.clone(),
        Arc::new(market),
        Arc::new(ModelCache::new(8)),
        config_for(&["X"], db_path),
    );

    db.try_acquire_update_lock(40).unwrap();
    db.instruments().create_if_missing("X").unwrap();
    db.instruments()
        .set_status("X", LifecycleState::InProgress)
        .unwrap();

    let report = coordinator.run_as_of(&today).await.unwrap();
    assert!(report.locked_out);
    assert_eq!(db.predictions().count().unwrap(), 0);
    assert!(db.accuracy().get("X", 1).unwrap().is_none());
    assert_eq!(
        db.instruments().status("X").unwrap(),
        Some(LifecycleState::InProgress)
    );
}

/// Coordinator state survives a process boundary: a fresh handle over the
/// same file picks up exactly where the previous one stopped.
#[tokio::test]
async fn ledger_is_resumable_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ledger.db");
    let db_path = db_path.to_str().unwrap();

    let closes: Vec<f64> = (0..41).map(|i| 100.0 * 1.005f64.powi(i)).collect();

    {
        let market = ScriptedMarket::new(41).with_series("X", &closes);
        let day1 = market.date(39).to_string();
        let db = LedgerDb::new(db_path).unwrap();
        let coordinator = UpdateCoordinator::new(
            db,
            Arc::new(market),
            Arc::new(ModelCache::new(8)),
            config_for(&["X"], db_path),
        );
        coordinator.run_as_of(&day1).await.unwrap();
    }

    // "Restart": new connection, new cache, next trading day.
    let market = ScriptedMarket::new(41).with_series("X", &closes);
    let day2 = market.date(40).to_string();
    let db = LedgerDb::new(db_path).unwrap();
    let coordinator = UpdateCoordinator::new(
        db.clone(),
        Arc::new(market),
        Arc::new(ModelCache::new(8)),
        config_for(&["X"], db_path),
    );
    let report = coordinator.run_as_of(&day2).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.today, 41);

    // Artifact version carried over from the first process.
    let model = db.instruments().find("X").unwrap().unwrap();
    assert_eq!(model.version, 2);
    // Both runs' forecasts are present without duplicates.
    let open = db.predictions().find_unreconciled(100).unwrap();
    let days = open.get("X").unwrap();
    assert_eq!(days.first(), Some(&41));
    assert!(days.windows(2).all(|w| w[0] < w[1]));
}
