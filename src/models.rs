use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-instrument display freshness.
///
/// `new` has never been trained; `in_progress` is being refreshed by the
/// coordinator; `pending` means a fresh forecast exists but no client has
/// seen it yet; `completed` means the display is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    New,
    InProgress,
    Pending,
    Completed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::New => "new",
            LifecycleState::InProgress => "in_progress",
            LifecycleState::Pending => "pending",
            LifecycleState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(LifecycleState::New),
            "in_progress" => Some(LifecycleState::InProgress),
            "pending" => Some(LifecycleState::Pending),
            "completed" => Some(LifecycleState::Completed),
            _ => None,
        }
    }

    /// Legal forward transitions. Force-completion during coordinator
    /// cleanup bypasses this check deliberately.
    pub fn can_advance_to(&self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (LifecycleState::New, LifecycleState::InProgress)
                | (LifecycleState::Completed, LifecycleState::InProgress)
                | (LifecycleState::Pending, LifecycleState::InProgress)
                | (LifecycleState::InProgress, LifecycleState::Pending)
                | (LifecycleState::Pending, LifecycleState::Completed)
        )
    }
}

/// One tracked instrument: serialized model artifact, last human-readable
/// recommendation, display freshness, and the all-time accuracy summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentModel {
    pub ticker: String,
    #[serde(skip)]
    pub model_blob: Vec<u8>,
    pub recommendation: String,
    pub last_update_day: i64,
    pub status: LifecycleState,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_mape: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_accuracy_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_balance: Option<f64>,
}

impl InstrumentModel {
    /// Fresh record for a first-seen ticker.
    pub fn new(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            model_blob: Vec::new(),
            recommendation: String::new(),
            last_update_day: 0,
            status: LifecycleState::New,
            version: 0,
            summary_mape: None,
            summary_accuracy_pct: None,
            summary_balance: None,
        }
    }
}

/// One forecast row: a price predicted on `from_day` for `for_day`.
/// `actual_close` and `ape` stay empty until the target day is reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRow {
    pub id: i64,
    pub ticker: String,
    pub from_day: i64,
    pub for_day: i64,
    pub predicted_close: f64,
    pub actual_close: Option<f64>,
    pub recommend_long: bool,
    pub ape: Option<f64>,
}

/// One accuracy row per (ticker, day). Day 1 is the seed row: metrics empty,
/// balance 100.0. Rows are filled exactly once and never recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAccuracyRow {
    pub ticker: String,
    pub day: i64,
    pub close: Option<f64>,
    pub mape: Option<f64>,
    pub buy_accuracy: Option<i64>,
    pub simulated_balance: Option<f64>,
}

/// One step of a multi-day forecast, `day_offset` >= 1 counted from the day
/// the forecast was made.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub day_offset: i64,
    pub predicted_close: f64,
    pub recommend_long: bool,
}

/// Summary of one coordinator pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Trading day number the run executed as.
    pub today: i64,
    /// True when another run held the lock and this one exited early.
    pub locked_out: bool,
    /// (ticker, day) pairs that got their actual close filled in.
    pub backfilled: usize,
    /// Tickers that completed a retrain + forecast cycle.
    pub updated: Vec<String>,
    /// Daily accuracy rows computed this pass.
    pub accuracy_rows: usize,
    /// Ticker -> first error encountered; these are retried next run.
    pub erroneous: BTreeMap<String, String>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        !self.locked_out && self.erroneous.is_empty()
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub tickers: Vec<String>,
    pub update_interval_secs: u64,
    pub history_start_date: String,
    pub forecast_horizon: usize,
    pub model_cache_capacity: usize,
    pub quote_base_url: String,
    pub calendar_ticker: String,
    pub image_dir: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./predictbot.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let tickers: Vec<String> = std::env::var("TICKERS")
            .unwrap_or_else(|_| "AAPL,META,AMZN,NFLX,GOOGL".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let update_interval_secs = std::env::var("UPDATE_INTERVAL_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .unwrap_or(86_400);

        let history_start_date =
            std::env::var("HISTORY_START_DATE").unwrap_or_else(|_| "2017-01-01".to_string());

        let forecast_horizon = std::env::var("FORECAST_HORIZON")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        let model_cache_capacity = std::env::var("MODEL_CACHE_CAPACITY")
            .unwrap_or_else(|_| "32".to_string())
            .parse()
            .unwrap_or(32);

        let quote_base_url =
            std::env::var("QUOTE_BASE_URL").unwrap_or_else(|_| "https://stooq.com".to_string());

        // The calendar source downloads this ticker's history and uses its
        // quote dates as the trading-day list.
        let calendar_ticker =
            std::env::var("CALENDAR_TICKER").unwrap_or_else(|_| "AAPL".to_string());

        let image_dir =
            std::env::var("IMAGE_DIR").unwrap_or_else(|_| "static/images".to_string());

        Ok(Self {
            database_path,
            port,
            tickers,
            update_interval_secs,
            history_start_date,
            forecast_horizon,
            model_cache_capacity,
            quote_base_url,
            calendar_ticker,
            image_dir,
        })
    }
}
