//! Read-only instrument API
//!
//! The front end never mutates the ledger, with one narrow, documented
//! exception: reading an instrument whose display state is `pending`
//! flips it to `completed`, so the very next read sees fresh state.
//! Internal failures surface as a generic "temporarily unavailable"
//! recommendation rather than a 5xx with internals attached.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;
use tracing::warn;

use super::AppState;
use crate::models::{InstrumentModel, LifecycleState};

#[derive(Debug, Serialize)]
pub struct ChartRefs {
    pub history: String,
    pub prediction: String,
}

#[derive(Debug, Serialize)]
pub struct InstrumentView {
    pub ticker: String,
    pub recommendation: String,
    pub lifecycle_state: LifecycleState,
    pub last_update_day: i64,
    pub charts: ChartRefs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_mape: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_accuracy_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_balance: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct InstrumentsResponse {
    pub instruments: Vec<InstrumentView>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

const UNAVAILABLE: &str = "Recommendation temporarily unavailable - please retry shortly";
const NOT_TRAINED: &str = "Not yet trained - check back after the next update run";

fn chart_refs(image_dir: &str, ticker: &str) -> ChartRefs {
    ChartRefs {
        history: format!("{}/{}_history.png", image_dir, ticker),
        prediction: format!("{}/{}_prediction.png", image_dir, ticker),
    }
}

fn view_of(model: &InstrumentModel, image_dir: &str) -> InstrumentView {
    let recommendation = match model.status {
        LifecycleState::New => NOT_TRAINED.to_string(),
        _ if model.recommendation.is_empty() => NOT_TRAINED.to_string(),
        _ => model.recommendation.clone(),
    };
    InstrumentView {
        ticker: model.ticker.clone(),
        recommendation,
        lifecycle_state: model.status,
        last_update_day: model.last_update_day,
        charts: chart_refs(image_dir, &model.ticker),
        summary_mape: model.summary_mape,
        summary_accuracy_pct: model.summary_accuracy_pct,
        summary_balance: model.summary_balance,
    }
}

/// GET /api/instruments - every tracked instrument with its summary.
pub async fn get_instruments(
    State(state): State<AppState>,
) -> Result<Json<InstrumentsResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.db.instruments().all() {
        Ok(models) => {
            let instruments: Vec<InstrumentView> = models
                .iter()
                .map(|m| view_of(m, &state.config.image_dir))
                .collect();
            let count = instruments.len();
            Ok(Json(InstrumentsResponse { instruments, count }))
        }
        Err(e) => {
            warn!("Instrument listing failed: {:#}", e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: UNAVAILABLE.to_string(),
                }),
            ))
        }
    }
}

/// GET /api/instruments/:ticker - one instrument's recommendation,
/// lifecycle state and chart references. Observing `pending` flips the
/// instrument to `completed` as a side effect.
pub async fn get_instrument(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
) -> Result<Json<InstrumentView>, (StatusCode, Json<ErrorResponse>)> {
    let ticker = ticker.trim().to_uppercase();
    let store = state.db.instruments();

    let model = match store.find(&ticker) {
        Ok(Some(m)) => m,
        Ok(None) => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("Unknown instrument {}", ticker),
                }),
            ));
        }
        Err(e) => {
            warn!("Instrument read failed for {}: {:#}", ticker, e);
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: UNAVAILABLE.to_string(),
                }),
            ));
        }
    };

    if model.status == LifecycleState::Pending {
        if let Err(e) = store.set_status(&ticker, LifecycleState::Completed) {
            warn!("Failed to complete {} on read: {:#}", ticker, e);
        }
    }

    Ok(Json(view_of(&model, &state.config.image_dir)))
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "🔮 PredictBot Operational"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Config;
    use crate::storage::LedgerDb;

    fn test_state() -> AppState {
        let db = LedgerDb::new(":memory:").unwrap();
        let config = Config {
            database_path: ":memory:".to_string(),
            port: 0,
            tickers: vec!["AAPL".to_string()],
            update_interval_secs: 86_400,
            history_start_date: "2025-01-01".to_string(),
            forecast_horizon: 5,
            model_cache_capacity: 8,
            quote_base_url: String::new(),
            calendar_ticker: "AAPL".to_string(),
            image_dir: "static/images".to_string(),
        };
        AppState { db, config }
    }

    #[tokio::test]
    async fn unknown_instrument_is_404() {
        let state = test_state();
        let result = get_instrument(State(state), Path("zzzz".to_string())).await;
        let (status, _) = result.err().expect("should be an error");
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn new_instrument_reads_as_not_trained() {
        let state = test_state();
        state.db.instruments().create_if_missing("AAPL").unwrap();

        let view = get_instrument(State(state), Path("aapl".to_string()))
            .await
            .expect("known instrument")
            .0;
        assert_eq!(view.lifecycle_state, LifecycleState::New);
        assert!(view.recommendation.contains("Not yet trained"));
        assert!(view.charts.prediction.ends_with("AAPL_prediction.png"));
    }

    #[tokio::test]
    async fn pending_read_flips_to_completed() {
        let state = test_state();
        let store = state.db.instruments();
        store.create_if_missing("AAPL").unwrap();
        store.set_status("AAPL", LifecycleState::InProgress).unwrap();
        store.set_status("AAPL", LifecycleState::Pending).unwrap();
        store.save("AAPL", b"blob", "BUY - projected +2.00%", 5).unwrap();

        let view = get_instrument(State(state.clone()), Path("AAPL".to_string()))
            .await
            .expect("known instrument")
            .0;
        // The observed state is pending; the stored state has advanced.
        assert_eq!(view.lifecycle_state, LifecycleState::Pending);
        assert_eq!(
            state.db.instruments().status("AAPL").unwrap(),
            Some(LifecycleState::Completed)
        );

        let view = get_instrument(State(state), Path("AAPL".to_string()))
            .await
            .expect("known instrument")
            .0;
        assert_eq!(view.lifecycle_state, LifecycleState::Completed);
        assert!(view.recommendation.starts_with("BUY"));
    }

    #[tokio::test]
    async fn listing_includes_summaries() {
        let state = test_state();
        let store = state.db.instruments();
        store.create_if_missing("AAPL").unwrap();
        store.create_if_missing("MSFT").unwrap();
        store.set_summary("AAPL", 1.5, 60.0, 104.2).unwrap();

        let resp = get_instruments(State(state)).await.expect("listing").0;
        assert_eq!(resp.count, 2);
        let aapl = resp
            .instruments
            .iter()
            .find(|v| v.ticker == "AAPL")
            .unwrap();
        assert_eq!(aapl.summary_balance, Some(104.2));
        assert_eq!(aapl.summary_accuracy_pct, Some(60.0));
    }
}
