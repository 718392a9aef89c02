//! Forecasting collaborator
//!
//! The coordinator only ever sees the [`Forecaster`] trait: retrain on a
//! close-price history, emit a multi-day forecast, round-trip through an
//! opaque blob for the model table. The shipped implementation is the
//! drift model in [`drift`]; [`cache`] holds deserialized models between
//! runs.

pub mod cache;
pub mod drift;

pub use cache::{ModelCache, ModelHandle};
pub use drift::DriftForecaster;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::ForecastPoint;

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &'static str;

    /// Refit on the full close-price history (oldest first).
    fn retrain(&mut self, history: &[f64]) -> Result<()>;

    /// Multi-day forecast from the end of `history`: one point per
    /// day-offset 1..=horizon, each with its own long/flat call.
    fn forecast(&self, history: &[f64]) -> Result<Vec<ForecastPoint>>;

    /// Serialized artifact for the model table.
    fn to_blob(&self) -> Result<Vec<u8>>;
}

/// Tagged envelope stored in the model table, so future model kinds can
/// live side by side with already-persisted artifacts.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ModelArtifact {
    Drift(DriftForecaster),
}

pub fn new_default(horizon: usize) -> Box<dyn Forecaster> {
    Box::new(DriftForecaster::new(horizon))
}

pub fn from_blob(blob: &[u8]) -> Result<Box<dyn Forecaster>> {
    let artifact: ModelArtifact =
        serde_json::from_slice(blob).context("Failed to deserialize model artifact")?;
    Ok(match artifact {
        ModelArtifact::Drift(m) => Box::new(m),
    })
}

pub(crate) fn drift_to_blob(model: &DriftForecaster) -> Result<Vec<u8>> {
    serde_json::to_vec(&ModelArtifact::Drift(model.clone()))
        .context("Failed to serialize model artifact")
}

/// Human-readable recommendation from the projected move over the whole
/// forecast window, in the spirit of a buy/hold/sell call.
pub fn recommendation_text(last_close: f64, forecast: &[ForecastPoint]) -> String {
    let Some(last) = forecast.last() else {
        return "HOLD — no forecast available".to_string();
    };
    let pct = (last.predicted_close / last_close - 1.0) * 100.0;
    let days = forecast.len();

    if pct >= 1.0 {
        format!("BUY — projected {:+.2}% over {} trading days", pct, days)
    } else if pct <= -1.0 {
        format!("SELL — projected {:+.2}% over {} trading days", pct, days)
    } else {
        format!("HOLD — projected {:+.2}% over {} trading days", pct, days)
    }
}
