//! Drift model
//!
//! Ridge regression of the next daily return on a window of lagged
//! returns, rolled out iteratively for multi-day forecasts: each predicted
//! return is appended to the window and fed back in, the same way the
//! original single-step model is chained over the horizon. Deterministic
//! given the same history.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::Forecaster;
use crate::models::ForecastPoint;

/// Lagged returns fed into the regression.
const LAGS: usize = 10;

/// Tikhonov regularization; keeps the normal equations solvable even on
/// near-constant return series.
const RIDGE_LAMBDA: f64 = 1e-4;

/// Daily returns outside this band are treated as data glitches and
/// clamped before fitting.
const RETURN_CLAMP: f64 = 0.25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftForecaster {
    horizon: usize,
    lags: usize,
    /// Intercept followed by one weight per lag; empty until trained.
    weights: Vec<f64>,
    trained_samples: usize,
}

impl DriftForecaster {
    pub fn new(horizon: usize) -> Self {
        Self {
            horizon: horizon.max(1),
            lags: LAGS,
            weights: Vec::new(),
            trained_samples: 0,
        }
    }

    pub fn is_trained(&self) -> bool {
        !self.weights.is_empty()
    }

    fn returns(history: &[f64]) -> Vec<f64> {
        history
            .windows(2)
            .map(|w| (w[1] / w[0] - 1.0).clamp(-RETURN_CLAMP, RETURN_CLAMP))
            .collect()
    }

    fn predict_return(&self, window: &[f64]) -> f64 {
        let mut r = self.weights[0];
        for (k, w) in self.weights[1..].iter().enumerate() {
            // window is oldest-first; lag 1 is the most recent return.
            r += w * window[window.len() - 1 - k];
        }
        r.clamp(-RETURN_CLAMP, RETURN_CLAMP)
    }
}

impl Forecaster for DriftForecaster {
    fn name(&self) -> &'static str {
        "drift"
    }

    fn retrain(&mut self, history: &[f64]) -> Result<()> {
        if history.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            bail!("Price history contains invalid closes");
        }

        let returns = Self::returns(history);
        if returns.len() < self.lags + 2 {
            bail!(
                "Need at least {} closes to fit, got {}",
                self.lags + 3,
                history.len()
            );
        }

        let samples = returns.len() - self.lags;
        let cols = self.lags + 1;

        let mut x = DMatrix::<f64>::zeros(samples, cols);
        let mut y = DVector::<f64>::zeros(samples);
        for i in 0..samples {
            x[(i, 0)] = 1.0;
            for k in 0..self.lags {
                // Column k+1 holds lag k+1: the return k+1 steps back.
                x[(i, k + 1)] = returns[i + self.lags - 1 - k];
            }
            y[i] = returns[i + self.lags];
        }

        let xtx = x.transpose() * &x + DMatrix::<f64>::identity(cols, cols) * RIDGE_LAMBDA;
        let xty = x.transpose() * y;
        let Some(cholesky) = xtx.cholesky() else {
            bail!("Normal equations are singular; cannot fit drift model");
        };
        let w = cholesky.solve(&xty);

        self.weights = w.iter().copied().collect();
        self.trained_samples = samples;
        Ok(())
    }

    fn forecast(&self, history: &[f64]) -> Result<Vec<ForecastPoint>> {
        if !self.is_trained() {
            bail!("Drift model has not been trained yet");
        }
        if history.len() < self.lags + 1 {
            bail!(
                "Need at least {} closes to forecast, got {}",
                self.lags + 1,
                history.len()
            );
        }

        let mut window = Self::returns(&history[history.len() - (self.lags + 1)..]);
        let mut price = *history.last().expect("non-empty history");

        let mut out = Vec::with_capacity(self.horizon);
        for offset in 1..=self.horizon {
            let r = self.predict_return(&window);
            let next = price * (1.0 + r);
            out.push(ForecastPoint {
                day_offset: offset as i64,
                predicted_close: next,
                recommend_long: next > price,
            });

            window.remove(0);
            window.push(r);
            price = next;
        }
        Ok(out)
    }

    fn to_blob(&self) -> Result<Vec<u8>> {
        super::drift_to_blob(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady_growth(n: usize, rate: f64) -> Vec<f64> {
        (0..n).map(|i| 100.0 * (1.0 + rate).powi(i as i32)).collect()
    }

    #[test]
    fn learns_a_steady_uptrend() {
        let history = steady_growth(200, 0.01);
        let mut model = DriftForecaster::new(5);
        model.retrain(&history).unwrap();

        let forecast = model.forecast(&history).unwrap();
        assert_eq!(forecast.len(), 5);
        assert_eq!(
            forecast.iter().map(|p| p.day_offset).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );

        let last_close = *history.last().unwrap();
        let mut prev = last_close;
        for point in &forecast {
            assert!(point.recommend_long, "uptrend should stay long");
            assert!(point.predicted_close > prev * 0.99);
            prev = point.predicted_close;
        }
        assert!(forecast[0].predicted_close > last_close);
    }

    #[test]
    fn learns_a_steady_downtrend() {
        let history = steady_growth(200, -0.01);
        let mut model = DriftForecaster::new(3);
        model.retrain(&history).unwrap();

        let forecast = model.forecast(&history).unwrap();
        assert!(forecast.iter().all(|p| !p.recommend_long));
        assert!(forecast[0].predicted_close < *history.last().unwrap());
    }

    #[test]
    fn forecast_is_deterministic() {
        let history: Vec<f64> = (0..150)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1)
            .collect();

        let mut a = DriftForecaster::new(5);
        a.retrain(&history).unwrap();
        let mut b = DriftForecaster::new(5);
        b.retrain(&history).unwrap();

        assert_eq!(a.forecast(&history).unwrap(), b.forecast(&history).unwrap());
    }

    #[test]
    fn rejects_bad_input() {
        let mut model = DriftForecaster::new(5);
        assert!(model.retrain(&[100.0, 101.0]).is_err());
        assert!(model.retrain(&[100.0, f64::NAN, 101.0]).is_err());
        assert!(model.retrain(&[100.0, -5.0, 101.0]).is_err());

        // Untrained models refuse to forecast.
        assert!(model.forecast(&steady_growth(50, 0.01)).is_err());

        model.retrain(&steady_growth(50, 0.01)).unwrap();
        assert!(model.forecast(&[100.0, 101.0]).is_err());
    }
}
