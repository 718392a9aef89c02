//! Daily accuracy fold
//!
//! Turns reconciled prediction rows into one immutable metrics row per
//! (ticker, day). The fold is strictly ordered: each day's directional
//! counter and simulated balance are derived from the previous day's
//! stored row, so days must be computed in ascending order.
//!
//! MAPE is the arithmetic mean of every individual absolute-percentage
//! error recorded for the ticker through the day. Each forecast
//! contributes once; this is deliberately not a mean of daily means.

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::storage::{AccuracyStore, InstrumentStore, LedgerDb, PredictionLedger};

pub struct AccuracyAggregator {
    predictions: PredictionLedger,
    accuracy: AccuracyStore,
    instruments: InstrumentStore,
}

impl AccuracyAggregator {
    pub fn new(db: &LedgerDb) -> Self {
        Self {
            predictions: db.predictions(),
            accuracy: db.accuracy(),
            instruments: db.instruments(),
        }
    }

    /// Compute and persist the metrics row for (ticker, day).
    ///
    /// Requires `day > 1`, a seeded placeholder row, every prediction with
    /// `for_day <= day` reconciled, and the previous day already computed.
    /// Returns `Ok(false)` without touching anything when the row is
    /// already populated: replaying a day can never change history.
    pub fn compute(&self, ticker: &str, day: i64) -> Result<bool> {
        if day <= 1 {
            bail!("Day {} has no prior day to measure against", day);
        }

        let row = self
            .accuracy
            .get(ticker, day)?
            .with_context(|| format!("No accuracy row seeded for {} day {}", ticker, day))?;
        if row.mape.is_some() {
            return Ok(false);
        }

        // Every forecast due by now must have its realized close before the
        // error series is meaningful. Leaving the row unpopulated keeps it
        // on the gap list for the next run.
        let open = self.predictions.find_unreconciled(day + 1)?;
        if let Some(days) = open.get(ticker) {
            if days.iter().any(|&d| d <= day) {
                bail!(
                    "{} still has unreconciled predictions through day {}",
                    ticker,
                    day
                );
            }
        }

        // Score every reconciled row that does not have its error yet.
        for p in self.predictions.unscored_through(ticker, day)? {
            let actual = p
                .actual_close
                .with_context(|| format!("Unscored row {} lost its actual close", p.id))?;
            let ape = (actual - p.predicted_close).abs() / actual * 100.0;
            self.predictions.set_ape(p.id, ape)?;
        }

        let rows = self.predictions.predictions_through(ticker, day)?;
        let apes: Vec<f64> = rows.iter().filter_map(|p| p.ape).collect();
        let mape = if apes.is_empty() {
            0.0
        } else {
            apes.iter().sum::<f64>() / apes.len() as f64
        };

        let prev = self
            .accuracy
            .get(ticker, day - 1)?
            .with_context(|| format!("No accuracy row for {} day {}", ticker, day - 1))?;
        if day - 1 > 1 && prev.mape.is_none() {
            bail!(
                "Accuracy for {} day {} computed before day {}",
                ticker,
                day,
                day - 1
            );
        }
        let prev_count = prev.buy_accuracy.unwrap_or(0);
        let prev_balance = prev
            .simulated_balance
            .with_context(|| format!("{} day {} has no stored balance", ticker, day - 1))?;

        // Directional call: the forecast made yesterday for today, against
        // what the price actually did.
        let (count, balance) = match self.predictions.prediction_for(ticker, day - 1, day)? {
            None => (prev_count, prev_balance),
            Some(p) => {
                let close_today = row.close.or(p.actual_close);
                match (close_today, prev.close) {
                    (Some(today), Some(yesterday)) => {
                        let went_up = today > yesterday;
                        let count = if p.recommend_long == went_up {
                            prev_count + 1
                        } else {
                            prev_count
                        };
                        let balance = if p.recommend_long {
                            round2(prev_balance * (1.0 + (today - yesterday) / yesterday))
                        } else {
                            prev_balance
                        };
                        (count, balance)
                    }
                    _ => {
                        warn!(
                            "No close pair for {} days {}/{}; carrying metrics forward",
                            ticker,
                            day - 1,
                            day
                        );
                        (prev_count, prev_balance)
                    }
                }
            }
        };

        let wrote = self
            .accuracy
            .fill_metrics(ticker, day, mape, count, balance)?;
        if wrote {
            debug!(
                "📐 {} day {}: mape={:.3} hits={} balance={:.2}",
                ticker, day, mape, count, balance
            );
        }
        Ok(wrote)
    }

    /// Copy the all-time summary (latest MAPE, directional hit rate with
    /// day 1 excluded from the denominator, simulated balance) onto the
    /// instrument record for display without a ledger scan.
    pub fn push_summary(&self, ticker: &str) -> Result<()> {
        let Some(latest) = self.accuracy.latest_populated(ticker)? else {
            return Ok(());
        };

        let mape = latest.mape.unwrap_or(0.0);
        let hits = latest.buy_accuracy.unwrap_or(0);
        let scored_days = (latest.day - 1).max(1);
        let accuracy_pct = hits as f64 / scored_days as f64 * 100.0;
        let balance = latest.simulated_balance.unwrap_or(0.0);

        self.instruments
            .set_summary(ticker, mape, accuracy_pct, balance)
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
