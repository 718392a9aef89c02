//! Prediction ledger
//!
//! Append/update store of individual forecasts. At most one row per
//! (ticker, from_day, for_day); `actual_close` and `ape` start empty and
//! are filled exactly once. Rows are never deleted.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::models::{ForecastPoint, PredictionRow};

pub struct PredictionLedger {
    conn: Arc<Mutex<Connection>>,
}

impl PredictionLedger {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Write one row per forecast point, keyed on
    /// (ticker, from_day, from_day + offset). Re-running the same forecast
    /// for the same `from_day` updates the predicted values in place
    /// instead of duplicating rows; an already-reconciled actual is left
    /// untouched.
    pub fn record_forecast(
        &self,
        ticker: &str,
        from_day: i64,
        forecast: &[ForecastPoint],
    ) -> Result<usize> {
        if from_day < 1 {
            bail!("Forecast origin day {} is not a valid trading day", from_day);
        }

        for point in forecast {
            if point.day_offset < 1 {
                bail!(
                    "Forecast offset {} for {} must be >= 1",
                    point.day_offset,
                    ticker
                );
            }
            if !point.predicted_close.is_finite() || point.predicted_close <= 0.0 {
                bail!(
                    "Predicted close {} for {} is not a valid price",
                    point.predicted_close,
                    ticker
                );
            }
        }

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let mut written = 0usize;
        for point in forecast {
            let result = conn.execute(
                "INSERT INTO prediction
                     (ticker, from_day, for_day, predicted_close, recommend_long)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(ticker, from_day, for_day) DO UPDATE SET
                     predicted_close = excluded.predicted_close,
                     recommend_long = excluded.recommend_long",
                params![
                    ticker,
                    from_day,
                    from_day + point.day_offset,
                    point.predicted_close,
                    point.recommend_long as i64,
                ],
            );
            match result {
                Ok(changes) => written += changes,
                Err(e) => {
                    conn.execute("ROLLBACK", []).ok();
                    return Err(e.into());
                }
            }
        }

        conn.execute("COMMIT", [])?;

        debug!(
            "📒 Recorded {}-step forecast for {} from day {}",
            written, ticker, from_day
        );
        Ok(written)
    }

    /// Fill in the realized close on every still-open row targeting
    /// (ticker, for_day). Returns the number of rows updated; zero rows is
    /// a safe no-op, not an error. Rejects prices that cannot be real.
    pub fn reconcile(&self, ticker: &str, for_day: i64, actual_close: f64) -> Result<usize> {
        if !actual_close.is_finite() || actual_close <= 0.0 {
            bail!(
                "Refusing to reconcile {} day {} with invalid price {}",
                ticker,
                for_day,
                actual_close
            );
        }

        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE prediction SET actual_close = ?1
             WHERE ticker = ?2 AND for_day = ?3 AND actual_close IS NULL",
            params![actual_close, ticker, for_day],
        )?;
        Ok(updated)
    }

    /// All (ticker, for_day) pairs before `before_day` whose actual close
    /// is still missing, grouped per ticker in ascending day order. This is
    /// the crash-recovery scan: anything a previous run failed to backfill
    /// reappears here.
    pub fn find_unreconciled(&self, before_day: i64) -> Result<BTreeMap<String, Vec<i64>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT DISTINCT ticker, for_day FROM prediction
             WHERE for_day < ?1 AND actual_close IS NULL
             ORDER BY ticker, for_day",
        )?;

        let mut out: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        let mut rows = stmt.query([before_day])?;
        while let Some(row) = rows.next()? {
            let ticker: String = row.get(0)?;
            let for_day: i64 = row.get(1)?;
            out.entry(ticker).or_default().push(for_day);
        }
        Ok(out)
    }

    /// Every row for `ticker` with `for_day <= day`, ordered by
    /// (for_day, from_day) so aggregation folds run in target-day order.
    pub fn predictions_through(&self, ticker: &str, day: i64) -> Result<Vec<PredictionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ticker, from_day, for_day, predicted_close, actual_close,
                    recommend_long, ape
             FROM prediction
             WHERE ticker = ?1 AND for_day <= ?2
             ORDER BY for_day, from_day",
        )?;

        let rows = stmt
            .query_map(params![ticker, day], Self::row_to_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The single row predicted on `from_day` targeting `for_day`, if any.
    pub fn prediction_for(
        &self,
        ticker: &str,
        from_day: i64,
        for_day: i64,
    ) -> Result<Option<PredictionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ticker, from_day, for_day, predicted_close, actual_close,
                    recommend_long, ape
             FROM prediction
             WHERE ticker = ?1 AND from_day = ?2 AND for_day = ?3",
        )?;
        let mut rows = stmt.query(params![ticker, from_day, for_day])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Self::row_to_prediction(row)?))
    }

    /// Reconciled rows through `day` whose error is still unscored.
    pub fn unscored_through(&self, ticker: &str, day: i64) -> Result<Vec<PredictionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, ticker, from_day, for_day, predicted_close, actual_close,
                    recommend_long, ape
             FROM prediction
             WHERE ticker = ?1 AND for_day <= ?2
               AND actual_close IS NOT NULL AND ape IS NULL
             ORDER BY for_day, from_day",
        )?;
        let rows = stmt
            .query_map(params![ticker, day], Self::row_to_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Persist a computed absolute-percentage-error. Fill-once: a row that
    /// already carries a score is left alone.
    pub fn set_ape(&self, id: i64, ape: f64) -> Result<()> {
        if !ape.is_finite() || ape < 0.0 {
            bail!("Refusing to store invalid error value {} for row {}", ape, id);
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE prediction SET ape = ?1 WHERE id = ?2 AND ape IS NULL",
            params![ape, id],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM prediction", [], |row| row.get(0))?;
        Ok(n)
    }

    fn row_to_prediction(row: &rusqlite::Row) -> rusqlite::Result<PredictionRow> {
        Ok(PredictionRow {
            id: row.get(0)?,
            ticker: row.get(1)?,
            from_day: row.get(2)?,
            for_day: row.get(3)?,
            predicted_close: row.get(4)?,
            actual_close: row.get(5)?,
            recommend_long: row.get::<_, i64>(6)? != 0,
            ape: row.get(7)?,
        })
    }
}
