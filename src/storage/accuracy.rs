//! Daily accuracy rows
//!
//! Exactly one row per (ticker, day). Day 1 is the seed row: no metrics,
//! simulated balance 100.0. Metric fields are written once and never
//! recomputed; the realized close is recorded per day so the metrics fold
//! never has to re-derive it from prediction rows.

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::sync::Arc;

use crate::models::DailyAccuracyRow;

/// Seed balance for the simulated account on day 1.
pub const SEED_BALANCE: f64 = 100.0;

pub struct AccuracyStore {
    conn: Arc<Mutex<Connection>>,
}

impl AccuracyStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Make sure placeholder rows exist for every day 1..=through_day.
    /// Existing rows are left untouched. Returns the number created.
    pub fn seed_through(&self, ticker: &str, through_day: i64) -> Result<usize> {
        if through_day < 1 {
            return Ok(0);
        }

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let mut created = 0usize;
        for day in 1..=through_day {
            let balance = if day == 1 { Some(SEED_BALANCE) } else { None };
            created += conn.execute(
                "INSERT OR IGNORE INTO daily_accuracy (ticker, day, simulated_balance)
                 VALUES (?1, ?2, ?3)",
                params![ticker, day, balance],
            )?;
        }

        conn.execute("COMMIT", [])?;
        Ok(created)
    }

    /// Record the realized close for (ticker, day). Fill-once: an already
    /// recorded close is never replaced.
    pub fn set_close(&self, ticker: &str, day: i64, close: f64) -> Result<()> {
        if !close.is_finite() || close <= 0.0 {
            bail!(
                "Refusing to store invalid close {} for {} day {}",
                close,
                ticker,
                day
            );
        }
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE daily_accuracy SET close = ?1
             WHERE ticker = ?2 AND day = ?3 AND close IS NULL",
            params![close, ticker, day],
        )?;
        Ok(())
    }

    pub fn get(&self, ticker: &str, day: i64) -> Result<Option<DailyAccuracyRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, day, close, mape, buy_accuracy, simulated_balance
             FROM daily_accuracy WHERE ticker = ?1 AND day = ?2",
        )?;
        let mut rows = stmt.query(params![ticker, day])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Self::row_to_accuracy(row)?))
    }

    /// Write the computed metrics for one day. Returns false (writing
    /// nothing) when the row is already populated, so a replayed
    /// computation can never change history.
    pub fn fill_metrics(
        &self,
        ticker: &str,
        day: i64,
        mape: f64,
        buy_accuracy: i64,
        simulated_balance: f64,
    ) -> Result<bool> {
        if !mape.is_finite() || !simulated_balance.is_finite() {
            bail!("Refusing to store non-finite metrics for {} day {}", ticker, day);
        }

        let conn = self.conn.lock();
        let changes = conn.execute(
            "UPDATE daily_accuracy
             SET mape = ?1, buy_accuracy = ?2, simulated_balance = ?3
             WHERE ticker = ?4 AND day = ?5 AND mape IS NULL",
            params![mape, buy_accuracy, simulated_balance, ticker, day],
        )?;
        Ok(changes > 0)
    }

    /// Days in 2..=through_day whose metrics have not been computed yet,
    /// ascending. Re-derived from the store on every run so a crashed pass
    /// picks up exactly where it stopped.
    pub fn unpopulated_days(&self, ticker: &str, through_day: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT day FROM daily_accuracy
             WHERE ticker = ?1 AND day > 1 AND day <= ?2 AND mape IS NULL
             ORDER BY day",
        )?;
        let days = stmt
            .query_map(params![ticker, through_day], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(days)
    }

    /// Most recent day with computed metrics, for the all-time summary.
    pub fn latest_populated(&self, ticker: &str) -> Result<Option<DailyAccuracyRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, day, close, mape, buy_accuracy, simulated_balance
             FROM daily_accuracy
             WHERE ticker = ?1 AND mape IS NOT NULL
             ORDER BY day DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([ticker])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Self::row_to_accuracy(row)?))
    }

    pub fn count_populated(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM daily_accuracy WHERE mape IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    fn row_to_accuracy(row: &rusqlite::Row) -> rusqlite::Result<DailyAccuracyRow> {
        Ok(DailyAccuracyRow {
            ticker: row.get(0)?,
            day: row.get(1)?,
            close: row.get(2)?,
            mape: row.get(3)?,
            buy_accuracy: row.get(4)?,
            simulated_balance: row.get(5)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LedgerDb;

    #[test]
    fn seed_creates_day_one_with_balance() {
        let db = LedgerDb::new(":memory:").unwrap();
        let acc = db.accuracy();

        assert_eq!(acc.seed_through("AAPL", 3).unwrap(), 3);
        let day1 = acc.get("AAPL", 1).unwrap().unwrap();
        assert_eq!(day1.simulated_balance, Some(SEED_BALANCE));
        assert_eq!(day1.mape, None);
        assert_eq!(day1.buy_accuracy, None);

        let day2 = acc.get("AAPL", 2).unwrap().unwrap();
        assert_eq!(day2.simulated_balance, None);

        // Re-seeding is a no-op.
        assert_eq!(acc.seed_through("AAPL", 3).unwrap(), 0);
        assert_eq!(acc.seed_through("AAPL", 5).unwrap(), 2);
    }

    #[test]
    fn close_fills_once() {
        let db = LedgerDb::new(":memory:").unwrap();
        let acc = db.accuracy();
        acc.seed_through("AAPL", 2).unwrap();

        acc.set_close("AAPL", 1, 100.0).unwrap();
        acc.set_close("AAPL", 1, 999.0).unwrap();
        assert_eq!(acc.get("AAPL", 1).unwrap().unwrap().close, Some(100.0));

        assert!(acc.set_close("AAPL", 2, f64::NAN).is_err());
        assert!(acc.set_close("AAPL", 2, 0.0).is_err());
    }

    #[test]
    fn metrics_are_write_once() {
        let db = LedgerDb::new(":memory:").unwrap();
        let acc = db.accuracy();
        acc.seed_through("AAPL", 3).unwrap();

        assert_eq!(acc.unpopulated_days("AAPL", 3).unwrap(), vec![2, 3]);

        assert!(acc.fill_metrics("AAPL", 2, 0.98, 1, 102.0).unwrap());
        assert_eq!(acc.unpopulated_days("AAPL", 3).unwrap(), vec![3]);

        // A second computation for the same day changes nothing.
        assert!(!acc.fill_metrics("AAPL", 2, 50.0, 9, 1.0).unwrap());
        let row = acc.get("AAPL", 2).unwrap().unwrap();
        assert_eq!(row.mape, Some(0.98));
        assert_eq!(row.buy_accuracy, Some(1));
        assert_eq!(row.simulated_balance, Some(102.0));

        let latest = acc.latest_populated("AAPL").unwrap().unwrap();
        assert_eq!(latest.day, 2);
        assert_eq!(acc.count_populated().unwrap(), 1);
    }
}
