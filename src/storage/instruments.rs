//! Instrument model records
//!
//! One row per tracked ticker: serialized model artifact, latest
//! recommendation text, display-freshness status and a monotonic version.
//! Status transitions are validated here so "at most one instrument
//! in_progress" holds no matter which caller asks for the change.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{InstrumentModel, LifecycleState};

pub struct InstrumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl InstrumentStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Explicit lookup; `None` means the ticker has never been seen and the
    /// caller decides whether to create it.
    pub fn find(&self, ticker: &str) -> Result<Option<InstrumentModel>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, model_blob, recommendation, last_update_day, status, version,
                    summary_mape, summary_accuracy_pct, summary_balance
             FROM model WHERE ticker = ?1",
        )?;
        let mut rows = stmt.query([ticker])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Self::row_to_model(row)?))
    }

    pub fn all(&self) -> Result<Vec<InstrumentModel>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ticker, model_blob, recommendation, last_update_day, status, version,
                    summary_mape, summary_accuracy_pct, summary_balance
             FROM model ORDER BY ticker",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_model)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Create a fresh `new`-state record on first encounter; an existing
    /// record is returned unchanged.
    pub fn create_if_missing(&self, ticker: &str) -> Result<InstrumentModel> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT OR IGNORE INTO model (ticker, model_blob, status) VALUES (?1, ?2, 'new')",
                params![ticker, Vec::<u8>::new()],
            )?;
        }
        self.find(ticker)?
            .with_context(|| format!("Model record for {} missing after insert", ticker))
    }

    /// Persist the artifact + recommendation for a successful cycle and
    /// bump the version. Returns the new version.
    pub fn save(
        &self,
        ticker: &str,
        model_blob: &[u8],
        recommendation: &str,
        last_update_day: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "UPDATE model
             SET model_blob = ?1, recommendation = ?2, last_update_day = ?3,
                 version = version + 1
             WHERE ticker = ?4",
            params![model_blob, recommendation, last_update_day, ticker],
        )?;
        if changes == 0 {
            bail!("Cannot save model for unknown ticker {}", ticker);
        }
        let version: i64 = conn.query_row(
            "SELECT version FROM model WHERE ticker = ?1",
            [ticker],
            |row| row.get(0),
        )?;
        debug!("💾 Saved model for {} (v{})", ticker, version);
        Ok(version)
    }

    pub fn status(&self, ticker: &str) -> Result<Option<LifecycleState>> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM model WHERE ticker = ?1",
                [ticker],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            None => Ok(None),
            Some(s) => LifecycleState::parse(&s)
                .map(Some)
                .with_context(|| format!("Corrupt status '{}' for {}", s, ticker)),
        }
    }

    /// Ticker currently being refreshed, if any.
    pub fn in_progress_ticker(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let ticker: Option<String> = conn
            .query_row(
                "SELECT ticker FROM model WHERE status = 'in_progress' LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ticker)
    }

    /// Validated status transition. Advancing to `in_progress` is refused
    /// while any other instrument is already there.
    pub fn set_status(&self, ticker: &str, next: LifecycleState) -> Result<()> {
        let current = self
            .status(ticker)?
            .with_context(|| format!("Unknown ticker {}", ticker))?;

        if !current.can_advance_to(next) {
            bail!(
                "Invalid status transition for {}: {} -> {}",
                ticker,
                current.as_str(),
                next.as_str()
            );
        }

        if next == LifecycleState::InProgress {
            if let Some(busy) = self.in_progress_ticker()? {
                if busy != ticker {
                    bail!(
                        "Refusing to mark {} in_progress while {} still is",
                        ticker,
                        busy
                    );
                }
            }
        }

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE model SET status = ?1 WHERE ticker = ?2",
            params![next.as_str(), ticker],
        )?;
        Ok(())
    }

    /// Cleanup hammer: every instrument still `in_progress` is marked
    /// `completed`, bypassing transition checks. Used at the end of every
    /// coordinator run and when recovering from a run that died.
    pub fn force_complete_in_progress(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE model SET status = 'completed' WHERE status = 'in_progress'",
            [],
        )?;
        if changed > 0 {
            warn!("🧹 Force-completed {} stuck in_progress instrument(s)", changed);
        }
        Ok(changed)
    }

    /// Push the all-time accuracy summary onto the record for fast display.
    pub fn set_summary(
        &self,
        ticker: &str,
        mape: f64,
        accuracy_pct: f64,
        balance: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE model
             SET summary_mape = ?1, summary_accuracy_pct = ?2, summary_balance = ?3
             WHERE ticker = ?4",
            params![mape, accuracy_pct, balance, ticker],
        )?;
        Ok(())
    }

    fn row_to_model(row: &rusqlite::Row) -> rusqlite::Result<InstrumentModel> {
        let status_str: String = row.get(4)?;
        let status = LifecycleState::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("corrupt status '{}'", status_str),
            )))
        })?;
        Ok(InstrumentModel {
            ticker: row.get(0)?,
            model_blob: row.get(1)?,
            recommendation: row.get(2)?,
            last_update_day: row.get(3)?,
            status,
            version: row.get(5)?,
            summary_mape: row.get(6)?,
            summary_accuracy_pct: row.get(7)?,
            summary_balance: row.get(8)?,
        })
    }
}
