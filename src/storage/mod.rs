//! SQLite-backed prediction ledger storage
//!
//! One database file, four logical tables plus a small `meta` key/value
//! table, shared by every storage component through a single connection:
//! - `day`             dense trading-day calendar (1..N, append-only)
//! - `model`           per-instrument model artifact + lifecycle status
//! - `prediction`      individual forecasts, unique per (ticker, from, for)
//! - `daily_accuracy`  one metrics row per (ticker, day), filled once
//!
//! WAL mode keeps the read-only API responsive while the coordinator
//! writes. Writes commit per logical step rather than one long transaction
//! so a crashed run leaves resumable state behind.

pub mod accuracy;
pub mod calendar;
pub mod instruments;
pub mod predictions;

pub use accuracy::AccuracyStore;
pub use calendar::TradingCalendar;
pub use instruments::InstrumentStore;
pub use predictions::PredictionLedger;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS day (
    day_number INTEGER PRIMARY KEY,
    calendar_date TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS model (
    ticker TEXT PRIMARY KEY,
    model_blob BLOB NOT NULL,
    recommendation TEXT NOT NULL DEFAULT '',
    last_update_day INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'new',
    version INTEGER NOT NULL DEFAULT 0,
    summary_mape REAL,
    summary_accuracy_pct REAL,
    summary_balance REAL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS prediction (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    from_day INTEGER NOT NULL,
    for_day INTEGER NOT NULL,
    predicted_close REAL NOT NULL,
    actual_close REAL,
    recommend_long INTEGER NOT NULL DEFAULT 0,
    ape REAL,
    UNIQUE (ticker, from_day, for_day)
);

CREATE INDEX IF NOT EXISTS idx_prediction_target
    ON prediction(ticker, for_day, from_day);

-- Partial index for the crash-recovery backfill scan.
CREATE INDEX IF NOT EXISTS idx_prediction_unreconciled
    ON prediction(ticker, for_day) WHERE actual_close IS NULL;

CREATE TABLE IF NOT EXISTS daily_accuracy (
    ticker TEXT NOT NULL,
    day INTEGER NOT NULL,
    close REAL,
    mape REAL,
    buy_accuracy INTEGER,
    simulated_balance REAL,
    PRIMARY KEY (ticker, day)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// `meta` key holding the trading day number on which a coordinator run
/// acquired the update lock. Absent means unlocked.
const META_UPDATE_LOCK_DAY: &str = "update_lock_day";

/// Shared handle to the ledger database. Cheap to clone; all component
/// stores lock the same connection.
#[derive(Clone)]
pub struct LedgerDb {
    conn: Arc<Mutex<Connection>>,
}

impl LedgerDb {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();

        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let days: i64 = conn
            .query_row("SELECT COUNT(*) FROM day", [], |row| row.get(0))
            .unwrap_or(0);
        let predictions: i64 = conn
            .query_row("SELECT COUNT(*) FROM prediction", [], |row| row.get(0))
            .unwrap_or(0);

        info!(
            "📊 Ledger database ready at {} ({} trading days, {} predictions)",
            db_path, days, predictions
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn handle(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    pub fn calendar(&self) -> TradingCalendar {
        TradingCalendar::new(self.handle())
    }

    pub fn predictions(&self) -> PredictionLedger {
        PredictionLedger::new(self.handle())
    }

    pub fn accuracy(&self) -> AccuracyStore {
        AccuracyStore::new(self.handle())
    }

    pub fn instruments(&self) -> InstrumentStore {
        InstrumentStore::new(self.handle())
    }

    /// Trading day on which the update lock was taken, if any run holds it.
    pub fn update_lock_day(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM meta WHERE key = ?1")?;
        let mut rows = stmt.query([META_UPDATE_LOCK_DAY])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let value: String = row.get(0)?;
        Ok(value.parse::<i64>().ok())
    }

    /// Take the update lock for `day`. Returns false if some run already
    /// holds it (the caller decides whether that holder is dead).
    pub fn try_acquire_update_lock(&self, day: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
            params![META_UPDATE_LOCK_DAY, day.to_string()],
        )?;
        Ok(changes > 0)
    }

    /// Re-point a held lock at `day`. Used to steal the lock from a run
    /// that evidently died on an earlier trading day.
    pub fn steal_update_lock(&self, day: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![META_UPDATE_LOCK_DAY, day.to_string()],
        )?;
        Ok(())
    }

    pub fn release_update_lock(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM meta WHERE key = ?1", [META_UPDATE_LOCK_DAY])?;
        Ok(())
    }

    /// Optimize database (run periodically, e.g., daily)
    pub fn optimize(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA optimize;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        Ok(())
    }
}
