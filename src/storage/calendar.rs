//! Trading-day calendar
//!
//! Maps calendar dates to a dense, gap-free 1..N numbering of trading
//! days. Day numbers are assigned once, in chronological order, and never
//! renumbered; `extend` only ever appends dates strictly after the latest
//! stored one, so overlapping calls are idempotent.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

use crate::scrapers::market_data::MarketData;

pub struct TradingCalendar {
    conn: Arc<Mutex<Connection>>,
}

impl TradingCalendar {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Highest assigned day number, -1 when the calendar is empty.
    pub fn latest_day_number(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let latest: Option<i64> =
            conn.query_row("SELECT MAX(day_number) FROM day", [], |row| row.get(0))?;
        Ok(latest.unwrap_or(-1))
    }

    /// Most recent stored calendar date, if any.
    pub fn latest_date(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let latest: Option<String> = conn
            .query_row(
                "SELECT calendar_date FROM day ORDER BY day_number DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(latest)
    }

    /// Pure lookup, no side effects.
    pub fn lookup(&self, date: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT day_number FROM day WHERE calendar_date = ?1")?;
        let mut rows = stmt.query([date])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }

    /// Calendar date for an assigned day number.
    pub fn date_for(&self, day_number: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT calendar_date FROM day WHERE day_number = ?1")?;
        let mut rows = stmt.query([day_number])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }

    /// Append the suffix of `dates` that lies strictly after the latest
    /// stored date. `dates` must be chronologically ordered ISO-8601
    /// strings; everything at or before the stored frontier is skipped, so
    /// repeated calls with overlapping ranges insert nothing twice and
    /// never disturb already-assigned numbers. Returns the number of days
    /// appended.
    pub fn extend(&self, dates: &[String]) -> Result<usize> {
        let conn = self.conn.lock();

        let frontier: Option<String> = conn
            .query_row(
                "SELECT calendar_date FROM day ORDER BY day_number DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let mut next_number: i64 = conn
            .query_row("SELECT COALESCE(MAX(day_number), 0) FROM day", [], |row| {
                row.get(0)
            })?;

        conn.execute("BEGIN IMMEDIATE", [])?;

        let mut appended = 0usize;
        let mut prev: Option<&str> = None;
        for date in dates {
            if let Some(f) = frontier.as_deref() {
                if date.as_str() <= f {
                    continue;
                }
            }
            if let Some(p) = prev {
                if date.as_str() <= p {
                    conn.execute("ROLLBACK", []).ok();
                    bail!("Calendar extension dates are not chronologically ordered: {} after {}", date, p);
                }
            }

            next_number += 1;
            if let Err(e) = conn.execute(
                "INSERT INTO day (day_number, calendar_date) VALUES (?1, ?2)",
                params![next_number, date],
            ) {
                conn.execute("ROLLBACK", []).ok();
                return Err(e).with_context(|| format!("Failed to append trading day {}", date));
            }
            appended += 1;
            prev = Some(date.as_str());
        }

        conn.execute("COMMIT", [])?;

        if appended > 0 {
            info!(
                "📅 Calendar extended by {} trading days (latest = day {})",
                appended, next_number
            );
        }
        Ok(appended)
    }

    /// Day number for a calendar date. An unknown date triggers one
    /// on-demand extension through the calendar `source` and a single
    /// retry; a date the source does not know either returns -1, which
    /// callers must treat as "not yet known" rather than a hard failure.
    pub async fn day_number_for(
        &self,
        date: &str,
        source: &dyn MarketData,
        fallback_start: &str,
    ) -> Result<i64> {
        if let Some(n) = self.lookup(date)? {
            return Ok(n);
        }

        let since = match self.latest_date()? {
            Some(d) => d,
            None => fallback_start.to_string(),
        };
        debug!("Calendar miss for {}, extending from {}", date, since);

        let dates = source
            .trading_dates_since(&since)
            .await
            .context("Calendar source failed during on-demand extension")?;
        self.extend(&dates)?;

        Ok(self.lookup(date)?.unwrap_or(-1))
    }
}
