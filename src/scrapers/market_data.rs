//! Market-data collaborator interface
//!
//! Daily close quotes and the trading-date calendar source. Every failure
//! mode (network, unknown symbol, empty payload) is a distinct error; a
//! price of zero is never used to signal "unavailable".

use anyhow::Result;
use async_trait::async_trait;

/// One daily quote.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyClose {
    /// ISO-8601 calendar date, e.g. "2025-07-02".
    pub date: String,
    pub close: f64,
}

#[async_trait]
pub trait MarketData: Send + Sync {
    /// Realized close for `symbol` on `date`. Err if the quote does not
    /// exist (non-trading day, unknown symbol) or cannot be fetched.
    async fn close_price(&self, symbol: &str, date: &str) -> Result<f64>;

    /// Ordered list of trading dates from `date` (inclusive) through the
    /// most recent available session.
    async fn trading_dates_since(&self, date: &str) -> Result<Vec<String>>;

    /// Full close-price history for `symbol` from `start_date` (inclusive),
    /// oldest first. Used to build the training window for retraining.
    async fn close_history(&self, symbol: &str, start_date: &str) -> Result<Vec<DailyClose>>;
}
