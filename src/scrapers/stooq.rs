//! Stooq daily-quote client
//!
//! Free CSV endpoint for end-of-day close prices. Also doubles as the
//! trading-calendar source: the quote dates of a liquid reference ticker
//! are the trading-day list (weekends and market holidays simply do not
//! appear in the data).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::warn;

use super::market_data::{DailyClose, MarketData};

#[derive(Clone)]
pub struct StooqClient {
    client: Client,
    base_url: String,
    calendar_ticker: String,
}

impl StooqClient {
    pub fn new(base_url: &str, calendar_ticker: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build StooqClient")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            calendar_ticker: calendar_ticker.to_string(),
        })
    }

    /// Stooq expects lowercase symbols with a market suffix ("aapl.us").
    /// Plain US tickers get the ".us" suffix appended.
    fn quote_symbol(symbol: &str) -> String {
        let s = symbol.trim().to_lowercase();
        if s.contains('.') {
            s
        } else {
            format!("{}.us", s)
        }
    }

    /// "2025-07-02" -> "20250702" (the d1/d2 query format).
    fn compact_date(date: &str) -> String {
        date.chars().filter(|c| c.is_ascii_digit()).collect()
    }

    async fn fetch_csv(&self, symbol: &str, d1: &str, d2: Option<&str>) -> Result<String> {
        let url = format!("{}/q/d/l/", self.base_url);
        let quote_symbol = Self::quote_symbol(symbol);
        let mut qp: Vec<(&str, String)> = vec![
            ("s", quote_symbol),
            ("d1", Self::compact_date(d1)),
            ("i", "d".to_string()),
        ];
        if let Some(d2) = d2 {
            qp.push(("d2", Self::compact_date(d2)));
        }

        let resp = self
            .client
            .get(&url)
            .query(&qp)
            .send()
            .await
            .with_context(|| format!("GET daily quotes for {} failed", symbol))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("GET daily quotes for {} {}: {}", symbol, status, text);
        }

        resp.text()
            .await
            .with_context(|| format!("Failed to read quote payload for {}", symbol))
    }

    /// Parse the daily CSV payload (`Date,Open,High,Low,Close,Volume`).
    /// Rows with unparseable or non-positive closes are dropped with a
    /// warning rather than poisoning the series.
    fn parse_daily_csv(symbol: &str, body: &str) -> Result<Vec<DailyClose>> {
        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed.starts_with("No data") {
            bail!("No quote data for symbol {}", symbol);
        }

        let mut out: Vec<DailyClose> = Vec::new();
        for line in trimmed.lines().skip(1) {
            let mut cols = line.split(',');
            let date = match cols.next() {
                Some(d) if d.len() == 10 => d.to_string(),
                _ => continue,
            };
            let close = match cols.nth(3).map(str::parse::<f64>) {
                Some(Ok(c)) if c.is_finite() && c > 0.0 => c,
                _ => {
                    warn!("Dropping malformed quote row for {}: {}", symbol, line);
                    continue;
                }
            };
            out.push(DailyClose { date, close });
        }

        if out.is_empty() {
            bail!("Quote payload for {} contained no usable rows", symbol);
        }

        Ok(out)
    }
}

#[async_trait]
impl MarketData for StooqClient {
    async fn close_price(&self, symbol: &str, date: &str) -> Result<f64> {
        let body = self.fetch_csv(symbol, date, Some(date)).await?;
        let rows = Self::parse_daily_csv(symbol, &body)?;
        rows.iter()
            .find(|r| r.date == date)
            .map(|r| r.close)
            .with_context(|| format!("No close for {} on {}", symbol, date))
    }

    async fn trading_dates_since(&self, date: &str) -> Result<Vec<String>> {
        let history = self.close_history(&self.calendar_ticker, date).await?;
        Ok(history.into_iter().map(|r| r.date).collect())
    }

    async fn close_history(&self, symbol: &str, start_date: &str) -> Result<Vec<DailyClose>> {
        let body = self.fetch_csv(symbol, start_date, None).await?;
        let mut rows = Self::parse_daily_csv(symbol, &body)?;
        rows.retain(|r| r.date.as_str() >= start_date);
        rows.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_symbol_suffix() {
        assert_eq!(StooqClient::quote_symbol("AAPL"), "aapl.us");
        assert_eq!(StooqClient::quote_symbol("^spx"), "^spx");
        assert_eq!(StooqClient::quote_symbol("btc.v"), "btc.v");
    }

    #[test]
    fn parse_daily_csv_happy_path() {
        let body = "Date,Open,High,Low,Close,Volume\n\
                    2025-07-01,100.0,101.0,99.0,100.5,1000\n\
                    2025-07-02,100.5,103.0,100.1,102.0,1200\n";
        let rows = StooqClient::parse_daily_csv("AAPL", body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, "2025-07-01");
        assert_eq!(rows[1].close, 102.0);
    }

    #[test]
    fn parse_daily_csv_drops_bad_rows() {
        let body = "Date,Open,High,Low,Close,Volume\n\
                    2025-07-01,100.0,101.0,99.0,nan,1000\n\
                    2025-07-02,100.5,103.0,100.1,102.0,1200\n\
                    2025-07-03,100.5,103.0,100.1,-3.0,900\n";
        let rows = StooqClient::parse_daily_csv("AAPL", body).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, "2025-07-02");
    }

    #[test]
    fn parse_daily_csv_rejects_empty() {
        assert!(StooqClient::parse_daily_csv("ZZZZ", "No data\n").is_err());
        assert!(StooqClient::parse_daily_csv("ZZZZ", "").is_err());
        assert!(StooqClient::parse_daily_csv("ZZZZ", "Date,Open,High,Low,Close,Volume\n").is_err());
    }
}
