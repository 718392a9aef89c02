//! Scheduled update coordinator
//!
//! One pass per trading day: advance the calendar, backfill realized
//! closes into the prediction ledger, drive every instrument through a
//! retrain + forecast cycle, replay the accuracy fold over any gap days,
//! and clean up unconditionally so the next run can always start.
//!
//! Re-entrancy is guarded by a day-scoped run lock in the `meta` table,
//! separate from the per-instrument display status. The lock is a
//! heuristic, not a lease: a run that dies leaves it pointing at its
//! trading day, and the next day's run treats the stale value as evidence
//! of a dead holder, force-completes any stuck instruments and steals the
//! lock. A relaunch on the *same* trading day after a crash stays blocked
//! until the next day; deployments should additionally guarantee a single
//! scheduler instance.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::forecast::{self, ModelCache};
use crate::metrics::AccuracyAggregator;
use crate::models::{Config, LifecycleState, RunReport};
use crate::scrapers::market_data::MarketData;
use crate::storage::LedgerDb;

pub struct UpdateCoordinator {
    db: LedgerDb,
    market: Arc<dyn MarketData>,
    cache: Arc<ModelCache>,
    config: Config,
}

impl UpdateCoordinator {
    pub fn new(
        db: LedgerDb,
        market: Arc<dyn MarketData>,
        cache: Arc<ModelCache>,
        config: Config,
    ) -> Self {
        Self {
            db,
            market,
            cache,
            config,
        }
    }

    /// Run one pass as of the current UTC date.
    pub async fn run(&self) -> Result<RunReport> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.run_as_of(&today).await
    }

    /// Run one pass as of a given calendar date. Idempotent: re-running
    /// the same date re-forecasts but never duplicates ledger rows or
    /// recomputes populated accuracy days.
    pub async fn run_as_of(&self, date: &str) -> Result<RunReport> {
        let calendar = self.db.calendar();

        // Resolve "today" as a trading day number, extending the calendar
        // through the market-data source if needed. On a non-trading day
        // the pass runs as of the most recent session.
        let looked_up = calendar
            .day_number_for(date, self.market.as_ref(), &self.config.history_start_date)
            .await?;
        let today = if looked_up > 0 {
            looked_up
        } else {
            calendar.latest_day_number()?
        };
        if today < 1 {
            bail!("Trading calendar is empty and the calendar source returned nothing");
        }

        let mut report = RunReport {
            today,
            ..RunReport::default()
        };

        // Single-flight check, before any ledger or accuracy writes. A
        // lock from today means a live run; an older lock means its holder
        // died mid-pass.
        match self.db.update_lock_day()? {
            Some(held) if held >= today => {
                info!(
                    "🔒 Update already running for day {} - exiting early",
                    held
                );
                report.locked_out = true;
                return Ok(report);
            }
            Some(held) => {
                warn!(
                    "🔓 Stale update lock from day {} (today is {}) - recovering dead run",
                    held, today
                );
                self.db.instruments().force_complete_in_progress()?;
                self.db.steal_update_lock(today)?;
            }
            None => {
                if !self.db.try_acquire_update_lock(today)? {
                    info!("🔒 Lost the update lock race - exiting early");
                    report.locked_out = true;
                    return Ok(report);
                }
                // Crash-recovery sweep: nothing should be mid-flight when
                // the lock was free.
                self.db.instruments().force_complete_in_progress()?;
            }
        }

        let result = self.run_locked(today, &mut report).await;

        // Cleanup always runs, success or failure: no instrument stays
        // in_progress and the lock never outlives the pass.
        if let Err(e) = self.db.instruments().force_complete_in_progress() {
            warn!("Cleanup failed to reset instrument status: {}", e);
        }
        if let Err(e) = self.db.release_update_lock() {
            warn!("Cleanup failed to release update lock: {}", e);
        }

        result?;

        if report.erroneous.is_empty() {
            info!(
                "✅ Update pass for day {} done: {} backfilled, {} models refreshed, {} accuracy rows",
                today,
                report.backfilled,
                report.updated.len(),
                report.accuracy_rows
            );
            if let Err(e) = self.db.optimize() {
                warn!("Post-run optimize failed: {}", e);
            }
        } else {
            warn!(
                "⚠️ Update pass for day {} finished with {} erroneous ticker(s): {:?}",
                today,
                report.erroneous.len(),
                report.erroneous.keys().collect::<Vec<_>>()
            );
        }

        Ok(report)
    }

    async fn run_locked(&self, today: i64, report: &mut RunReport) -> Result<()> {
        let calendar = self.db.calendar();
        let instruments = self.db.instruments();
        let predictions = self.db.predictions();
        let accuracy = self.db.accuracy();
        let aggregator = AccuracyAggregator::new(&self.db);

        let mut tickers = self.config.tickers.clone();
        tickers.sort();
        tickers.dedup();

        // Placeholder rows up to today for every tracked symbol, and a
        // model record for anything seen for the first time.
        for ticker in &tickers {
            instruments.create_if_missing(ticker)?;
            accuracy.seed_through(ticker, today)?;
        }

        // Backfill realized closes for every forecast whose target day has
        // passed. Failures are collected and retried on the next pass; the
        // open rows are rediscovered automatically.
        for (ticker, days) in predictions.find_unreconciled(today)? {
            for day in days {
                let date = match calendar.date_for(day)? {
                    Some(d) => d,
                    None => {
                        warn!("No calendar date for day {} - skipping backfill", day);
                        continue;
                    }
                };
                match self.market.close_price(&ticker, &date).await {
                    Ok(close) => {
                        predictions.reconcile(&ticker, day, close)?;
                        accuracy.set_close(&ticker, day, close)?;
                        report.backfilled += 1;
                    }
                    Err(e) => {
                        warn!("Backfill failed for {} day {}: {:#}", ticker, day, e);
                        report
                            .erroneous
                            .entry(ticker.clone())
                            .or_insert_with(|| format!("backfill day {}: {:#}", day, e));
                    }
                }
            }
        }

        // Sequential refresh loop: exactly one instrument in_progress at a
        // time. The previous instrument flips pending -> completed when
        // the next one starts; the last one is force-completed after the
        // loop.
        let mut previous: Option<String> = None;
        for ticker in &tickers {
            if let Some(prev) = previous.take() {
                if let Err(e) = instruments.set_status(&prev, LifecycleState::Completed) {
                    warn!("Failed to complete {}: {}", prev, e);
                }
            }

            // An earlier instrument that failed this pass is still parked
            // in_progress; resolve it now so the freshness invariant holds
            // for outside readers. Its error is already on the report.
            if let Some(stuck) = instruments.in_progress_ticker()? {
                if report.erroneous.contains_key(&stuck) {
                    instruments.force_complete_in_progress()?;
                }
            }

            match self.refresh_instrument(ticker, today).await {
                Ok(()) => {
                    report.updated.push(ticker.clone());
                    previous = Some(ticker.clone());
                }
                Err(e) => {
                    warn!("Refresh failed for {}: {:#}", ticker, e);
                    self.cache.invalidate(ticker);
                    report
                        .erroneous
                        .entry(ticker.clone())
                        .or_insert_with(|| format!("refresh: {:#}", e));
                }
            }
        }
        if let Some(last) = previous {
            if let Err(e) = instruments.set_status(&last, LifecycleState::Completed) {
                warn!("Failed to complete {}: {}", last, e);
            }
        }

        // Accuracy fold over every still-unpopulated day, oldest first.
        // Today's own row waits for tomorrow's reconciliation. Later days
        // depend on earlier ones, so the first failure ends the ticker's
        // replay for this pass.
        for ticker in &tickers {
            for day in accuracy.unpopulated_days(ticker, today - 1)? {
                match aggregator.compute(ticker, day) {
                    Ok(true) => report.accuracy_rows += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Accuracy stopped for {} at day {}: {:#}", ticker, day, e);
                        report
                            .erroneous
                            .entry(ticker.clone())
                            .or_insert_with(|| format!("accuracy day {}: {:#}", day, e));
                        break;
                    }
                }
            }
            if let Err(e) = aggregator.push_summary(ticker) {
                warn!("Summary push failed for {}: {}", ticker, e);
            }
        }

        Ok(())
    }

    /// One instrument's cycle: in_progress -> retrain -> forecast ->
    /// ledger write -> save artifact -> pending. Any error leaves the
    /// instrument in_progress for the caller to account for.
    async fn refresh_instrument(&self, ticker: &str, today: i64) -> Result<()> {
        let instruments = self.db.instruments();
        let calendar = self.db.calendar();
        let accuracy = self.db.accuracy();

        let record = instruments.create_if_missing(ticker)?;
        instruments.set_status(ticker, LifecycleState::InProgress)?;

        let history = self
            .market
            .close_history(ticker, &self.config.history_start_date)
            .await
            .with_context(|| format!("Price history fetch failed for {}", ticker))?;
        if history.is_empty() {
            bail!("Empty price history for {}", ticker);
        }

        // Record realized closes for any seeded day still missing one.
        // Fill-once writes, so replays are cheap no-ops.
        for quote in &history {
            if let Some(day) = calendar.lookup(&quote.date)? {
                if day <= today {
                    accuracy.set_close(ticker, day, quote.close)?;
                }
            }
        }

        let closes: Vec<f64> = history.iter().map(|q| q.close).collect();
        let last_close = *closes.last().expect("non-empty history");

        let handle = match self.cache.get(ticker) {
            Some(h) => h,
            None => {
                let model = if record.model_blob.is_empty() {
                    forecast::new_default(self.config.forecast_horizon)
                } else {
                    forecast::from_blob(&record.model_blob)
                        .with_context(|| format!("Corrupt model artifact for {}", ticker))?
                };
                self.cache.insert(ticker, model)
            }
        };

        let (blob, points, recommendation) = {
            let mut model = handle.lock();
            model
                .retrain(&closes)
                .with_context(|| format!("Retraining failed for {}", ticker))?;
            let points = model
                .forecast(&closes)
                .with_context(|| format!("Forecast failed for {}", ticker))?;
            let recommendation = forecast::recommendation_text(last_close, &points);
            (model.to_blob()?, points, recommendation)
        };

        self.db.predictions().record_forecast(ticker, today, &points)?;
        instruments.save(ticker, &blob, &recommendation, today)?;
        instruments.set_status(ticker, LifecycleState::Pending)?;

        info!("🔮 {} refreshed: {}", ticker, recommendation);
        Ok(())
    }
}
