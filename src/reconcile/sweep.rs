// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One reconciliation sweep.
//!
//! The key space is streamed page by page. Each page goes through
//! Batching → Committing → Clearing before the next page is scanned, so at
//! most one page of counters is in flight and the time budget can be
//! checked at a point where nothing is half applied.
//!
//! ```text
//! SCAN paper_views:* ──page──→ GET (pipelined)
//!                               │  skip ≤0 / unparseable
//!                               ▼
//!                          bulk $inc views      (durable, one transaction)
//!                               │ ok
//!                               ▼
//!                          settle | delete      (fast)
//! ```

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::types::{SweepError, SweepPhase, SweepReport};
use super::ReconciliationScheduler;
use crate::config::ClearMode;
use crate::metrics;
use crate::storage::traits::{CounterSettlement, ViewIncrement};
use crate::views::{item_id_from_key, VIEW_KEY_PREFIX};

/// A counter that will be committed from the current page.
struct PendingDelta {
    key: String,
    item_id: String,
    delta: i64,
}

impl ReconciliationScheduler {
    /// Run one sweep now.
    ///
    /// Fails with [`SweepError::AlreadyRunning`] if another sweep (timer
    /// driven or manual) holds the guard.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_now(&self) -> Result<SweepReport, SweepError> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!("Sweep requested while another is running");
            return Err(SweepError::AlreadyRunning);
        };
        self.sweep_guarded().await
    }

    /// Run one sweep once any sweep in progress has finished.
    pub(super) async fn sweep_when_idle(&self) -> Result<SweepReport, SweepError> {
        let _guard = self.sweep_lock.lock().await;
        self.sweep_guarded().await
    }

    /// Caller holds `sweep_lock`.
    async fn sweep_guarded(&self) -> Result<SweepReport, SweepError> {
        let started = Instant::now();
        let mut report = SweepReport::default();

        let result = self.sweep_pages(started, &mut report).await;
        self.set_phase(SweepPhase::Idle);
        report.elapsed = started.elapsed();

        match result {
            Ok(()) => {
                metrics::record_sweep(report.keys_scanned, report.items_synced, report.keys_cleared, report.elapsed);
                if report.truncated {
                    metrics::record_sweep_truncated();
                }
                if report.is_quiescent() {
                    debug!(keys_scanned = report.keys_scanned, "No views to sync");
                } else {
                    info!(
                        items_synced = report.items_synced,
                        items_matched = report.items_matched,
                        keys_cleared = report.keys_cleared,
                        skipped_zero = report.skipped_zero,
                        skipped_invalid = report.skipped_invalid,
                        pages = report.pages,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "View sweep complete"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                metrics::record_sweep_failure(e.stage());
                warn!(
                    stage = e.stage(),
                    error = %e,
                    items_synced = report.items_synced,
                    pages = report.pages,
                    "View sweep aborted, remaining counters wait for the next tick"
                );
                Err(e)
            }
        }
    }

    async fn sweep_pages(&self, started: Instant, report: &mut SweepReport) -> Result<(), SweepError> {
        let mut cursor = 0u64;

        loop {
            self.set_phase(SweepPhase::Scanning);
            let page = self
                .fast
                .scan_prefix(VIEW_KEY_PREFIX, cursor, self.config.scan_count)
                .await
                .map_err(SweepError::Scan)?;

            report.pages += 1;
            report.keys_scanned += page.keys.len();

            if !page.keys.is_empty() {
                self.sweep_page(&page.keys, report).await?;
            }

            if page.is_last() {
                return Ok(());
            }
            cursor = page.cursor;

            if started.elapsed() >= self.config.time_budget {
                report.truncated = true;
                warn!(
                    budget_secs = self.config.time_budget.as_secs(),
                    pages = report.pages,
                    "Sweep time budget exhausted, continuing next tick"
                );
                return Ok(());
            }
        }
    }

    /// Batch, commit and clear one page of counter keys.
    async fn sweep_page(&self, keys: &[String], report: &mut SweepReport) -> Result<(), SweepError> {
        self.set_phase(SweepPhase::Batching);
        let values = self.fast.get_many(keys).await.map_err(SweepError::Read)?;

        let mut pending = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            // Gone since the scan: cleared by someone else or expired
            let Some(raw) = value else { continue };

            let Some(item_id) = item_id_from_key(key) else {
                report.skipped_invalid += 1;
                continue;
            };
            match raw.parse::<i64>() {
                Ok(delta) if delta > 0 => pending.push(PendingDelta {
                    key: key.clone(),
                    item_id: item_id.to_string(),
                    delta,
                }),
                Ok(_) => report.skipped_zero += 1,
                Err(_) => {
                    debug!(key = %key, value = %raw, "Skipping unparseable view counter");
                    report.skipped_invalid += 1;
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        self.set_phase(SweepPhase::Committing);
        let increments: Vec<ViewIncrement> = pending
            .iter()
            .map(|p| ViewIncrement {
                item_id: p.item_id.clone(),
                delta: p.delta as u64,
            })
            .collect();
        let committed = self
            .durable
            .bulk_increment_views(&increments)
            .await
            .map_err(SweepError::Commit)?;

        report.items_synced += committed.requested;
        report.items_matched += committed.matched;

        self.set_phase(SweepPhase::Clearing);
        let cleared = match self.config.clear_mode {
            ClearMode::Settle => {
                let settlements: Vec<CounterSettlement> = pending
                    .iter()
                    .map(|p| CounterSettlement {
                        key: p.key.clone(),
                        amount: p.delta,
                    })
                    .collect();
                self.fast.settle_counters(&settlements).await
            }
            ClearMode::Delete => {
                let keys: Vec<String> = pending.iter().map(|p| p.key.clone()).collect();
                self.fast.delete_many(&keys).await
            }
        };

        match cleared {
            Ok(n) => {
                report.keys_cleared += n;
                Ok(())
            }
            Err(e) => {
                // The durable tier already has these deltas
                error!(
                    keys = pending.len(),
                    error = %e,
                    "Committed view counters could not be cleared; the next sweep will count them again"
                );
                Err(SweepError::Clear(e))
            }
        }
    }

    pub(super) fn set_phase(&self, phase: SweepPhase) {
        self.phase.send_replace(phase);
        metrics::set_sweep_phase(phase.as_gauge());
    }
}
