// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for paper-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process picks the exporter (Prometheus, OTEL, ...).
//!
//! # Metric Naming Convention
//! - `paper_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: fast, durable
//! - `outcome` / `status`: per metric, see each function

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// BACKENDS - latency, errors, health
// ═══════════════════════════════════════════════════════════════════════════

/// Record backend operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "paper_sync_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a backend error
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "paper_sync_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "paper_sync_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record circuit breaker call outcome (success, failure, rejected)
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "paper_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REQUEST PATH - cache, views, registry
// ═══════════════════════════════════════════════════════════════════════════

/// Search cache lookup outcome: hit, miss, stale_schema, error
pub fn record_cache_lookup(outcome: &'static str) {
    counter!("paper_sync_search_cache_lookups_total", "outcome" => outcome).increment(1);
}

/// Search cache population: stored, error
pub fn record_cache_store(status: &'static str) {
    counter!("paper_sync_search_cache_stores_total", "status" => status).increment(1);
}

/// View increment: counted, skipped (fast tier failed)
pub fn record_view_increment(status: &'static str) {
    counter!("paper_sync_view_increments_total", "status" => status).increment(1);
}

/// Username pre-check outcome: taken, free, error
pub fn record_registry_check(outcome: &'static str) {
    counter!("paper_sync_username_checks_total", "outcome" => outcome).increment(1);
}

/// Username reservation write: reserved, error
pub fn record_registry_reserve(status: &'static str) {
    counter!("paper_sync_username_reservations_total", "status" => status).increment(1);
}

/// Durable uniqueness conflict that the registry pre-check did not catch
pub fn record_registry_false_negative() {
    counter!("paper_sync_username_false_negatives_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RECONCILIATION - per-sweep totals and phase
// ═══════════════════════════════════════════════════════════════════════════

/// Record the totals of a finished sweep
pub fn record_sweep(keys_scanned: usize, items_synced: usize, keys_cleared: u64, duration: Duration) {
    counter!("paper_sync_sweeps_total", "status" => "success").increment(1);
    counter!("paper_sync_sweep_keys_scanned_total").increment(keys_scanned as u64);
    counter!("paper_sync_sweep_items_synced_total").increment(items_synced as u64);
    counter!("paper_sync_sweep_keys_cleared_total").increment(keys_cleared);
    histogram!("paper_sync_sweep_seconds").record(duration.as_secs_f64());
}

/// Record a sweep aborted at `stage` (scan, read, commit, clear)
pub fn record_sweep_failure(stage: &'static str) {
    counter!("paper_sync_sweeps_total", "status" => "failure", "stage" => stage).increment(1);
}

/// Record a sweep that stopped early because its time budget ran out
pub fn record_sweep_truncated() {
    counter!("paper_sync_sweep_truncated_total").increment(1);
}

/// Current sweep phase (0 = Idle, 1 = Scanning, 2 = Batching, 3 = Committing, 4 = Clearing)
pub fn set_sweep_phase(phase: u8) {
    gauge!("paper_sync_sweep_phase").set(phase as f64);
}

/// A guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
