//! Public types for the reconciliation scheduler.

use std::time::Duration;

use thiserror::Error;

use crate::config::{ClearMode, PaperSyncConfig};
use crate::storage::traits::StorageError;

/// Where the current sweep is.
///
/// `Idle → Scanning → Batching → Committing → Clearing → Idle`, with
/// Scanning..Clearing repeated once per scan page. Watch it through
/// [`super::ReconciliationScheduler::subscribe()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    /// No sweep in progress
    Idle,
    /// Enumerating `paper_views:*` keys
    Scanning,
    /// Reading the counter values of one page
    Batching,
    /// Submitting the bulk increment to the durable tier
    Committing,
    /// Removing committed counters from the fast tier
    Clearing,
}

impl SweepPhase {
    /// Numeric value for the phase gauge.
    #[must_use]
    pub fn as_gauge(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Scanning => 1,
            Self::Batching => 2,
            Self::Committing => 3,
            Self::Clearing => 4,
        }
    }
}

impl std::fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Batching => write!(f, "Batching"),
            Self::Committing => write!(f, "Committing"),
            Self::Clearing => write!(f, "Clearing"),
        }
    }
}

/// Totals of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Counter keys returned by the scan (repeats included)
    pub keys_scanned: usize,
    /// Increments submitted to the durable tier
    pub items_synced: usize,
    /// Submitted increments that hit an existing paper
    pub items_matched: usize,
    /// Counter keys removed from the fast tier
    pub keys_cleared: u64,
    /// Keys left alone because their delta was zero or negative
    pub skipped_zero: usize,
    /// Keys left alone because the value or key did not parse
    pub skipped_invalid: usize,
    /// Scan pages processed
    pub pages: usize,
    /// The time budget ran out before the scan finished
    pub truncated: bool,
    pub elapsed: Duration,
}

impl SweepReport {
    /// Nothing was committed.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.items_synced == 0
    }
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// SCAN page size hint
    pub scan_count: usize,
    /// Stop at the next page boundary once a sweep has run this long
    pub time_budget: Duration,
    pub clear_mode: ClearMode,
    /// Run one more sweep from `shutdown()`
    pub sweep_on_shutdown: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::from(&PaperSyncConfig::default())
    }
}

impl From<&PaperSyncConfig> for SweepConfig {
    fn from(config: &PaperSyncConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.view_sync_interval_secs.max(1)),
            scan_count: config.view_sync_scan_count.max(1),
            time_budget: Duration::from_secs(config.view_sync_time_budget_secs),
            clear_mode: config.view_sync_clear_mode,
            sweep_on_shutdown: config.sweep_on_shutdown,
        }
    }
}

/// Why a sweep stopped. Pages committed and cleared before the failure stay
/// applied; nothing of the failing page is cleared.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SweepError {
    #[error("a sweep is already running")]
    AlreadyRunning,
    #[error("scanning view counters failed: {0}")]
    Scan(#[source] StorageError),
    #[error("reading view counters failed: {0}")]
    Read(#[source] StorageError),
    #[error("committing view increments failed: {0}")]
    Commit(#[source] StorageError),
    #[error("clearing committed view counters failed: {0}")]
    Clear(#[source] StorageError),
}

impl SweepError {
    /// Metric label of the failing stage.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "already_running",
            Self::Scan(_) => "scan",
            Self::Read(_) => "read",
            Self::Commit(_) => "commit",
            Self::Clear(_) => "clear",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("reconciliation scheduler is already running")]
    AlreadyRunning,
}
