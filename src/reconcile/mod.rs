// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic reconciliation of view counters into the durable tier.
//!
//! The scheduler is the only component that moves view counts from the
//! fast tier into `papers.views`, and the only one that deletes view
//! counter keys. Clearing happens strictly after the durable commit is
//! acknowledged, so a failure anywhere leaves the counters in place for the
//! next tick: accounting is at-least-once, never lossy.
//!
//! # Module Structure
//!
//! - [`types`] - phases, reports, config and errors
//! - `sweep` - one sweep (scan, batch, commit, clear)
//! - `lifecycle` - timer loop with start/stop/shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use paper_sync::reconcile::{ReconciliationScheduler, SweepConfig};
//! # use paper_sync::storage::memory::{InMemoryDurableStore, InMemoryFastStore};
//! # async fn example() {
//! let scheduler = Arc::new(ReconciliationScheduler::new(
//!     Arc::new(InMemoryFastStore::new()),
//!     Arc::new(InMemoryDurableStore::new()),
//!     SweepConfig::default(),
//! ));
//!
//! scheduler.start().expect("not started yet");
//! // ...
//! scheduler.shutdown().await; // stop the loop, then one last sweep
//! # }
//! ```

mod lifecycle;
mod sweep;
pub mod types;

pub use types::{SchedulerError, SweepConfig, SweepError, SweepPhase, SweepReport};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::storage::traits::{DurableStore, FastStore};

/// Handle of the spawned timer loop.
struct RunningTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ReconciliationScheduler {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    config: SweepConfig,
    /// Held for the whole of a sweep; timer and manual sweeps share it
    sweep_lock: tokio::sync::Mutex<()>,
    phase: watch::Sender<SweepPhase>,
    task: Mutex<Option<RunningTask>>,
}

impl ReconciliationScheduler {
    pub fn new(fast: Arc<dyn FastStore>, durable: Arc<dyn DurableStore>, config: SweepConfig) -> Self {
        let (phase, _) = watch::channel(SweepPhase::Idle);
        Self {
            fast,
            durable,
            config,
            sweep_lock: tokio::sync::Mutex::new(()),
            phase,
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Current sweep phase.
    #[must_use]
    pub fn phase(&self) -> SweepPhase {
        *self.phase.borrow()
    }

    /// Receiver that sees every phase change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SweepPhase> {
        self.phase.subscribe()
    }
}
