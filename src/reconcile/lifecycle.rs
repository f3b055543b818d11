//! Scheduler lifecycle: start, run loop, stop, shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::types::{SchedulerError, SweepError};
use super::{ReconciliationScheduler, RunningTask};

impl ReconciliationScheduler {
    /// Spawn the timer loop. The first sweep runs one interval from now.
    #[tracing::instrument(skip(self))]
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        *slot = Some(RunningTask {
            shutdown: shutdown_tx,
            handle,
        });
        info!(
            interval_secs = self.config.interval.as_secs(),
            clear_mode = ?self.config.clear_mode,
            "View reconciliation scheduled"
        );
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        // A sweep that overran its slot is followed by one sweep, not a burst
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Other failures are logged by the sweep; the next tick retries
                    if let Err(SweepError::AlreadyRunning) = self.sweep_now().await {
                        debug!("Skipping tick, a manual sweep is in progress");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("View reconciliation loop exited");
    }

    /// Stop the timer loop. A sweep in progress finishes first.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };

        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "View reconciliation task ended abnormally");
        }
        info!("View reconciliation stopped");
    }

    /// Stop the loop, then run a final sweep if configured.
    ///
    /// A manual sweep still in flight is waited for, so the final sweep
    /// always runs.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.stop().await;

        if self.config.sweep_on_shutdown {
            info!("Running final view sweep before shutdown");
            // Failures are logged inside the sweep
            let _ = self.sweep_when_idle().await;
        }
    }
}
