//! Interval driver for one environment's [`Synchroniser`].
//!
//! After a `Fatal` cycle no further cycles are scheduled until a manually triggered cycle
//! publishes a non-fatal report.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::SyncConfig;
use crate::synchronise::{CycleOutcome, SynchroniseReport, Synchroniser};

pub struct Scheduler {
    synchroniser: Arc<Synchroniser>,
    interval: Duration,
    backoff: ExponentialBackoff,
}

impl Scheduler {
    pub fn new(synchroniser: Arc<Synchroniser>, config: &SyncConfig) -> Self {
        Self {
            synchroniser,
            interval: config.interval(),
            backoff: ExponentialBackoff::new(
                Duration::from_secs(config.backoff_min_secs),
                Duration::from_secs(config.backoff_max_secs),
            ),
        }
    }

    /// Delay before the next cycle given the last report.
    pub fn next_delay(&mut self, report: &SynchroniseReport) -> Duration {
        match report.outcome {
            CycleOutcome::SkippedUnavailable => self.backoff.next_delay(),
            _ => {
                self.backoff.reset();
                self.interval
            }
        }
    }

    /// Runs a cycle immediately, then keeps going until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let environment = self.synchroniser.environment().to_string();
        info!(
            environment = %environment,
            interval_secs = self.interval.as_secs(),
            "[SYNC] scheduler started"
        );
        loop {
            if cancel.is_cancelled() {
                break;
            }
            // Not raced against `cancel`: the cycle observes its own token and rolls back.
            let report = self.synchroniser.run_cycle().await;
            if let CycleOutcome::Fatal { reason } = &report.outcome {
                warn!(environment = %environment, reason = %reason, "[SYNC] scheduled cycles paused until a manual trigger succeeds");
                if !self.wait_for_recovery(&cancel).await {
                    break;
                }
                info!(environment = %environment, "[SYNC] scheduled cycles resumed");
            }
            let delay = self.next_delay(&report);
            debug!(environment = %environment, delay_ms = delay.as_millis() as u64, "[SYNC] next cycle scheduled");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(environment = %environment, "[SYNC] scheduler stopped");
    }

    /// Waits for a published report that is not `Fatal`. False when cancelled first.
    async fn wait_for_recovery(&self, cancel: &CancellationToken) -> bool {
        let mut reports = self.synchroniser.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => false,
            recovered = reports.wait_for(|latest| {
                latest
                    .as_ref()
                    .is_some_and(|r| !matches!(r.outcome, CycleOutcome::Fatal { .. }))
            }) => recovered.is_ok(),
        }
    }
}
