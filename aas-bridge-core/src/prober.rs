//! Availability prober: periodic reachability checks with hysteresis.
//!
//! `Up -(failure)-> Degraded -(down_threshold consecutive failures)-> Down -(success)-> Up`.
//! The synchroniser reads the current [`Availability`] from a watch channel before every
//! cycle and skips the cycle while the repository is `Down`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProbeConfig;
use crate::contract::{Probe, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Up,
    Degraded,
    Down,
}

impl Availability {
    pub fn allows_sync(&self) -> bool {
        !matches!(self, Availability::Down)
    }
}

/// The state machine, without any I/O.
#[derive(Debug, Clone)]
pub struct AvailabilityTracker {
    state: Availability,
    consecutive_failures: u32,
    down_threshold: u32,
}

impl AvailabilityTracker {
    pub fn new(down_threshold: u32) -> Self {
        Self {
            state: Availability::Up,
            consecutive_failures: 0,
            down_threshold: down_threshold.max(1),
        }
    }

    pub fn state(&self) -> Availability {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_success(&mut self) -> Availability {
        self.consecutive_failures = 0;
        self.state = Availability::Up;
        self.state
    }

    pub fn record_failure(&mut self) -> Availability {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = if self.consecutive_failures >= self.down_threshold {
            Availability::Down
        } else {
            Availability::Degraded
        };
        self.state
    }
}

/// Drives a [`Probe`] on an interval and publishes the resulting availability.
pub struct Prober {
    environment: String,
    probe: Arc<dyn Probe>,
    tracker: AvailabilityTracker,
    interval: Duration,
    tx: watch::Sender<Availability>,
}

impl Prober {
    pub fn new(environment: impl Into<String>, probe: Arc<dyn Probe>, config: &ProbeConfig) -> Self {
        let (tx, _rx) = watch::channel(Availability::Up);
        Self {
            environment: environment.into(),
            probe,
            tracker: AvailabilityTracker::new(config.down_threshold),
            interval: Duration::from_secs(config.interval_secs),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Availability> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> Availability {
        self.tracker.state()
    }

    /// Runs one probe and publishes the new state if it changed.
    pub async fn probe_once(&mut self) -> Availability {
        let before = self.tracker.state();
        let after = match self.probe.probe().await {
            Ok(()) => {
                debug!(environment = %self.environment, "[PROBE] repository reachable");
                self.tracker.record_success()
            }
            Err(e) => {
                warn!(
                    environment = %self.environment,
                    error = %e,
                    failures = self.tracker.consecutive_failures() + 1,
                    "[PROBE] repository unreachable"
                );
                self.tracker.record_failure()
            }
        };
        if before != after {
            info!(
                environment = %self.environment,
                from = ?before,
                to = ?after,
                "[PROBE] availability changed"
            );
        }
        self.tx.send_if_modified(|current| {
            let changed = *current != after;
            *current = after;
            changed
        });
        after
    }

    /// Probes immediately and then every interval until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(environment = %self.environment, "[PROBE] stopped");
                    return;
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.probe_once() => {}
                    }
                }
            }
        }
    }
}

/// Probes with a plain GET against the repository base URL. Any answer below 500 counts
/// as reachable; the repository may legitimately reject an unauthenticated root request.
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl HttpProbe {
    pub fn new(base_url: &str, headers: HeaderMap, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: base_url.trim_end_matches('/').to_string(),
            headers,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> Result<(), StoreError> {
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .send()
            .await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(format!("{} answered with status {}", self.url, status.as_u16()).into());
        }
        Ok(())
    }
}
