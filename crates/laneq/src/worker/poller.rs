//! Job polling with adaptive backoff
//!
//! The interval grows while the lane is idle or the backend is failing and
//! snaps back to the minimum as soon as a poll returns jobs.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::lane::Namespace;
use crate::persistence::{ClaimedJob, QueueBackend, StoreError};
use crate::util::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Interval right after jobs were found
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Ceiling for the idle interval
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor per empty poll
    pub backoff_multiplier: f64,

    /// Growth factor per failed poll
    pub error_multiplier: f64,

    /// Maximum jobs to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            error_multiplier: 2.0,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set idle backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Claims jobs from one lane
pub struct JobPoller {
    backend: Arc<dyn QueueBackend>,
    namespace: Namespace,
    worker_id: String,
    lease_duration: Duration,
    config: PollerConfig,
    current_interval: Duration,
    consecutive_errors: u32,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobPoller {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        namespace: Namespace,
        worker_id: String,
        lease_duration: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let current_interval = config.min_interval;
        Self {
            backend,
            namespace,
            worker_id,
            lease_duration,
            config,
            current_interval,
            consecutive_errors: 0,
            shutdown_rx,
        }
    }

    /// Claim up to `max_jobs` visible jobs
    #[instrument(skip(self), fields(worker_id = %self.worker_id, queue = %self.namespace))]
    pub async fn poll(&mut self, max_jobs: usize) -> Result<Vec<ClaimedJob>, StoreError> {
        if self.is_shutdown() {
            return Ok(vec![]);
        }

        let batch = max_jobs.min(self.config.batch_size);
        let result = self
            .backend
            .claim(&self.namespace, &self.worker_id, batch, self.lease_duration)
            .await;

        match &result {
            Ok(jobs) if jobs.is_empty() => {
                self.consecutive_errors = 0;
                self.grow(self.config.backoff_multiplier);
                trace!(
                    interval_ms = self.current_interval.as_millis() as u64,
                    "No jobs, backing off"
                );
            }
            Ok(jobs) => {
                self.consecutive_errors = 0;
                self.current_interval = self.config.min_interval;
                debug!(count = jobs.len(), "Claimed jobs");
            }
            Err(_) => {
                self.consecutive_errors += 1;
                self.grow(self.config.error_multiplier);
            }
        }

        result
    }

    /// Sleep for the current interval; returns true if shutdown was signaled
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    /// Current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Failed polls in a row
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn grow(&mut self, factor: f64) {
        let next = self.current_interval.mul_f64(factor.max(1.0));
        self.current_interval = next.min(self.config.max_interval);
    }
}
