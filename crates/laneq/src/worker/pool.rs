//! Worker pool for job execution
//!
//! Claims jobs from one lane with bounded concurrency, runs them, and keeps
//! a reclaim loop that returns jobs with expired leases to the queue.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backpressure::{BackpressureConfig, BackpressureState};
use super::executor::JobExecutor;
use super::poller::{JobPoller, PollerConfig};
use crate::lane::Namespace;
use crate::observability::{EventSink, FailureReason, JobEvent};
use crate::persistence::{QueueBackend, StallPolicy, StoreError, STALLED_ERROR};
use crate::registry::JobRegistry;
use crate::util::{duration_millis, option_duration_millis};

/// Default number of concurrently executing jobs
pub const DEFAULT_MAX_CONCURRENCY: usize = 50;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Maximum concurrent job executions
    pub max_concurrency: usize,

    /// How long a claim stays valid without renewal
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// How often expired leases are swept
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,

    /// What happens to jobs whose lease expires
    pub stall_policy: StallPolicy,

    /// Delete terminally failed jobs instead of keeping them in the failed set
    pub remove_on_fail: bool,

    /// Per-attempt time limit; exceeding it is a retryable failure
    #[serde(default, with = "option_duration_millis")]
    pub job_timeout: Option<Duration>,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Backpressure configuration
    pub backpressure: BackpressureConfig,

    /// Poller configuration
    pub poller: PollerConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            lease_duration: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(30),
            stall_policy: StallPolicy::default(),
            remove_on_fail: true,
            job_timeout: None,
            shutdown_timeout: Duration::from_secs(30),
            backpressure: BackpressureConfig::default(),
            poller: PollerConfig::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the lease duration
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    /// Set the stale lease sweep interval
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Set the stall policy
    pub fn with_stall_policy(mut self, policy: StallPolicy) -> Self {
        self.stall_policy = policy;
        self
    }

    /// Keep or delete terminally failed jobs, stalled ones included
    pub fn with_remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = remove;
        self.stall_policy.retain_failed = !remove;
        self
    }

    /// Set the per-attempt time limit
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set backpressure configuration
    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Claiming and executing jobs
    Running,
    /// No longer claiming, waiting for in-flight jobs
    Draining,
    /// Not running
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Some jobs were still running at the deadline and were abandoned
    #[error("graceful shutdown timed out with {abandoned} jobs still running")]
    ShutdownTimeout { abandoned: usize },
}

/// Worker pool executing the jobs of one lane
///
/// # Example
///
/// ```ignore
/// use laneq::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::new().with_max_concurrency(20);
/// let pool = WorkerPool::new(backend, registry, namespace, sink, config);
///
/// pool.start().await?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    executor: Arc<JobExecutor>,
    backpressure: Arc<BackpressureState>,
    slots: Arc<Semaphore>,
    status: RwLock<WorkerPoolStatus>,
    shutdown_tx: watch::Sender<bool>,
    abandon: CancellationToken,
    shutdown_lock: tokio::sync::Mutex<()>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<JobRegistry>,
        namespace: Namespace,
        sink: EventSink,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let max_concurrency = config.max_concurrency.max(1);

        Self {
            executor: Arc::new(JobExecutor {
                backend,
                registry,
                sink,
                namespace,
                lease_duration: config.lease_duration,
                job_timeout: config.job_timeout,
                remove_on_fail: config.remove_on_fail,
            }),
            backpressure: Arc::new(BackpressureState::new(
                config.backpressure.clone(),
                max_concurrency,
            )),
            slots: Arc::new(Semaphore::new(max_concurrency)),
            status: RwLock::new(WorkerPoolStatus::Stopped),
            shutdown_tx,
            abandon: CancellationToken::new(),
            shutdown_lock: tokio::sync::Mutex::new(()),
            poll_handle: Mutex::new(None),
            reclaim_handle: Mutex::new(None),
            config,
        }
    }

    /// Start claiming jobs
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped || *self.shutdown_tx.borrow() {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            queue = %self.executor.namespace,
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        self.start_poll_loop();
        self.start_reclaim_loop();
        Ok(())
    }

    /// Stop claiming and wait for in-flight jobs
    ///
    /// Jobs still running after `shutdown_timeout` are abandoned; their
    /// leases expire and another worker picks them up. Safe to call more
    /// than once and from several tasks.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        let _guard = self.shutdown_lock.lock().await;
        if *self.status.read() == WorkerPoolStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let poll_handle = self.poll_handle.lock().take();
        let reclaim_handle = self.reclaim_handle.lock().take();
        for handle in [poll_handle, reclaim_handle].into_iter().flatten() {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let max = self.config.max_concurrency.max(1);
        let result = loop {
            let available = self.slots.available_permits();
            if available == max {
                debug!("All jobs finished");
                break Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                let abandoned = max - available;
                warn!(abandoned, "Shutdown timeout reached, abandoning running jobs");
                self.abandon.cancel();
                break Err(WorkerPoolError::ShutdownTimeout { abandoned });
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        result
    }

    /// Current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Jobs currently executing
    pub fn in_flight(&self) -> usize {
        self.backpressure.in_flight()
    }

    /// The worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// The lane this pool drains
    pub fn namespace(&self) -> &Namespace {
        &self.executor.namespace
    }

    /// Check if the pool is claiming
    pub fn is_accepting(&self) -> bool {
        self.backpressure.is_accepting() && self.status() == WorkerPoolStatus::Running
    }

    fn start_poll_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let backpressure = Arc::clone(&self.backpressure);
        let slots = Arc::clone(&self.slots);
        let abandon = self.abandon.clone();
        let mut poller = JobPoller::new(
            Arc::clone(&executor.backend),
            executor.namespace.clone(),
            self.config.worker_id.clone(),
            self.config.lease_duration,
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );

        let handle = tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    break;
                }

                // Claim no more than the free slot count, so leased jobs
                // never outnumber slots
                let free = slots.available_permits();
                if free == 0 || !backpressure.should_accept() {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                let claimed = match poller.poll(free).await {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        executor.sink.emit(JobEvent::BackendError {
                            operation: "claim".to_string(),
                            error: e.to_string(),
                        });
                        if poller.wait().await {
                            break;
                        }
                        continue;
                    }
                };
                let found = !claimed.is_empty();

                for job in claimed {
                    let permit = match Arc::clone(&slots).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    backpressure.job_started();

                    let executor = Arc::clone(&executor);
                    let backpressure = Arc::clone(&backpressure);
                    let abandon = abandon.clone();
                    tokio::spawn(async move {
                        executor.execute(job, abandon).await;
                        backpressure.job_finished();
                        drop(permit);
                    });
                }

                // Go straight back for more while the lane has work
                if !found && poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    fn start_reclaim_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let interval = self.config.reclaim_interval;
        let policy = self.config.stall_policy;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match executor.backend.reclaim_expired(&executor.namespace, policy).await {
                            Ok(report) => {
                                if !report.requeued.is_empty() {
                                    info!(count = report.requeued.len(), "Requeued jobs with expired leases");
                                }
                                for stalled in report.failed {
                                    executor.sink.emit(JobEvent::Failed {
                                        id: stalled.id,
                                        name: stalled.name,
                                        attempt: stalled.attempt,
                                        error: STALLED_ERROR.to_string(),
                                        reason: FailureReason::Stalled,
                                    });
                                }
                            }
                            Err(e) => executor.sink.emit(JobEvent::BackendError {
                                operation: "reclaim_expired".to_string(),
                                error: e.to_string(),
                            }),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            debug!("Reclaim loop exited");
        });

        *self.reclaim_handle.lock() = Some(handle);
    }
}
