//! Process lifecycle: start, produce, stop

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, instrument, warn};

use crate::config::LaneqConfig;
use crate::lane::Namespace;
use crate::observability::{EventSink, JobEvent, TelemetryReporter};
use crate::persistence::{QueueBackend, StoreError};
use crate::producer::Producer;
use crate::registry::JobRegistry;
use crate::scheduler::{schedule_record, CronScheduler, ScheduleError};
use crate::worker::{WorkerPool, WorkerPoolError, WorkerPoolStatus};

/// Upper bound for draining telemetry reports during stop
pub const SINK_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cron {name}: {source}")]
    Schedule {
        name: String,
        #[source]
        source: ScheduleError,
    },

    #[error("worker pool error: {0}")]
    Pool(#[from] WorkerPoolError),
}

/// A running queue process bound to one lane
///
/// # Example
///
/// ```ignore
/// let runtime = QueueRuntime::start(config, registry, backend, reporter).await?;
///
/// runtime.producer().enqueue("email:send", &payload, None).await?;
///
/// runtime.stop().await;
/// ```
pub struct QueueRuntime {
    namespace: Namespace,
    backend: Arc<dyn QueueBackend>,
    producer: Producer,
    sink: EventSink,
    pool: Option<WorkerPool>,
    scheduler: Option<Arc<CronScheduler>>,
    stopped: Mutex<bool>,
}

impl QueueRuntime {
    /// Connect to the lane and, unless producer-only, start consuming
    ///
    /// Every cron definition in the registry gets its schedule upserted, so
    /// restarting a process never duplicates or resets a schedule. A payload
    /// already stored for the schedule is kept.
    #[instrument(skip_all, fields(stack = %config.lane.stack))]
    pub async fn start(
        config: LaneqConfig,
        registry: Arc<JobRegistry>,
        backend: Arc<dyn QueueBackend>,
        reporter: Arc<dyn TelemetryReporter>,
    ) -> Result<Self, RuntimeError> {
        backend.ping().await?;

        let namespace = config.namespace();
        let sink = EventSink::new(reporter, config.sink_capacity);

        // Payloads stored through the producer outlive restarts; the
        // registry payload only seeds new schedules.
        let stored: HashMap<String, serde_json::Value> = backend
            .list_schedules(&namespace)
            .await?
            .into_iter()
            .map(|record| (record.name, record.payload))
            .collect();

        let now = Utc::now();
        for cron in registry.crons() {
            let payload = stored
                .get(&cron.name)
                .cloned()
                .unwrap_or_else(|| cron.payload.clone());
            let record = schedule_record(&cron.name, &cron.schedule, payload, now)
                .map_err(|source| RuntimeError::Schedule {
                    name: cron.name.clone(),
                    source,
                })?;
            backend.upsert_schedule(&namespace, record).await?;
        }

        let producer = Producer::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
            namespace.clone(),
        );

        let (pool, scheduler) = if config.producer_only {
            (None, None)
        } else {
            let pool = WorkerPool::new(
                Arc::clone(&backend),
                Arc::clone(&registry),
                namespace.clone(),
                sink.clone(),
                config.pool.clone(),
            );
            pool.start().await?;

            let scheduler = Arc::new(CronScheduler::new(
                Arc::clone(&backend),
                Arc::clone(&registry),
                namespace.clone(),
                sink.clone(),
                config.scheduler.clone(),
            ));
            scheduler.start();

            (Some(pool), Some(scheduler))
        };

        info!(
            queue = %namespace,
            jobs = registry.len(),
            crons = registry.crons().len(),
            producer_only = config.producer_only,
            "Queue runtime started"
        );

        Ok(Self {
            namespace,
            backend,
            producer,
            sink,
            pool,
            scheduler,
            stopped: Mutex::new(false),
        })
    }

    /// Handle for enqueueing jobs on this lane
    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    /// The lane this runtime serves
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Receive job events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sink.subscribe()
    }

    /// The event sink shared by the pool and scheduler
    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Worker pool status, `None` in producer-only mode
    pub fn pool_status(&self) -> Option<WorkerPoolStatus> {
        self.pool.as_ref().map(WorkerPool::status)
    }

    /// Jobs currently executing in this process
    pub fn in_flight(&self) -> usize {
        self.pool.as_ref().map_or(0, WorkerPool::in_flight)
    }

    /// Check if `stop` has completed
    pub async fn is_stopped(&self) -> bool {
        *self.stopped.lock().await
    }

    /// Stop consuming and release every resource
    ///
    /// Stops claiming, waits for in-flight jobs up to the shutdown timeout
    /// (leaving the rest to lease expiry), stops the scheduler, flushes
    /// telemetry and closes the backend. Concurrent and repeated calls are
    /// safe; the work happens once.
    #[instrument(skip(self), fields(queue = %self.namespace))]
    pub async fn stop(&self) {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return;
        }

        if let Some(pool) = &self.pool {
            if let Err(e) = pool.shutdown().await {
                warn!(error = %e, "Worker pool did not drain cleanly");
            }
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop().await;
        }

        self.sink.flush(SINK_FLUSH_TIMEOUT).await;
        self.backend.close().await;

        *stopped = true;
        info!("Queue runtime stopped");
    }
}
