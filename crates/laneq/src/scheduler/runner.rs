//! Materialises cron firings into job instances

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::schedule::{CronSchedule, ScheduleError};
use crate::job::JobInstance;
use crate::lane::Namespace;
use crate::observability::{EventSink, JobEvent};
use crate::persistence::{QueueBackend, ScheduleRecord, StoreError};
use crate::registry::JobRegistry;
use crate::reliability::RetryPolicy;
use crate::util::duration_millis;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// How often due schedules are checked
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// Maximum schedules handled per tick
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// ID of the instance materialised for one firing
///
/// Deterministic, so two processes racing on the same firing enqueue one job.
pub fn firing_id(name: &str, fire_at: DateTime<Utc>) -> String {
    format!("repeat:{}:{}", name, fire_at.timestamp_millis())
}

/// Build the stored record for a schedule, first firing after `now`
pub fn schedule_record(
    name: impl Into<String>,
    schedule: &CronSchedule,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<ScheduleRecord, ScheduleError> {
    Ok(ScheduleRecord {
        name: name.into(),
        cron: schedule.expression().to_string(),
        payload,
        next_run_at: schedule.upcoming(now)?,
        updated_at: now,
    })
}

/// Drives the recurring triggers of one lane
///
/// Several processes may run a scheduler on the same lane; the firing id
/// dedupes their enqueues and the compare-and-swap on `next_run_at` lets
/// exactly one of them move the schedule forward.
pub struct CronScheduler {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<JobRegistry>,
    namespace: Namespace,
    sink: EventSink,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<JobRegistry>,
        namespace: Namespace,
        sink: EventSink,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            backend,
            registry,
            namespace,
            sink,
            config,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Fire every schedule due at `now`
    ///
    /// Returns the number of instances enqueued. Firings missed while no
    /// scheduler was running collapse into a single one: the next firing is
    /// always computed after `now`. A firing is enqueued before the schedule
    /// moves on, so a failed tick is repeated on the next one.
    #[instrument(skip(self), fields(queue = %self.namespace))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let due = self
            .backend
            .due_schedules(&self.namespace, now, self.config.batch_size)
            .await?;

        let mut fired = 0;
        for record in due {
            if self.fire(&record, now).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn fire(&self, record: &ScheduleRecord, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let next = match CronSchedule::parse(&record.cron).and_then(|s| s.upcoming(now)) {
            Ok(next) => next,
            Err(e) => {
                warn!(name = %record.name, error = %e, "Removing schedule that cannot fire");
                self.backend
                    .remove_schedule(&self.namespace, &record.name)
                    .await?;
                return Ok(false);
            }
        };

        let policy = match self.registry.resolve(&record.name) {
            Ok(definition) => definition.retry_policy().clone(),
            Err(_) => {
                warn!(name = %record.name, "Schedule has no registered handler");
                RetryPolicy::default()
            }
        };

        // Enqueue before advancing: a failure in between leaves the schedule
        // due, and the firing id makes the retried enqueue a no-op.
        let instance = JobInstance::new(
            record.name.clone(),
            record.payload.clone(),
            &policy,
            self.namespace.lane().clone(),
        )
        .with_id(firing_id(&record.name, record.next_run_at));
        let id = instance.id.clone();

        let created = self
            .backend
            .enqueue(&self.namespace, instance, Duration::ZERO)
            .await?;

        let won = self
            .backend
            .advance_schedule(&self.namespace, &record.name, record.next_run_at, next)
            .await?;
        if won {
            debug!(name = %record.name, id = %id, created, next_run_at = %next, "Cron fired");
        } else {
            debug!(name = %record.name, id = %id, created, "Schedule advanced by another scheduler");
        }
        Ok(created)
    }

    /// Start ticking in the background
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        info!(
            queue = %self.namespace,
            crons = self.registry.crons().len(),
            "Starting cron scheduler"
        );

        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.tick(Utc::now()).await {
                            scheduler.sink.emit(JobEvent::BackendError {
                                operation: "schedule_tick".to_string(),
                                error: e.to_string(),
                            });
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            debug!("Scheduler loop exited");
        }));
    }

    /// Stop ticking; a tick in progress finishes first
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
