//! Enqueue API

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::job::{Job, JobHandle, JobInstance, JobOptions};
use crate::lane::Namespace;
use crate::persistence::{FailedJob, QueueBackend, QueueCounts, StoreError};
use crate::registry::JobRegistry;
use crate::scheduler::{schedule_record, CronSchedule, ScheduleError};

/// Enqueue errors
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// No handler registered under this name
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Writes jobs to the current lane
///
/// Cheap to clone; every clone shares the backend connection.
///
/// # Example
///
/// ```ignore
/// let handle = producer
///     .enqueue("email:send", &json!({"to": "a@example.com"}), None)
///     .await?;
/// ```
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn QueueBackend>,
    registry: Arc<JobRegistry>,
    namespace: Namespace,
}

impl Producer {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        registry: Arc<JobRegistry>,
        namespace: Namespace,
    ) -> Self {
        Self {
            backend,
            registry,
            namespace,
        }
    }

    /// Namespace jobs are written to
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Enqueue a job by name
    ///
    /// Once this returns `Ok`, the job is durable in the backend. With a
    /// caller-provided `job_id` that already exists the call is a no-op and
    /// the handle reports `created: false`.
    #[instrument(skip(self, payload, options), fields(queue = %self.namespace))]
    pub async fn enqueue<P>(
        &self,
        name: &str,
        payload: &P,
        options: Option<JobOptions>,
    ) -> Result<JobHandle, EnqueueError>
    where
        P: Serialize + ?Sized,
    {
        let definition = self
            .registry
            .resolve(name)
            .map_err(|_| EnqueueError::UnknownJob(name.to_string()))?;
        let payload = serde_json::to_value(payload)?;
        let options = options.unwrap_or_default();
        let policy = options.merge_over(definition.retry_policy());

        let mut instance =
            JobInstance::new(name, payload, &policy, self.namespace.lane().clone());
        if let Some(id) = &options.job_id {
            instance = instance.with_id(id.clone());
        }
        let id = instance.id.clone();

        let created = self
            .backend
            .enqueue(
                &self.namespace,
                instance,
                options.delay.unwrap_or(Duration::ZERO),
            )
            .await?;

        debug!(id = %id, name, created, "Job enqueued");

        Ok(JobHandle {
            id,
            name: name.to_string(),
            lane: self.namespace.lane().clone(),
            created,
        })
    }

    /// Enqueue a typed job
    pub async fn enqueue_job<J: Job>(
        &self,
        payload: &J::Payload,
        options: Option<JobOptions>,
    ) -> Result<JobHandle, EnqueueError> {
        self.enqueue(J::NAME, payload, options).await
    }

    /// Create or update a recurring trigger for a registered job
    ///
    /// Idempotent: repeating the call with the same expression keeps the
    /// pending firing and only refreshes the payload.
    #[instrument(skip(self, payload), fields(queue = %self.namespace))]
    pub async fn schedule_cron<P>(
        &self,
        name: &str,
        expression: &str,
        payload: &P,
    ) -> Result<(), EnqueueError>
    where
        P: Serialize + ?Sized,
    {
        if !self.registry.contains(name) {
            return Err(EnqueueError::UnknownJob(name.to_string()));
        }

        let schedule = CronSchedule::parse(expression)?;
        let record = schedule_record(name, &schedule, serde_json::to_value(payload)?, Utc::now())?;
        self.backend.upsert_schedule(&self.namespace, record).await?;

        debug!(name, expression, "Cron scheduled");
        Ok(())
    }

    /// Remove a recurring trigger; returns whether it existed
    pub async fn unschedule_cron(&self, name: &str) -> Result<bool, EnqueueError> {
        Ok(self.backend.remove_schedule(&self.namespace, name).await?)
    }

    /// Current queue sizes of the lane
    pub async fn counts(&self) -> Result<QueueCounts, EnqueueError> {
        Ok(self.backend.counts(&self.namespace).await?)
    }

    /// Retained failures of the lane, most recent first
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<FailedJob>, EnqueueError> {
        Ok(self.backend.failed_jobs(&self.namespace, limit).await?)
    }
}
