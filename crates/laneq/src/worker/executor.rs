//! Execution of a single claimed job

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::job::{JobContext, JobError, JobInstance};
use crate::lane::Namespace;
use crate::observability::{EventSink, FailureReason, JobEvent};
use crate::persistence::{ClaimedJob, Lease, QueueBackend, StoreError};
use crate::registry::JobRegistry;

/// Error type attached to failures for names missing from the registry
pub const UNKNOWN_JOB: &str = "UNKNOWN_JOB";

/// Error type attached to attempts that exceeded the job timeout
pub const TIMEOUT: &str = "TIMEOUT";

/// Error type attached to attempts whose handler panicked
pub const PANIC: &str = "PANIC";

/// How one attempt ended
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success,
    RetryableFailure(JobError),
    FatalFailure(JobError),
}

impl ExecutionOutcome {
    fn from_handler(result: Result<(), JobError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) if e.retryable => Self::RetryableFailure(e),
            Err(e) => Self::FatalFailure(e),
        }
    }

    fn from_join(joined: Result<Result<(), JobError>, JoinError>) -> Self {
        match joined {
            Ok(result) => Self::from_handler(result),
            Err(e) if e.is_panic() => Self::RetryableFailure(
                JobError::retryable(format!(
                    "handler panicked: {}",
                    panic_message(e.into_panic())
                ))
                .with_type(PANIC),
            ),
            Err(_) => Self::RetryableFailure(JobError::retryable("handler task was cancelled")),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Everything a job slot needs, shared by all slots of a pool
pub(crate) struct JobExecutor {
    pub backend: Arc<dyn QueueBackend>,
    pub registry: Arc<JobRegistry>,
    pub sink: EventSink,
    pub namespace: Namespace,
    pub lease_duration: Duration,
    pub job_timeout: Option<Duration>,
    pub remove_on_fail: bool,
}

impl JobExecutor {
    /// Run one attempt and settle it with the backend
    ///
    /// Returns `None` if the attempt was abandoned because `cancel` fired;
    /// the lease is then left to expire so another worker picks the job up.
    pub async fn execute(
        &self,
        claimed: ClaimedJob,
        cancel: CancellationToken,
    ) -> Option<ExecutionOutcome> {
        let ClaimedJob { instance, lease } = claimed;
        let started = Instant::now();

        let renewal = self.spawn_lease_renewal(lease.clone());
        let outcome = self.run_attempt(&instance, &cancel).await;
        renewal.abort();

        let Some(outcome) = outcome else {
            warn!(
                id = %instance.id,
                name = %instance.name,
                "attempt abandoned at shutdown, lease left to expire"
            );
            return None;
        };

        self.settle(&instance, &lease, &outcome, started.elapsed())
            .await;
        Some(outcome)
    }

    async fn run_attempt(
        &self,
        instance: &JobInstance,
        cancel: &CancellationToken,
    ) -> Option<ExecutionOutcome> {
        let definition = match self.registry.resolve(&instance.name) {
            Ok(definition) => definition,
            Err(e) => {
                return Some(ExecutionOutcome::FatalFailure(
                    JobError::fatal(e.to_string()).with_type(UNKNOWN_JOB),
                ))
            }
        };

        let attempt_cancel = cancel.child_token();
        let ctx = JobContext::for_instance(instance).with_cancellation(attempt_cancel.clone());
        let mut handle: JoinHandle<Result<(), JobError>> =
            tokio::spawn(definition.invoke(ctx, instance.payload.clone()));

        let job_timeout = self.job_timeout;
        let deadline = async move {
            match job_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            joined = &mut handle => Some(ExecutionOutcome::from_join(joined)),
            _ = deadline => {
                attempt_cancel.cancel();
                handle.abort();
                let limit = job_timeout.unwrap_or_default();
                Some(ExecutionOutcome::RetryableFailure(
                    JobError::retryable(format!("job timed out after {}ms", limit.as_millis()))
                        .with_type(TIMEOUT),
                ))
            }
            _ = cancel.cancelled() => {
                handle.abort();
                None
            }
        }
    }

    async fn settle(
        &self,
        instance: &JobInstance,
        lease: &Lease,
        outcome: &ExecutionOutcome,
        elapsed: Duration,
    ) {
        match outcome {
            ExecutionOutcome::Success => {
                match self.backend.complete(&self.namespace, lease).await {
                    Ok(()) => self.sink.emit(JobEvent::Completed {
                        id: instance.id.clone(),
                        name: instance.name.clone(),
                        attempt: instance.attempt,
                        duration: elapsed,
                    }),
                    Err(e) => self.ack_failed("complete", instance, e),
                }
            }
            ExecutionOutcome::RetryableFailure(error) if instance.has_attempts_remaining() => {
                let delay = instance.next_retry_delay();
                let message = error.to_string();
                match self
                    .backend
                    .retry(&self.namespace, lease, delay, &message)
                    .await
                {
                    Ok(next_attempt) => {
                        debug!(id = %instance.id, next_attempt, "retry scheduled");
                        self.sink.emit(JobEvent::Retrying {
                            id: instance.id.clone(),
                            name: instance.name.clone(),
                            attempt: instance.attempt,
                            error: message,
                            delay,
                        });
                    }
                    Err(e) => self.ack_failed("retry", instance, e),
                }
            }
            ExecutionOutcome::RetryableFailure(error) => {
                self.fail(instance, lease, error, FailureReason::Exhausted)
                    .await
            }
            ExecutionOutcome::FatalFailure(error) => {
                let reason = if error.error_type.as_deref() == Some(UNKNOWN_JOB) {
                    FailureReason::UnknownJob
                } else {
                    FailureReason::Fatal
                };
                self.fail(instance, lease, error, reason).await
            }
        }
    }

    async fn fail(
        &self,
        instance: &JobInstance,
        lease: &Lease,
        error: &JobError,
        reason: FailureReason,
    ) {
        let message = error.to_string();
        match self
            .backend
            .fail(&self.namespace, lease, &message, !self.remove_on_fail)
            .await
        {
            Ok(()) => self.sink.emit(JobEvent::Failed {
                id: instance.id.clone(),
                name: instance.name.clone(),
                attempt: instance.attempt,
                error: message,
                reason,
            }),
            Err(e) => self.ack_failed("fail", instance, e),
        }
    }

    fn ack_failed(&self, operation: &str, instance: &JobInstance, error: StoreError) {
        match error {
            StoreError::LeaseLost(_) => warn!(
                id = %instance.id,
                name = %instance.name,
                operation,
                "lease lost before acknowledgement, job may run again"
            ),
            other => self.sink.emit(JobEvent::BackendError {
                operation: operation.to_string(),
                error: format!("job {}: {other}", instance.id),
            }),
        }
    }

    fn spawn_lease_renewal(&self, lease: Lease) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let namespace = self.namespace.clone();
        let lease_duration = self.lease_duration;
        let every = (lease_duration / 3).max(Duration::from_millis(10));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match backend.extend_lease(&namespace, &lease, lease_duration).await {
                    Ok(true) => trace!(job_id = %lease.job_id, "lease extended"),
                    Ok(false) => {
                        warn!(job_id = %lease.job_id, "lease lost while executing");
                        break;
                    }
                    Err(e) => warn!(job_id = %lease.job_id, error = %e, "lease renewal failed"),
                }
            }
        })
    }
}
