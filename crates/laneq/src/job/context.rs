//! Job execution context

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::JobInstance;
use crate::lane::Lane;

/// Context provided to a handler for one attempt
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job instance ID
    pub id: String,

    /// Registered job name
    pub name: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Lane the instance was enqueued on
    pub lane: Lane,

    /// When the instance was first enqueued
    pub enqueued_at: DateTime<Utc>,

    cancel: CancellationToken,
}

impl JobContext {
    /// Build the context for an attempt of `instance`
    pub fn for_instance(instance: &JobInstance) -> Self {
        Self {
            id: instance.id.clone(),
            name: instance.name.clone(),
            attempt: instance.attempt,
            max_attempts: instance.max_attempts,
            lane: instance.lane.clone(),
            enqueued_at: instance.enqueued_at,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the attempt to `token`: cancelling it tells the handler to wrap up
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Whether the attempt was cancelled (timeout or abandoned at shutdown)
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => result,
    ///     _ = ctx.cancelled() => Err(JobError::retryable("cancelled")),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Whether a failure of this attempt is terminal
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
