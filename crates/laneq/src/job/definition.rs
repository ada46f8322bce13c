//! Job trait definitions

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::JobContext;
use crate::reliability::RetryPolicy;

/// Error type for job failures
///
/// Errors are retryable unless explicitly marked fatal. Anything converted
/// from an untyped error (`anyhow::Error`, a panic, a timeout) is retryable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Fatal errors fail the job immediately without further attempts.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl JobError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a fatal (non-retryable) error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for JobError {}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// A named unit of asynchronous work
///
/// # Example
///
/// ```ignore
/// use laneq::prelude::*;
///
/// struct SendWelcomeEmail;
///
/// #[derive(Serialize, Deserialize)]
/// struct WelcomeEmail {
///     user_id: String,
/// }
///
/// #[async_trait]
/// impl Job for SendWelcomeEmail {
///     const NAME: &'static str = "user:send_welcome_email";
///     type Payload = WelcomeEmail;
///
///     async fn run(&self, ctx: &JobContext, payload: WelcomeEmail) -> Result<(), JobError> {
///         mailer::send(&payload.user_id).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Unique name used to look up the job in the registry
    const NAME: &'static str;

    /// Payload carried by each job instance
    type Payload: Serialize + DeserializeOwned + Send;

    /// Default retry policy for instances of this job
    fn retry_policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Execute one attempt
    ///
    /// Must be safe to run more than once for the same instance: delivery
    /// is at-least-once.
    ///
    /// # Errors
    ///
    /// Return `JobError::retryable()` for transient failures that should be retried.
    /// Return `JobError::fatal()` for permanent failures.
    async fn run(&self, ctx: &JobContext, payload: Self::Payload) -> Result<(), JobError>;
}

/// A job fired on a recurring schedule
///
/// # Example
///
/// ```ignore
/// struct PurgeExpiredSessions;
///
/// #[async_trait]
/// impl Cron for PurgeExpiredSessions {
///     const NAME: &'static str = "session:purge_expired";
///     const SCHEDULE: &'static str = "*/15 * * * *";
///
///     async fn run(&self, _ctx: &JobContext) -> Result<(), JobError> {
///         sessions::purge_expired().await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Cron: Send + Sync + 'static {
    /// Unique name (shared namespace with jobs)
    const NAME: &'static str;

    /// Cron expression, 5 fields (minute precision) or 6/7 fields (seconds)
    const SCHEDULE: &'static str;

    /// Default retry policy for each firing
    fn retry_policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Execute one firing
    async fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}
