//! Job lifecycle events

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::duration_millis;

/// Why a job reached a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Retryable failures used up every attempt
    Exhausted,
    /// The handler reported a non-retryable error
    Fatal,
    /// No handler registered under the job's name
    UnknownJob,
    /// The lease expired too many times
    Stalled,
}

impl FailureReason {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Fatal => "fatal",
            Self::UnknownJob => "unknown_job",
            Self::Stalled => "stalled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something worth recording about a job or the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Handler succeeded and the job was acknowledged
    Completed {
        id: String,
        name: String,
        attempt: u32,
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Handler failed and another attempt was scheduled
    Retrying {
        id: String,
        name: String,
        attempt: u32,
        error: String,
        #[serde(with = "duration_millis")]
        delay: Duration,
    },

    /// Terminal failure
    Failed {
        id: String,
        name: String,
        attempt: u32,
        error: String,
        reason: FailureReason,
    },

    /// A backend operation failed outside of any single job
    BackendError { operation: String, error: String },
}

impl JobEvent {
    /// Stable event name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::BackendError { .. } => "error",
        }
    }

    /// Error-class events are forwarded to the telemetry reporter
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Completed { .. })
    }

    /// Job ID, if the event concerns a job
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Completed { id, .. } | Self::Retrying { id, .. } | Self::Failed { id, .. } => {
                Some(id)
            }
            Self::BackendError { .. } => None,
        }
    }

    /// Job name, if the event concerns a job
    pub fn job_name(&self) -> Option<&str> {
        match self {
            Self::Completed { name, .. }
            | Self::Retrying { name, .. }
            | Self::Failed { name, .. } => Some(name),
            Self::BackendError { .. } => None,
        }
    }

    /// Build the telemetry report for error-class events
    pub fn to_report(&self) -> Option<FailureReport> {
        let (error, context) = match self {
            Self::Completed { .. } => return None,
            Self::Retrying {
                id,
                name,
                attempt,
                error,
                ..
            } => (
                error.clone(),
                FailureContext {
                    kind: self.kind().to_string(),
                    job_id: Some(id.clone()),
                    job_name: Some(name.clone()),
                    attempt: Some(*attempt),
                    ..Default::default()
                },
            ),
            Self::Failed {
                id,
                name,
                attempt,
                error,
                reason,
            } => (
                error.clone(),
                FailureContext {
                    kind: self.kind().to_string(),
                    job_id: Some(id.clone()),
                    job_name: Some(name.clone()),
                    attempt: Some(*attempt),
                    reason: Some(*reason),
                    ..Default::default()
                },
            ),
            Self::BackendError { operation, error } => (
                error.clone(),
                FailureContext {
                    kind: self.kind().to_string(),
                    operation: Some(operation.clone()),
                    ..Default::default()
                },
            ),
        };
        Some(FailureReport { error, context })
    }
}

/// Structured context attached to a telemetry report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Event kind (`retrying`, `failed`, `error`)
    pub kind: String,
    pub job_id: Option<String>,
    pub job_name: Option<String>,
    pub attempt: Option<u32>,
    pub reason: Option<FailureReason>,
    /// Backend operation, for backend errors
    pub operation: Option<String>,
}

/// One queued telemetry report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub error: String,
    pub context: FailureContext,
}
