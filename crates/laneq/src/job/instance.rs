//! Job instances and enqueue options

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lane::Lane;
use crate::reliability::{Backoff, RetryPolicy};
use crate::util::option_duration_millis;

/// One enqueued unit of work
///
/// Owned by the queue backend from enqueue until it completes or fails for
/// good. `attempt` is the number of the delivery about to happen (or
/// happening), starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInstance {
    /// Opaque unique ID
    pub id: String,

    /// Registered job name
    pub name: String,

    /// Arbitrary JSON payload
    pub payload: serde_json::Value,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Delay function between attempts
    pub backoff: Backoff,

    /// When the instance was created
    pub enqueued_at: DateTime<Utc>,

    /// Lane the instance belongs to
    pub lane: Lane,
}

impl JobInstance {
    /// Create a first-attempt instance with a fresh ID
    pub fn new(
        name: impl Into<String>,
        payload: serde_json::Value,
        policy: &RetryPolicy,
        lane: Lane,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            name: name.into(),
            payload,
            attempt: 1,
            max_attempts: policy.attempts.max(1),
            backoff: policy.backoff.clone(),
            enqueued_at: Utc::now(),
            lane,
        }
    }

    /// Replace the generated ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Check if another attempt is allowed after the current one
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Delay before the next attempt
    pub fn next_retry_delay(&self) -> Duration {
        self.backoff.delay_for_attempt(self.attempt.saturating_add(1))
    }
}

/// Per-enqueue overrides of a job's default policy
///
/// # Example
///
/// ```
/// use laneq::{Backoff, JobOptions};
/// use std::time::Duration;
///
/// let options = JobOptions::new()
///     .with_attempts(5)
///     .with_backoff(Backoff::fixed(Duration::from_secs(2)))
///     .with_delay(Duration::from_secs(30))
///     .with_job_id("thumbnail:42");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    /// Maximum attempts (overrides the definition's default)
    pub attempts: Option<u32>,

    /// Backoff (overrides the definition's default)
    pub backoff: Option<Backoff>,

    /// Delay before the first delivery
    #[serde(default, with = "option_duration_millis")]
    pub delay: Option<Duration>,

    /// Caller-provided ID; enqueueing an ID that already exists is a no-op
    pub job_id: Option<String>,
}

impl JobOptions {
    /// Empty options (use the definition's defaults)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum attempts
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Set the backoff
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Delay the first delivery
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Use a caller-provided ID
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Merge these options over a default policy
    pub fn merge_over(&self, defaults: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.unwrap_or(defaults.attempts).max(1),
            backoff: self
                .backoff
                .clone()
                .unwrap_or_else(|| defaults.backoff.clone()),
        }
    }
}

/// Receipt for an enqueued job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Job instance ID
    pub id: String,

    /// Job name
    pub name: String,

    /// Lane the job was written to
    pub lane: Lane,

    /// False when an instance with the same ID already existed
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane() -> Lane {
        Lane::new("test").unwrap()
    }

    #[test]
    fn test_new_instance() {
        let instance = JobInstance::new(
            "image:thumbnail",
            serde_json::json!({"image_id": 7}),
            &RetryPolicy::default(),
            lane(),
        );

        assert_eq!(instance.attempt, 1);
        assert_eq!(instance.max_attempts, 3);
        assert!(instance.has_attempts_remaining());
        assert_eq!(instance.next_retry_delay(), Duration::from_millis(1000));
        assert!(Uuid::parse_str(&instance.id).is_ok());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = JobInstance::new("a", serde_json::Value::Null, &RetryPolicy::default(), lane());
        let b = JobInstance::new("a", serde_json::Value::Null, &RetryPolicy::default(), lane());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_merge_defaults() {
        let defaults = RetryPolicy::default();
        assert_eq!(JobOptions::new().merge_over(&defaults), defaults);
    }

    #[test]
    fn test_merge_overrides() {
        let defaults = RetryPolicy::default();
        let merged = JobOptions::new()
            .with_attempts(7)
            .with_backoff(Backoff::fixed(Duration::from_secs(3)))
            .merge_over(&defaults);

        assert_eq!(merged.attempts, 7);
        assert_eq!(merged.backoff, Backoff::fixed(Duration::from_secs(3)));
    }

    #[test]
    fn test_merge_rejects_zero_attempts() {
        let merged = JobOptions::new()
            .with_attempts(0)
            .merge_over(&RetryPolicy::default());
        assert_eq!(merged.attempts, 1);
    }

    #[test]
    fn test_instance_wire_format() {
        let instance = JobInstance::new(
            "ping",
            serde_json::json!({"n": 1}),
            &RetryPolicy::default(),
            lane(),
        );
        let json = serde_json::to_value(&instance).unwrap();

        assert_eq!(json["name"], "ping");
        assert_eq!(json["lane"], "test");
        assert_eq!(json["backoff"]["type"], "exponential");
        assert_eq!(json["backoff"]["delay"], 1000);
    }
}
