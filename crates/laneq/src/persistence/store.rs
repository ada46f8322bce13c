//! QueueBackend trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobInstance;
use crate::lane::Namespace;

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable
    #[error("connection error: {0}")]
    Connection(String),

    /// Database or command error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The lease was reclaimed (expired) or the job is gone
    #[error("lease lost for job {0}")]
    LeaseLost(String),

    /// Backend has been closed
    #[error("backend is closed")]
    Closed,
}

/// Status of a stored job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting (possibly delayed) for a worker
    Pending,
    /// Leased by a worker
    Active,
    /// Terminal failure (only kept when failures are retained)
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A worker's time-bounded claim on one job instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Leased job ID
    pub job_id: String,

    /// Token identifying this particular claim
    pub token: Uuid,

    /// Worker holding the lease
    pub worker_id: String,
}

/// A job instance claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub instance: JobInstance,
    pub lease: Lease,
}

/// Error recorded on jobs failed by the stall check
pub const STALLED_ERROR: &str = "job stalled more than allowable limit";

/// How stalled jobs (expired leases) are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallPolicy {
    /// Number of times a job may stall before it is failed
    pub max_stalled_count: u32,

    /// Keep jobs failed by stalling in the failed set
    pub retain_failed: bool,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            max_stalled_count: 1,
            retain_failed: false,
        }
    }
}

/// Job failed by the stall check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub id: String,
    pub name: String,
    pub attempt: u32,
}

/// Result of a stale lease sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Jobs made visible again
    pub requeued: Vec<String>,

    /// Jobs that stalled too often and were failed
    pub failed: Vec<StalledJob>,
}

impl ReclaimReport {
    /// Check if the sweep changed anything
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Retained terminal failure
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub instance: JobInstance,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Persisted recurring trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    /// Cron (job) name
    pub name: String,

    /// Cron expression
    pub cron: String,

    /// Payload delivered with each firing
    pub payload: serde_json::Value,

    /// Next firing time
    pub next_run_at: DateTime<Utc>,

    /// Last time the record was written
    pub updated_at: DateTime<Utc>,
}

/// Per-lane queue sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Visible and waiting for a worker
    pub waiting: u64,
    /// Pending but not yet visible (delayed or backing off)
    pub delayed: u64,
    /// Leased by a worker
    pub active: u64,
    /// Retained failures
    pub failed: u64,
    /// Recurring schedules
    pub schedules: u64,
}

/// Durable, ordered, at-least-once job store
///
/// Every operation is scoped to a [`Namespace`]; implementations must keep
/// namespaces fully isolated even when they share one physical store.
/// Implementations must be thread-safe and safe to use from several
/// processes at once: claiming is the arbitration point between workers.
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Store a job instance, visible after `delay`
    ///
    /// Returns `false` (and changes nothing) if an instance with the same ID
    /// already exists in the namespace. Once this returns `Ok`, the job must
    /// survive a crash of the calling process.
    async fn enqueue(
        &self,
        ns: &Namespace,
        job: JobInstance,
        delay: Duration,
    ) -> Result<bool, StoreError>;

    /// Lease up to `max_jobs` visible jobs, oldest first
    async fn claim(
        &self,
        ns: &Namespace,
        worker_id: &str,
        max_jobs: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedJob>, StoreError>;

    /// Push the lease expiry `lease_duration` into the future
    ///
    /// Returns `false` if the lease is no longer held.
    async fn extend_lease(
        &self,
        ns: &Namespace,
        lease: &Lease,
        lease_duration: Duration,
    ) -> Result<bool, StoreError>;

    /// Acknowledge success: the job and its data are removed
    async fn complete(&self, ns: &Namespace, lease: &Lease) -> Result<(), StoreError>;

    /// Re-enqueue for another attempt after `delay`
    ///
    /// Returns the next attempt number.
    async fn retry(
        &self,
        ns: &Namespace,
        lease: &Lease,
        delay: Duration,
        error: &str,
    ) -> Result<u32, StoreError>;

    /// Terminal failure: remove the job, or keep it in the failed set
    async fn fail(
        &self,
        ns: &Namespace,
        lease: &Lease,
        error: &str,
        retain: bool,
    ) -> Result<(), StoreError>;

    /// Make jobs with expired leases visible again
    async fn reclaim_expired(
        &self,
        ns: &Namespace,
        policy: StallPolicy,
    ) -> Result<ReclaimReport, StoreError>;

    /// Retained failures, most recent first
    async fn failed_jobs(&self, ns: &Namespace, limit: usize)
        -> Result<Vec<FailedJob>, StoreError>;

    /// Current queue sizes
    async fn counts(&self, ns: &Namespace) -> Result<QueueCounts, StoreError>;

    // =========================================================================
    // Schedule Operations
    // =========================================================================

    /// Insert or update a recurring trigger
    ///
    /// Idempotent: if a record with the same name and cron expression
    /// exists, only its payload is updated and its next firing is kept.
    async fn upsert_schedule(
        &self,
        ns: &Namespace,
        schedule: ScheduleRecord,
    ) -> Result<(), StoreError>;

    /// Remove a recurring trigger
    async fn remove_schedule(&self, ns: &Namespace, name: &str) -> Result<bool, StoreError>;

    /// All recurring triggers
    async fn list_schedules(&self, ns: &Namespace) -> Result<Vec<ScheduleRecord>, StoreError>;

    /// Triggers whose next firing is at or before `now`
    async fn due_schedules(
        &self,
        ns: &Namespace,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleRecord>, StoreError>;

    /// Compare-and-swap the next firing time
    ///
    /// Returns `true` only for the caller that moved `next_run_at` from
    /// `expected` to `next`; that caller owns the firing.
    async fn advance_schedule(
        &self,
        ns: &Namespace,
        name: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Connection (optional, default no-op)
    // =========================================================================

    /// Check connectivity
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Release connections
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stall_policy() {
        let policy = StallPolicy::default();
        assert_eq!(policy.max_stalled_count, 1);
        assert!(!policy.retain_failed);
    }

    #[test]
    fn test_reclaim_report_empty() {
        assert!(ReclaimReport::default().is_empty());
        let report = ReclaimReport {
            requeued: vec!["a".into()],
            failed: vec![],
        };
        assert!(!report.is_empty());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert_eq!(JobStatus::Active.to_string(), "active");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
    }
}
