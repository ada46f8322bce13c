//! In-memory implementation of QueueBackend for testing and local runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use super::store::*;
use crate::job::JobInstance;
use crate::lane::Namespace;

/// Internal lease state
struct LeaseState {
    token: Uuid,
    expires_at: Instant,
}

/// Internal job state
struct JobEntry {
    instance: JobInstance,
    status: JobStatus,
    seq: u64,
    visible_at: Instant,
    lease: Option<LeaseState>,
    stalled_count: u32,
    last_error: Option<String>,
    failed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct LaneState {
    jobs: HashMap<String, JobEntry>,
    schedules: HashMap<String, ScheduleRecord>,
}

/// In-memory implementation of QueueBackend
///
/// Provides the same semantics as the PostgreSQL implementation, with
/// visibility and lease clocks on `tokio::time::Instant` so tests can run
/// under paused time. Data does not survive the process.
///
/// # Example
///
/// ```
/// use laneq::InMemoryQueueBackend;
///
/// let backend = InMemoryQueueBackend::new();
/// ```
pub struct InMemoryQueueBackend {
    lanes: RwLock<HashMap<String, LaneState>>,
    seq: AtomicU64,
    unavailable: AtomicBool,
    failing_enqueues: AtomicU32,
    closed: AtomicBool,
}

impl InMemoryQueueBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            failing_enqueues: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the number of pending (waiting or delayed) jobs in a namespace
    pub fn pending_count(&self, ns: &Namespace) -> usize {
        self.count_status(ns, JobStatus::Pending)
    }

    /// Get the number of leased jobs in a namespace
    pub fn active_count(&self, ns: &Namespace) -> usize {
        self.count_status(ns, JobStatus::Active)
    }

    /// Get the number of retained failures in a namespace
    pub fn failed_count(&self, ns: &Namespace) -> usize {
        self.count_status(ns, JobStatus::Failed)
    }

    /// Get the number of stored jobs in a namespace, any status
    pub fn job_count(&self, ns: &Namespace) -> usize {
        self.lanes
            .read()
            .get(&ns.key())
            .map(|lane| lane.jobs.len())
            .unwrap_or(0)
    }

    /// Stored instance by ID
    pub fn get(&self, ns: &Namespace, id: &str) -> Option<JobInstance> {
        self.lanes
            .read()
            .get(&ns.key())
            .and_then(|lane| lane.jobs.get(id))
            .map(|entry| entry.instance.clone())
    }

    /// Simulate an outage: every operation fails with a connection error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` enqueues with a connection error
    pub fn fail_next_enqueues(&self, count: u32) {
        self.failing_enqueues.store(count, Ordering::SeqCst);
    }

    /// Whether [`QueueBackend::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.lanes.write().clear();
    }

    fn count_status(&self, ns: &Namespace, status: JobStatus) -> usize {
        self.lanes
            .read()
            .get(&ns.key())
            .map(|lane| lane.jobs.values().filter(|j| j.status == status).count())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("backend unavailable".to_string()));
        }
        Ok(())
    }

    /// Run `f` on the leased entry, failing if the lease is no longer held
    fn with_lease<T>(
        &self,
        ns: &Namespace,
        lease: &Lease,
        f: impl FnOnce(&mut LaneState) -> T,
    ) -> Result<T, StoreError> {
        self.check_available()?;
        let mut lanes = self.lanes.write();
        let lane = lanes
            .get_mut(&ns.key())
            .ok_or_else(|| StoreError::LeaseLost(lease.job_id.clone()))?;

        let held = lane
            .jobs
            .get(&lease.job_id)
            .map(|entry| {
                entry.status == JobStatus::Active
                    && entry.lease.as_ref().map(|l| l.token) == Some(lease.token)
            })
            .unwrap_or(false);

        if !held {
            return Err(StoreError::LeaseLost(lease.job_id.clone()));
        }

        Ok(f(lane))
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(
        &self,
        ns: &Namespace,
        job: JobInstance,
        delay: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        if self
            .failing_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Connection("enqueue failed".to_string()));
        }
        let mut lanes = self.lanes.write();
        let lane = lanes.entry(ns.key()).or_default();

        if lane.jobs.contains_key(&job.id) {
            return Ok(false);
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        lane.jobs.insert(
            job.id.clone(),
            JobEntry {
                instance: job,
                status: JobStatus::Pending,
                seq,
                visible_at: Instant::now() + delay,
                lease: None,
                stalled_count: 0,
                last_error: None,
                failed_at: None,
            },
        );
        Ok(true)
    }

    async fn claim(
        &self,
        ns: &Namespace,
        worker_id: &str,
        max_jobs: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        self.check_available()?;
        if max_jobs == 0 {
            return Ok(vec![]);
        }

        let mut lanes = self.lanes.write();
        let Some(lane) = lanes.get_mut(&ns.key()) else {
            return Ok(vec![]);
        };

        let now = Instant::now();
        let mut visible: Vec<(Instant, u64, String)> = lane
            .jobs
            .iter()
            .filter(|(_, j)| j.status == JobStatus::Pending && j.visible_at <= now)
            .map(|(id, j)| (j.visible_at, j.seq, id.clone()))
            .collect();
        visible.sort();

        let mut claimed = Vec::with_capacity(max_jobs.min(visible.len()));
        for (_, _, id) in visible.into_iter().take(max_jobs) {
            if let Some(entry) = lane.jobs.get_mut(&id) {
                let token = Uuid::now_v7();
                entry.status = JobStatus::Active;
                entry.lease = Some(LeaseState {
                    token,
                    expires_at: now + lease_duration,
                });

                claimed.push(ClaimedJob {
                    instance: entry.instance.clone(),
                    lease: Lease {
                        job_id: id,
                        token,
                        worker_id: worker_id.to_string(),
                    },
                });
            }
        }

        Ok(claimed)
    }

    async fn extend_lease(
        &self,
        ns: &Namespace,
        lease: &Lease,
        lease_duration: Duration,
    ) -> Result<bool, StoreError> {
        match self.with_lease(ns, lease, |lane| {
            if let Some(state) = lane
                .jobs
                .get_mut(&lease.job_id)
                .and_then(|e| e.lease.as_mut())
            {
                state.expires_at = Instant::now() + lease_duration;
            }
        }) {
            Ok(()) => Ok(true),
            Err(StoreError::LeaseLost(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn complete(&self, ns: &Namespace, lease: &Lease) -> Result<(), StoreError> {
        self.with_lease(ns, lease, |lane| {
            lane.jobs.remove(&lease.job_id);
        })
    }

    async fn retry(
        &self,
        ns: &Namespace,
        lease: &Lease,
        delay: Duration,
        error: &str,
    ) -> Result<u32, StoreError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.with_lease(ns, lease, |lane| {
            let mut next_attempt = 0;
            if let Some(entry) = lane.jobs.get_mut(&lease.job_id) {
                entry.instance.attempt += 1;
                entry.status = JobStatus::Pending;
                entry.lease = None;
                entry.seq = seq;
                entry.visible_at = Instant::now() + delay;
                entry.last_error = Some(error.to_string());
                next_attempt = entry.instance.attempt;
            }
            next_attempt
        })
    }

    async fn fail(
        &self,
        ns: &Namespace,
        lease: &Lease,
        error: &str,
        retain: bool,
    ) -> Result<(), StoreError> {
        self.with_lease(ns, lease, |lane| {
            if retain {
                if let Some(entry) = lane.jobs.get_mut(&lease.job_id) {
                    entry.status = JobStatus::Failed;
                    entry.lease = None;
                    entry.last_error = Some(error.to_string());
                    entry.failed_at = Some(Utc::now());
                }
            } else {
                lane.jobs.remove(&lease.job_id);
            }
        })
    }

    async fn reclaim_expired(
        &self,
        ns: &Namespace,
        policy: StallPolicy,
    ) -> Result<ReclaimReport, StoreError> {
        self.check_available()?;
        let mut lanes = self.lanes.write();
        let Some(lane) = lanes.get_mut(&ns.key()) else {
            return Ok(ReclaimReport::default());
        };

        let now = Instant::now();
        let expired: Vec<String> = lane
            .jobs
            .iter()
            .filter(|(_, j)| {
                j.status == JobStatus::Active
                    && j.lease.as_ref().map(|l| l.expires_at <= now).unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut report = ReclaimReport::default();
        for id in expired {
            let Some(entry) = lane.jobs.get_mut(&id) else {
                continue;
            };
            entry.stalled_count += 1;
            entry.lease = None;

            if entry.stalled_count > policy.max_stalled_count {
                report.failed.push(StalledJob {
                    id: id.clone(),
                    name: entry.instance.name.clone(),
                    attempt: entry.instance.attempt,
                });
                if policy.retain_failed {
                    entry.status = JobStatus::Failed;
                    entry.last_error = Some(STALLED_ERROR.to_string());
                    entry.failed_at = Some(Utc::now());
                } else {
                    lane.jobs.remove(&id);
                }
            } else {
                entry.status = JobStatus::Pending;
                entry.visible_at = now;
                report.requeued.push(id);
            }
        }

        Ok(report)
    }

    async fn failed_jobs(
        &self,
        ns: &Namespace,
        limit: usize,
    ) -> Result<Vec<FailedJob>, StoreError> {
        self.check_available()?;
        let lanes = self.lanes.read();
        let Some(lane) = lanes.get(&ns.key()) else {
            return Ok(vec![]);
        };

        let mut failed: Vec<FailedJob> = lane
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| FailedJob {
                instance: j.instance.clone(),
                error: j.last_error.clone().unwrap_or_default(),
                failed_at: j.failed_at.unwrap_or_else(Utc::now),
            })
            .collect();

        failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn counts(&self, ns: &Namespace) -> Result<QueueCounts, StoreError> {
        self.check_available()?;
        let lanes = self.lanes.read();
        let Some(lane) = lanes.get(&ns.key()) else {
            return Ok(QueueCounts::default());
        };

        let now = Instant::now();
        let mut counts = QueueCounts {
            schedules: lane.schedules.len() as u64,
            ..Default::default()
        };
        for job in lane.jobs.values() {
            match job.status {
                JobStatus::Pending if job.visible_at <= now => counts.waiting += 1,
                JobStatus::Pending => counts.delayed += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn upsert_schedule(
        &self,
        ns: &Namespace,
        schedule: ScheduleRecord,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut lanes = self.lanes.write();
        let lane = lanes.entry(ns.key()).or_default();

        match lane.schedules.get_mut(&schedule.name) {
            Some(existing) if existing.cron == schedule.cron => {
                existing.payload = schedule.payload;
                existing.updated_at = schedule.updated_at;
            }
            _ => {
                lane.schedules.insert(schedule.name.clone(), schedule);
            }
        }
        Ok(())
    }

    async fn remove_schedule(&self, ns: &Namespace, name: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .lanes
            .write()
            .get_mut(&ns.key())
            .and_then(|lane| lane.schedules.remove(name))
            .is_some())
    }

    async fn list_schedules(&self, ns: &Namespace) -> Result<Vec<ScheduleRecord>, StoreError> {
        self.check_available()?;
        let mut schedules: Vec<ScheduleRecord> = self
            .lanes
            .read()
            .get(&ns.key())
            .map(|lane| lane.schedules.values().cloned().collect())
            .unwrap_or_default();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn due_schedules(
        &self,
        ns: &Namespace,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        self.check_available()?;
        let mut due: Vec<ScheduleRecord> = self
            .lanes
            .read()
            .get(&ns.key())
            .map(|lane| {
                lane.schedules
                    .values()
                    .filter(|s| s.next_run_at <= now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn advance_schedule(
        &self,
        ns: &Namespace,
        name: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut lanes = self.lanes.write();
        let Some(schedule) = lanes
            .get_mut(&ns.key())
            .and_then(|lane| lane.schedules.get_mut(name))
        else {
            return Ok(false);
        };

        if schedule.next_run_at != expected {
            return Ok(false);
        }
        schedule.next_run_at = next;
        schedule.updated_at = Utc::now();
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::Lane;
    use crate::reliability::RetryPolicy;

    fn ns(lane: &str) -> Namespace {
        Namespace::for_stack("test", Lane::new(lane).unwrap())
    }

    fn job(name: &str) -> JobInstance {
        JobInstance::new(
            name,
            serde_json::json!({"k": name}),
            &RetryPolicy::default(),
            Lane::new("a").unwrap(),
        )
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_job_lifecycle() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");

        let instance = job("ping");
        let id = instance.id.clone();
        assert!(backend.enqueue(&ns, instance, Duration::ZERO).await.unwrap());
        assert_eq!(backend.pending_count(&ns), 1);

        let claimed = backend.claim(&ns, "w1", 10, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].instance.id, id);
        assert_eq!(backend.active_count(&ns), 1);

        // Leased jobs are invisible
        assert!(backend.claim(&ns, "w2", 10, LEASE).await.unwrap().is_empty());

        backend.complete(&ns, &claimed[0].lease).await.unwrap();
        assert_eq!(backend.job_count(&ns), 0);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_id() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");

        let instance = job("ping").with_id("fixed");
        assert!(backend.enqueue(&ns, instance.clone(), Duration::ZERO).await.unwrap());
        assert!(!backend.enqueue(&ns, instance, Duration::ZERO).await.unwrap());
        assert_eq!(backend.job_count(&ns), 1);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_bounded() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");

        let mut ids = vec![];
        for i in 0..5 {
            let instance = job(&format!("j{i}"));
            ids.push(instance.id.clone());
            backend.enqueue(&ns, instance, Duration::ZERO).await.unwrap();
        }

        let first = backend.claim(&ns, "w1", 2, LEASE).await.unwrap();
        let second = backend.claim(&ns, "w1", 10, LEASE).await.unwrap();

        let order: Vec<String> = first
            .iter()
            .chain(second.iter())
            .map(|c| c.instance.id.clone())
            .collect();
        assert_eq!(first.len(), 2);
        assert_eq!(order, ids);
    }

    #[tokio::test]
    async fn test_lanes_are_isolated() {
        let backend = InMemoryQueueBackend::new();
        let a = ns("a");
        let b = ns("b");

        for i in 0..10 {
            backend
                .enqueue(&a, job(&format!("j{i}")), Duration::ZERO)
                .await
                .unwrap();
        }

        assert!(backend.claim(&b, "w", 100, LEASE).await.unwrap().is_empty());
        assert_eq!(backend.counts(&b).await.unwrap(), QueueCounts::default());
        assert_eq!(backend.counts(&a).await.unwrap().waiting, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_visibility() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");

        backend
            .enqueue(&ns, job("later"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(backend.claim(&ns, "w", 1, LEASE).await.unwrap().is_empty());
        assert_eq!(backend.counts(&ns).await.unwrap().delayed, 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(backend.claim(&ns, "w", 1, LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_increments_attempt_and_delays() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        backend.enqueue(&ns, job("flaky"), Duration::ZERO).await.unwrap();

        let claimed = backend.claim(&ns, "w", 1, LEASE).await.unwrap();
        let next = backend
            .retry(&ns, &claimed[0].lease, Duration::from_secs(1), "boom")
            .await
            .unwrap();
        assert_eq!(next, 2);

        assert!(backend.claim(&ns, "w", 1, LEASE).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;

        let claimed = backend.claim(&ns, "w", 1, LEASE).await.unwrap();
        assert_eq!(claimed[0].instance.attempt, 2);
    }

    #[tokio::test]
    async fn test_fail_removes_or_retains() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        backend.enqueue(&ns, job("x"), Duration::ZERO).await.unwrap();
        backend.enqueue(&ns, job("y"), Duration::ZERO).await.unwrap();

        let claimed = backend.claim(&ns, "w", 2, LEASE).await.unwrap();
        backend.fail(&ns, &claimed[0].lease, "bad", false).await.unwrap();
        backend.fail(&ns, &claimed[1].lease, "worse", true).await.unwrap();

        assert_eq!(backend.job_count(&ns), 1);
        let failed = backend.failed_jobs(&ns, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, "worse");
        assert!(backend.claim(&ns, "w", 10, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reclaimed() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        backend.enqueue(&ns, job("x"), Duration::ZERO).await.unwrap();

        let claimed = backend
            .claim(&ns, "dead-worker", 1, Duration::from_secs(5))
            .await
            .unwrap();

        // Not expired yet
        let report = backend.reclaim_expired(&ns, StallPolicy::default()).await.unwrap();
        assert!(report.is_empty());

        tokio::time::advance(Duration::from_secs(5)).await;
        let report = backend.reclaim_expired(&ns, StallPolicy::default()).await.unwrap();
        assert_eq!(report.requeued, vec![claimed[0].lease.job_id.clone()]);

        // The stale worker can no longer acknowledge
        assert!(matches!(
            backend.complete(&ns, &claimed[0].lease).await,
            Err(StoreError::LeaseLost(_))
        ));

        let again = backend.claim(&ns, "w2", 1, LEASE).await.unwrap();
        assert_eq!(again.len(), 1);
        backend.complete(&ns, &again[0].lease).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_stall_fails_job() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        backend.enqueue(&ns, job("crasher"), Duration::ZERO).await.unwrap();

        backend.claim(&ns, "w", 1, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = backend.reclaim_expired(&ns, StallPolicy::default()).await.unwrap();
        assert_eq!(report.requeued.len(), 1);
        assert!(report.failed.is_empty());

        backend.claim(&ns, "w", 1, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = backend.reclaim_expired(&ns, StallPolicy::default()).await.unwrap();
        assert!(report.requeued.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].name, "crasher");
        assert_eq!(backend.job_count(&ns), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_stall_retains_when_asked() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        let policy = StallPolicy {
            max_stalled_count: 0,
            retain_failed: true,
        };
        backend.enqueue(&ns, job("crasher"), Duration::ZERO).await.unwrap();

        backend.claim(&ns, "w", 1, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = backend.reclaim_expired(&ns, policy).await.unwrap();
        assert_eq!(report.failed.len(), 1);

        let failed = backend.failed_jobs(&ns, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, STALLED_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_lease() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        backend.enqueue(&ns, job("long"), Duration::ZERO).await.unwrap();

        let claimed = backend.claim(&ns, "w", 1, Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(backend
            .extend_lease(&ns, &claimed[0].lease, Duration::from_secs(5))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        let report = backend.reclaim_expired(&ns, StallPolicy::default()).await.unwrap();
        assert!(report.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        backend.reclaim_expired(&ns, StallPolicy::default()).await.unwrap();
        assert!(!backend
            .extend_lease(&ns, &claimed[0].lease, Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_schedule_upsert_is_idempotent() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        let first_run = Utc::now() + chrono::Duration::minutes(5);

        let record = ScheduleRecord {
            name: "nightly".into(),
            cron: "0 3 * * *".into(),
            payload: serde_json::Value::Null,
            next_run_at: first_run,
            updated_at: Utc::now(),
        };
        backend.upsert_schedule(&ns, record.clone()).await.unwrap();

        // Same cron: next run kept
        let mut again = record.clone();
        again.next_run_at = first_run + chrono::Duration::hours(1);
        again.payload = serde_json::json!({"v": 2});
        backend.upsert_schedule(&ns, again).await.unwrap();

        let schedules = backend.list_schedules(&ns).await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].next_run_at, first_run);
        assert_eq!(schedules[0].payload, serde_json::json!({"v": 2}));

        // Changed cron: replaced
        let mut changed = record;
        changed.cron = "0 4 * * *".into();
        changed.next_run_at = first_run + chrono::Duration::hours(2);
        backend.upsert_schedule(&ns, changed.clone()).await.unwrap();
        assert_eq!(
            backend.list_schedules(&ns).await.unwrap()[0].next_run_at,
            changed.next_run_at
        );
    }

    #[tokio::test]
    async fn test_advance_schedule_is_compare_and_swap() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        let due_at = Utc::now() - chrono::Duration::seconds(1);
        let next = due_at + chrono::Duration::minutes(1);

        backend
            .upsert_schedule(
                &ns,
                ScheduleRecord {
                    name: "tick".into(),
                    cron: "* * * * *".into(),
                    payload: serde_json::Value::Null,
                    next_run_at: due_at,
                    updated_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        assert_eq!(backend.due_schedules(&ns, Utc::now(), 10).await.unwrap().len(), 1);
        assert!(backend.advance_schedule(&ns, "tick", due_at, next).await.unwrap());
        assert!(!backend.advance_schedule(&ns, "tick", due_at, next).await.unwrap());
        assert!(backend.due_schedules(&ns, Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_next_enqueues() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");
        backend.fail_next_enqueues(1);

        assert!(matches!(
            backend.enqueue(&ns, job("x"), Duration::ZERO).await,
            Err(StoreError::Connection(_))
        ));
        assert!(backend.enqueue(&ns, job("x"), Duration::ZERO).await.unwrap());
        assert_eq!(backend.pending_count(&ns), 1);
    }

    #[tokio::test]
    async fn test_unavailable_and_closed() {
        let backend = InMemoryQueueBackend::new();
        let ns = ns("a");

        backend.set_unavailable(true);
        assert!(matches!(
            backend.claim(&ns, "w", 1, LEASE).await,
            Err(StoreError::Connection(_))
        ));
        assert!(backend.ping().await.is_err());

        backend.set_unavailable(false);
        assert!(backend.ping().await.is_ok());

        backend.close().await;
        assert!(backend.is_closed());
        assert!(matches!(backend.ping().await, Err(StoreError::Closed)));
    }
}
