//! PostgreSQL implementation of QueueBackend
//!
//! Production persistence using PostgreSQL with:
//! - Claiming with `FOR UPDATE SKIP LOCKED`, so many workers can poll one queue
//! - Leases and visibility timed by the database clock
//! - One logical queue per namespace key, sharing two tables

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument, warn};

use super::store::*;
use crate::job::JobInstance;
use crate::lane::{Lane, Namespace};
use crate::reliability::Backoff;

/// PostgreSQL implementation of QueueBackend
///
/// Uses a connection pool; cloning is cheap.
///
/// # Example
///
/// ```ignore
/// use laneq::PostgresQueueBackend;
///
/// let backend = PostgresQueueBackend::connect("postgres://localhost/jobs").await?;
/// backend.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresQueueBackend {
    pool: PgPool,
}

impl PostgresQueueBackend {
    /// Create a new backend with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_sqlx(operation: &str, e: sqlx::Error) -> StoreError {
    error!(operation, error = %e, "queue backend query failed");
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Connection(e.to_string()),
        other => StoreError::Database(other.to_string()),
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn row_to_instance(row: &PgRow) -> Result<JobInstance, StoreError> {
    let backoff: serde_json::Value = row.get("backoff");
    let backoff: Backoff =
        serde_json::from_value(backoff).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let lane: String = row.get("lane");
    let lane = Lane::new(lane).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(JobInstance {
        id: row.get("id"),
        name: row.get("name"),
        payload: row.get("payload"),
        attempt: row.get::<i32, _>("attempt") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        backoff,
        enqueued_at: row.get("enqueued_at"),
        lane,
    })
}

fn row_to_schedule(row: &PgRow) -> ScheduleRecord {
    ScheduleRecord {
        name: row.get("name"),
        cron: row.get("cron"),
        payload: row.get("payload"),
        next_run_at: row.get("next_run_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl QueueBackend for PostgresQueueBackend {
    #[instrument(skip(self, job), fields(queue = %ns, job_id = %job.id, job_name = %job.name))]
    async fn enqueue(
        &self,
        ns: &Namespace,
        job: JobInstance,
        delay: Duration,
    ) -> Result<bool, StoreError> {
        let backoff = serde_json::to_value(&job.backoff)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO laneq_jobs (
                queue, id, name, payload, attempt, max_attempts, backoff, lane,
                status, visible_at, enqueued_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending',
                    NOW() + ($9::bigint * INTERVAL '1 millisecond'), $10)
            ON CONFLICT (queue, id) DO NOTHING
            "#,
        )
        .bind(ns.key())
        .bind(&job.id)
        .bind(&job.name)
        .bind(&job.payload)
        .bind(job.attempt as i32)
        .bind(job.max_attempts as i32)
        .bind(&backoff)
        .bind(job.lane.as_str())
        .bind(millis(delay))
        .bind(job.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("enqueue", e))?;

        let created = result.rows_affected() == 1;
        debug!(created, "enqueued job");
        Ok(created)
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn claim(
        &self,
        ns: &Namespace,
        worker_id: &str,
        max_jobs: usize,
        lease_duration: Duration,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        if max_jobs == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT queue, id
                FROM laneq_jobs
                WHERE queue = $1
                  AND status = 'pending'
                  AND visible_at <= NOW()
                ORDER BY visible_at, seq
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE laneq_jobs j
            SET status = 'active',
                lease_token = gen_random_uuid(),
                leased_by = $3,
                lease_expires_at = NOW() + ($4::bigint * INTERVAL '1 millisecond')
            FROM claimable c
            WHERE j.queue = c.queue AND j.id = c.id
            RETURNING j.id, j.name, j.payload, j.attempt, j.max_attempts, j.backoff,
                      j.lane, j.enqueued_at, j.lease_token, j.visible_at, j.seq
            "#,
        )
        .bind(ns.key())
        .bind(max_jobs as i64)
        .bind(worker_id)
        .bind(millis(lease_duration))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("claim", e))?;

        // RETURNING does not preserve the CTE ordering
        let mut ordered: Vec<(DateTime<Utc>, i64, ClaimedJob)> = Vec::with_capacity(rows.len());
        for row in rows {
            let instance = row_to_instance(&row)?;
            let lease = Lease {
                job_id: instance.id.clone(),
                token: row.get("lease_token"),
                worker_id: worker_id.to_string(),
            };
            ordered.push((
                row.get("visible_at"),
                row.get("seq"),
                ClaimedJob { instance, lease },
            ));
        }
        ordered.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        let claimed: Vec<ClaimedJob> = ordered.into_iter().map(|(_, _, c)| c).collect();

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, lease), fields(queue = %ns, job_id = %lease.job_id))]
    async fn extend_lease(
        &self,
        ns: &Namespace,
        lease: &Lease,
        lease_duration: Duration,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE laneq_jobs
            SET lease_expires_at = NOW() + ($4::bigint * INTERVAL '1 millisecond')
            WHERE queue = $1 AND id = $2 AND lease_token = $3 AND status = 'active'
            "#,
        )
        .bind(ns.key())
        .bind(&lease.job_id)
        .bind(lease.token)
        .bind(millis(lease_duration))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("extend_lease", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, lease), fields(queue = %ns, job_id = %lease.job_id))]
    async fn complete(&self, ns: &Namespace, lease: &Lease) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM laneq_jobs
            WHERE queue = $1 AND id = $2 AND lease_token = $3 AND status = 'active'
            "#,
        )
        .bind(ns.key())
        .bind(&lease.job_id)
        .bind(lease.token)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(lease.job_id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, lease, error), fields(queue = %ns, job_id = %lease.job_id))]
    async fn retry(
        &self,
        ns: &Namespace,
        lease: &Lease,
        delay: Duration,
        error: &str,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE laneq_jobs
            SET status = 'pending',
                attempt = attempt + 1,
                visible_at = NOW() + ($4::bigint * INTERVAL '1 millisecond'),
                lease_token = NULL,
                leased_by = NULL,
                lease_expires_at = NULL,
                last_error = $5
            WHERE queue = $1 AND id = $2 AND lease_token = $3 AND status = 'active'
            RETURNING attempt
            "#,
        )
        .bind(ns.key())
        .bind(&lease.job_id)
        .bind(lease.token)
        .bind(millis(delay))
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("retry", e))?
        .ok_or_else(|| StoreError::LeaseLost(lease.job_id.clone()))?;

        Ok(row.get::<i32, _>("attempt") as u32)
    }

    #[instrument(skip(self, lease, error), fields(queue = %ns, job_id = %lease.job_id))]
    async fn fail(
        &self,
        ns: &Namespace,
        lease: &Lease,
        error: &str,
        retain: bool,
    ) -> Result<(), StoreError> {
        let query = if retain {
            sqlx::query(
                r#"
                UPDATE laneq_jobs
                SET status = 'failed',
                    lease_token = NULL,
                    leased_by = NULL,
                    lease_expires_at = NULL,
                    last_error = $4,
                    failed_at = NOW()
                WHERE queue = $1 AND id = $2 AND lease_token = $3 AND status = 'active'
                "#,
            )
            .bind(ns.key())
            .bind(&lease.job_id)
            .bind(lease.token)
            .bind(error)
        } else {
            sqlx::query(
                r#"
                DELETE FROM laneq_jobs
                WHERE queue = $1 AND id = $2 AND lease_token = $3 AND status = 'active'
                "#,
            )
            .bind(ns.key())
            .bind(&lease.job_id)
            .bind(lease.token)
        };

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("fail", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(lease.job_id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn reclaim_expired(
        &self,
        ns: &Namespace,
        policy: StallPolicy,
    ) -> Result<ReclaimReport, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("reclaim_expired", e))?;

        let rows = sqlx::query(
            r#"
            UPDATE laneq_jobs
            SET stalled_count = stalled_count + 1,
                status = CASE WHEN stalled_count + 1 > $2 THEN 'failed' ELSE 'pending' END,
                visible_at = NOW(),
                lease_token = NULL,
                leased_by = NULL,
                lease_expires_at = NULL,
                last_error = CASE WHEN stalled_count + 1 > $2 THEN $3 ELSE last_error END,
                failed_at = CASE WHEN stalled_count + 1 > $2 THEN NOW() ELSE failed_at END
            WHERE queue = $1
              AND status = 'active'
              AND lease_expires_at <= NOW()
            RETURNING id, name, attempt, status
            "#,
        )
        .bind(ns.key())
        .bind(policy.max_stalled_count as i32)
        .bind(STALLED_ERROR)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx("reclaim_expired", e))?;

        let mut report = ReclaimReport::default();
        for row in rows {
            let status: String = row.get("status");
            let id: String = row.get("id");
            if status == "failed" {
                report.failed.push(StalledJob {
                    id,
                    name: row.get("name"),
                    attempt: row.get::<i32, _>("attempt") as u32,
                });
            } else {
                report.requeued.push(id);
            }
        }

        if !policy.retain_failed && !report.failed.is_empty() {
            let ids: Vec<String> = report.failed.iter().map(|j| j.id.clone()).collect();
            sqlx::query(
                r#"
                DELETE FROM laneq_jobs
                WHERE queue = $1 AND id = ANY($2) AND status = 'failed'
                "#,
            )
            .bind(ns.key())
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("reclaim_expired", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx("reclaim_expired", e))?;

        if !report.is_empty() {
            warn!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "reclaimed expired leases"
            );
        }
        Ok(report)
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn failed_jobs(
        &self,
        ns: &Namespace,
        limit: usize,
    ) -> Result<Vec<FailedJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, payload, attempt, max_attempts, backoff, lane, enqueued_at,
                   last_error, failed_at
            FROM laneq_jobs
            WHERE queue = $1 AND status = 'failed'
            ORDER BY failed_at DESC
            LIMIT $2
            "#,
        )
        .bind(ns.key())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("failed_jobs", e))?;

        rows.iter()
            .map(|row| {
                Ok(FailedJob {
                    instance: row_to_instance(row)?,
                    error: row
                        .get::<Option<String>, _>("last_error")
                        .unwrap_or_default(),
                    failed_at: row
                        .get::<Option<DateTime<Utc>>, _>("failed_at")
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn counts(&self, ns: &Namespace) -> Result<QueueCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending' AND visible_at <= NOW()) AS waiting,
                COUNT(*) FILTER (WHERE status = 'pending' AND visible_at > NOW()) AS delayed,
                COUNT(*) FILTER (WHERE status = 'active') AS active,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                (SELECT COUNT(*) FROM laneq_schedules WHERE queue = $1) AS schedules
            FROM laneq_jobs
            WHERE queue = $1
            "#,
        )
        .bind(ns.key())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("counts", e))?;

        Ok(QueueCounts {
            waiting: row.get::<i64, _>("waiting") as u64,
            delayed: row.get::<i64, _>("delayed") as u64,
            active: row.get::<i64, _>("active") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            schedules: row.get::<i64, _>("schedules") as u64,
        })
    }

    #[instrument(skip(self, schedule), fields(queue = %ns, schedule = %schedule.name))]
    async fn upsert_schedule(
        &self,
        ns: &Namespace,
        schedule: ScheduleRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO laneq_schedules (queue, name, cron, payload, next_run_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (queue, name) DO UPDATE
            SET payload = EXCLUDED.payload,
                updated_at = EXCLUDED.updated_at,
                next_run_at = CASE
                    WHEN laneq_schedules.cron = EXCLUDED.cron THEN laneq_schedules.next_run_at
                    ELSE EXCLUDED.next_run_at
                END,
                cron = EXCLUDED.cron
            "#,
        )
        .bind(ns.key())
        .bind(&schedule.name)
        .bind(&schedule.cron)
        .bind(&schedule.payload)
        .bind(schedule.next_run_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("upsert_schedule", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn remove_schedule(&self, ns: &Namespace, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM laneq_schedules WHERE queue = $1 AND name = $2")
            .bind(ns.key())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("remove_schedule", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn list_schedules(&self, ns: &Namespace) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, cron, payload, next_run_at, updated_at
            FROM laneq_schedules
            WHERE queue = $1
            ORDER BY name
            "#,
        )
        .bind(ns.key())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("list_schedules", e))?;

        Ok(rows.iter().map(row_to_schedule).collect())
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn due_schedules(
        &self,
        ns: &Namespace,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, cron, payload, next_run_at, updated_at
            FROM laneq_schedules
            WHERE queue = $1 AND next_run_at <= $2
            ORDER BY next_run_at
            LIMIT $3
            "#,
        )
        .bind(ns.key())
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("due_schedules", e))?;

        Ok(rows.iter().map(row_to_schedule).collect())
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn advance_schedule(
        &self,
        ns: &Namespace,
        name: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE laneq_schedules
            SET next_run_at = $4, updated_at = NOW()
            WHERE queue = $1 AND name = $2 AND next_run_at = $3
            "#,
        )
        .bind(ns.key())
        .bind(name)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("advance_schedule", e))?;

        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
