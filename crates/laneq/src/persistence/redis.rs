//! Redis implementation of QueueBackend
//!
//! Key layout under a namespace `{prefix}:{lane}`:
//!
//! - `…:job:{id}` hash with the serialized instance, attempt, stall count and lease token
//! - `…:pending` sorted set scored by visibility time (ms)
//! - `…:active` sorted set scored by lease expiry (ms)
//! - `…:failed` sorted set of retained failures scored by failure time
//! - `…:schedule:{name}` hash and `…:schedules` sorted set scored by next firing
//!
//! Every state transition runs as a Lua script so it is atomic, and all
//! scripts read the clock with `TIME` so workers on different hosts agree.
//! The default prefix carries a `{mq}` hash tag, which keeps a whole queue
//! in one cluster slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::job::JobInstance;
use crate::lane::Namespace;

const NOW_MS: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
"#;

const ENQUEUE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'attempt', ARGV[4], 'stalled', 0)
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const CLAIM: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, tonumber(ARGV[2]))
local out = {}
for i, id in ipairs(ids) do
  local key = ARGV[1] .. id
  redis.call('ZREM', KEYS[1], id)
  local fields = redis.call('HMGET', key, 'data', 'attempt')
  if fields[1] then
    local token = ARGV[4 + i]
    redis.call('HSET', key, 'token', token, 'worker', ARGV[4])
    redis.call('ZADD', KEYS[2], now + tonumber(ARGV[3]), id)
    table.insert(out, id)
    table.insert(out, fields[1])
    table.insert(out, fields[2])
    table.insert(out, token)
  end
end
return out
"#;

const HOLDS_LEASE: &str = r#"
local function holds_lease()
  return redis.call('HGET', KEYS[1], 'token') == ARGV[2]
    and redis.call('ZSCORE', KEYS[2], ARGV[1])
end
"#;

const EXTEND: &str = r#"
if not holds_lease() then return 0 end
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[3]), ARGV[1])
return 1
"#;

const COMPLETE: &str = r#"
if not holds_lease() then return 0 end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('DEL', KEYS[1])
return 1
"#;

const RETRY: &str = r#"
if not holds_lease() then return 0 end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[1], 'token', 'worker')
redis.call('HSET', KEYS[1], 'error', ARGV[4])
local attempt = redis.call('HINCRBY', KEYS[1], 'attempt', 1)
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), ARGV[1])
return attempt
"#;

const FAIL: &str = r#"
if not holds_lease() then return 0 end
redis.call('ZREM', KEYS[2], ARGV[1])
if ARGV[4] == '1' then
  redis.call('HDEL', KEYS[1], 'token', 'worker')
  redis.call('HSET', KEYS[1], 'error', ARGV[3], 'failed_at', now)
  redis.call('ZADD', KEYS[3], now, ARGV[1])
else
  redis.call('DEL', KEYS[1])
end
return 1
"#;

const RECLAIM: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
local out = {}
for _, id in ipairs(ids) do
  local key = ARGV[1] .. id
  redis.call('ZREM', KEYS[2], id)
  if redis.call('EXISTS', key) == 1 then
    redis.call('HDEL', key, 'token', 'worker')
    local stalled = redis.call('HINCRBY', key, 'stalled', 1)
    if stalled > tonumber(ARGV[2]) then
      local fields = redis.call('HMGET', key, 'data', 'attempt')
      table.insert(out, 'failed')
      table.insert(out, id)
      table.insert(out, fields[1] or '')
      table.insert(out, fields[2] or '0')
      if ARGV[3] == '1' then
        redis.call('HSET', key, 'error', ARGV[4], 'failed_at', now)
        redis.call('ZADD', KEYS[3], now, id)
      else
        redis.call('DEL', key)
      end
    else
      redis.call('ZADD', KEYS[1], now, id)
      table.insert(out, 'requeued')
      table.insert(out, id)
      table.insert(out, '')
      table.insert(out, '0')
    end
  end
end
return out
"#;

const COUNTS: &str = r#"
local waiting = redis.call('ZCOUNT', KEYS[1], '-inf', now)
local pending = redis.call('ZCARD', KEYS[1])
return {waiting, pending - waiting, redis.call('ZCARD', KEYS[2]),
        redis.call('ZCARD', KEYS[3]), redis.call('ZCARD', KEYS[4])}
"#;

const UPSERT_SCHEDULE: &str = r#"
if redis.call('HGET', KEYS[1], 'cron') == ARGV[2] then
  redis.call('HSET', KEYS[1], 'payload', ARGV[3], 'updated', ARGV[5])
  return 0
end
redis.call('HSET', KEYS[1], 'cron', ARGV[2], 'payload', ARGV[3], 'next', ARGV[4], 'updated', ARGV[5])
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
return 1
"#;

const ADVANCE_SCHEDULE: &str = r#"
if redis.call('HGET', KEYS[1], 'next') ~= ARGV[2] then return 0 end
redis.call('HSET', KEYS[1], 'next', ARGV[3], 'updated', ARGV[4])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

struct Scripts {
    enqueue: Script,
    claim: Script,
    extend: Script,
    complete: Script,
    retry: Script,
    fail: Script,
    reclaim: Script,
    counts: Script,
    upsert_schedule: Script,
    advance_schedule: Script,
}

impl Scripts {
    fn load() -> Self {
        let timed = |body: &str| Script::new(&format!("{NOW_MS}{body}"));
        let leased = |body: &str| Script::new(&format!("{NOW_MS}{HOLDS_LEASE}{body}"));
        Self {
            enqueue: timed(ENQUEUE),
            claim: timed(CLAIM),
            extend: leased(EXTEND),
            complete: leased(COMPLETE),
            retry: leased(RETRY),
            fail: leased(FAIL),
            reclaim: timed(RECLAIM),
            counts: timed(COUNTS),
            upsert_schedule: Script::new(UPSERT_SCHEDULE),
            advance_schedule: Script::new(ADVANCE_SCHEDULE),
        }
    }
}

/// Redis implementation of QueueBackend
///
/// # Example
///
/// ```ignore
/// use laneq::RedisQueueBackend;
///
/// let backend = RedisQueueBackend::connect("redis://localhost:6379").await?;
/// ```
#[derive(Clone)]
pub struct RedisQueueBackend {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisQueueBackend {
    /// Connect to Redis; the connection reconnects on its own
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            conn,
            scripts: Arc::new(Scripts::load()),
        })
    }
}

struct Keys {
    base: String,
}

impl Keys {
    fn new(ns: &Namespace) -> Self {
        Self { base: ns.key() }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: &str) -> String {
        format!("{}:job:{id}", self.base)
    }

    fn pending(&self) -> String {
        format!("{}:pending", self.base)
    }

    fn active(&self) -> String {
        format!("{}:active", self.base)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.base)
    }

    fn schedule(&self, name: &str) -> String {
        format!("{}:schedule:{name}", self.base)
    }

    fn schedules(&self) -> String {
        format!("{}:schedules", self.base)
    }
}

fn map_redis(operation: &str, e: redis::RedisError) -> StoreError {
    error!(operation, error = %e, "queue backend command failed");
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Database(e.to_string())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn decode_instance(data: &str, attempt: &str) -> Result<JobInstance, StoreError> {
    let mut instance: JobInstance =
        serde_json::from_str(data).map_err(|e| StoreError::Serialization(e.to_string()))?;
    instance.attempt = attempt.parse().unwrap_or(instance.attempt);
    Ok(instance)
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    #[instrument(skip(self, job), fields(queue = %ns, job_id = %job.id, job_name = %job.name))]
    async fn enqueue(
        &self,
        ns: &Namespace,
        job: JobInstance,
        delay: Duration,
    ) -> Result<bool, StoreError> {
        let keys = Keys::new(ns);
        let data =
            serde_json::to_string(&job).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let created: i64 = self
            .scripts
            .enqueue
            .key(keys.job(&job.id))
            .key(keys.pending())
            .arg(&job.id)
            .arg(data)
            .arg(millis(delay))
            .arg(job.attempt)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("enqueue", e))?;

        debug!(created = created == 1, "enqueued job");
        Ok(created == 1)
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

        let keys = Keys::new(ns);
        let mut invocation = self.scripts.claim.prepare_invoke();
        invocation
            .key(keys.pending())
            .key(keys.active())
            .arg(keys.job_prefix())
            .arg(max_jobs)
            .arg(millis(lease_duration))
            .arg(worker_id);
        for _ in 0..max_jobs {
            invocation.arg(Uuid::now_v7().to_string());
        }

        let flat: Vec<String> = invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("claim", e))?;

        let mut claimed = Vec::with_capacity(flat.len() / 4);
        for chunk in flat.chunks_exact(4) {
            let instance = decode_instance(&chunk[1], &chunk[2])?;
            let token =
                Uuid::parse_str(&chunk[3]).map_err(|e| StoreError::Serialization(e.to_string()))?;
            claimed.push(ClaimedJob {
                lease: Lease {
                    job_id: chunk[0].clone(),
                    token,
                    worker_id: worker_id.to_string(),
                },
                instance,
            });
        }

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
        let keys = Keys::new(ns);
        let extended: i64 = self
            .scripts
            .extend
            .key(keys.job(&lease.job_id))
            .key(keys.active())
            .arg(&lease.job_id)
            .arg(lease.token.to_string())
            .arg(millis(lease_duration))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("extend_lease", e))?;

        Ok(extended == 1)
    }

    #[instrument(skip(self, lease), fields(queue = %ns, job_id = %lease.job_id))]
    async fn complete(&self, ns: &Namespace, lease: &Lease) -> Result<(), StoreError> {
        let keys = Keys::new(ns);
        let done: i64 = self
            .scripts
            .complete
            .key(keys.job(&lease.job_id))
            .key(keys.active())
            .arg(&lease.job_id)
            .arg(lease.token.to_string())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("complete", e))?;

        if done == 0 {
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
        let keys = Keys::new(ns);
        let attempt: i64 = self
            .scripts
            .retry
            .key(keys.job(&lease.job_id))
            .key(keys.active())
            .key(keys.pending())
            .arg(&lease.job_id)
            .arg(lease.token.to_string())
            .arg(millis(delay))
            .arg(error)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("retry", e))?;

        if attempt == 0 {
            return Err(StoreError::LeaseLost(lease.job_id.clone()));
        }
        Ok(attempt as u32)
    }

    #[instrument(skip(self, lease, error), fields(queue = %ns, job_id = %lease.job_id))]
    async fn fail(
        &self,
        ns: &Namespace,
        lease: &Lease,
        error: &str,
        retain: bool,
    ) -> Result<(), StoreError> {
        let keys = Keys::new(ns);
        let done: i64 = self
            .scripts
            .fail
            .key(keys.job(&lease.job_id))
            .key(keys.active())
            .key(keys.failed())
            .arg(&lease.job_id)
            .arg(lease.token.to_string())
            .arg(error)
            .arg(if retain { "1" } else { "0" })
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("fail", e))?;

        if done == 0 {
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
        let keys = Keys::new(ns);
        let flat: Vec<String> = self
            .scripts
            .reclaim
            .key(keys.pending())
            .key(keys.active())
            .key(keys.failed())
            .arg(keys.job_prefix())
            .arg(policy.max_stalled_count)
            .arg(if policy.retain_failed { "1" } else { "0" })
            .arg(STALLED_ERROR)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("reclaim_expired", e))?;

        let mut report = ReclaimReport::default();
        for chunk in flat.chunks_exact(4) {
            if chunk[0] == "failed" {
                let name = serde_json::from_str::<JobInstance>(&chunk[2])
                    .map(|i| i.name)
                    .unwrap_or_default();
                report.failed.push(StalledJob {
                    id: chunk[1].clone(),
                    name,
                    attempt: chunk[3].parse().unwrap_or(0),
                });
            } else {
                report.requeued.push(chunk[1].clone());
            }
        }

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
        if limit == 0 {
            return Ok(vec![]);
        }

        let keys = Keys::new(ns);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(keys.failed())
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis("failed_jobs", e))?;

        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(keys.job(&id))
                .arg("data")
                .arg("attempt")
                .arg("error")
                .arg("failed_at")
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis("failed_jobs", e))?;

            let (Some(data), Some(attempt)) = (&fields[0], &fields[1]) else {
                continue;
            };
            failed.push(FailedJob {
                instance: decode_instance(data, attempt)?,
                error: fields[2].clone().unwrap_or_default(),
                failed_at: fields[3]
                    .as_deref()
                    .and_then(|v| v.parse().ok())
                    .map(from_millis)
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(failed)
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn counts(&self, ns: &Namespace) -> Result<QueueCounts, StoreError> {
        let keys = Keys::new(ns);
        let values: Vec<u64> = self
            .scripts
            .counts
            .key(keys.pending())
            .key(keys.active())
            .key(keys.failed())
            .key(keys.schedules())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("counts", e))?;

        let get = |i: usize| values.get(i).copied().unwrap_or(0);
        Ok(QueueCounts {
            waiting: get(0),
            delayed: get(1),
            active: get(2),
            failed: get(3),
            schedules: get(4),
        })
    }

    #[instrument(skip(self, schedule), fields(queue = %ns, schedule = %schedule.name))]
    async fn upsert_schedule(
        &self,
        ns: &Namespace,
        schedule: ScheduleRecord,
    ) -> Result<(), StoreError> {
        let keys = Keys::new(ns);
        let payload = serde_json::to_string(&schedule.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let _: i64 = self
            .scripts
            .upsert_schedule
            .key(keys.schedule(&schedule.name))
            .key(keys.schedules())
            .arg(&schedule.name)
            .arg(&schedule.cron)
            .arg(payload)
            .arg(schedule.next_run_at.timestamp_millis())
            .arg(schedule.updated_at.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("upsert_schedule", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn remove_schedule(&self, ns: &Namespace, name: &str) -> Result<bool, StoreError> {
        let keys = Keys::new(ns);
        let (_, removed): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(keys.schedule(name))
            .cmd("ZREM")
            .arg(keys.schedules())
            .arg(name)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("remove_schedule", e))?;

        Ok(removed == 1)
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn list_schedules(&self, ns: &Namespace) -> Result<Vec<ScheduleRecord>, StoreError> {
        let keys = Keys::new(ns);
        let mut conn = self.conn.clone();
        let mut names: Vec<String> = redis::cmd("ZRANGE")
            .arg(keys.schedules())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis("list_schedules", e))?;
        names.sort();

        self.load_schedules(&keys, names).await
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn due_schedules(
        &self,
        ns: &Namespace,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let keys = Keys::new(ns);
        let names: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys.schedules())
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("due_schedules", e))?;

        self.load_schedules(&keys, names).await
    }

    #[instrument(skip(self), fields(queue = %ns))]
    async fn advance_schedule(
        &self,
        ns: &Namespace,
        name: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let keys = Keys::new(ns);
        let advanced: i64 = self
            .scripts
            .advance_schedule
            .key(keys.schedule(name))
            .key(keys.schedules())
            .arg(name)
            .arg(expected.timestamp_millis())
            .arg(next.timestamp_millis())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis("advance_schedule", e))?;

        Ok(advanced == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }
}

impl RedisQueueBackend {
    async fn load_schedules(
        &self,
        keys: &Keys,
        names: Vec<String>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let mut schedules = Vec::with_capacity(names.len());
        for name in names {
            let fields: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(keys.schedule(&name))
                .arg("cron")
                .arg("payload")
                .arg("next")
                .arg("updated")
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis("load_schedules", e))?;

            let (Some(cron), Some(payload), Some(next)) = (&fields[0], &fields[1], &fields[2])
            else {
                continue;
            };
            let payload = serde_json::from_str(payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let parse_ms = |v: &str| v.parse::<i64>().ok().map(from_millis);

            schedules.push(ScheduleRecord {
                name,
                cron: cron.clone(),
                payload,
                next_run_at: parse_ms(next).unwrap_or_else(Utc::now),
                updated_at: fields[3]
                    .as_deref()
                    .and_then(parse_ms)
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(schedules)
    }
}
