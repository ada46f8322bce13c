//! Persistence layer for the job queue
//!
//! This module provides:
//! - [`QueueBackend`] trait for job and schedule persistence
//! - [`InMemoryQueueBackend`] for tests and single-process runs
//! - [`PostgresQueueBackend`] for production
//! - `RedisQueueBackend` for production (feature `redis`)

mod memory;
mod postgres;
#[cfg(feature = "redis")]
mod redis;
mod store;

pub use memory::InMemoryQueueBackend;
pub use postgres::PostgresQueueBackend;
#[cfg(feature = "redis")]
pub use redis::RedisQueueBackend;
pub use store::{
    ClaimedJob, FailedJob, JobStatus, Lease, QueueBackend, QueueCounts, ReclaimReport,
    ScheduleRecord, StallPolicy, StalledJob, StoreError, STALLED_ERROR,
};
