//! # laneq
//!
//! A lane-partitioned background job queue with at-least-once delivery.
//!
//! ## Features
//!
//! - **Named jobs and crons**: handlers are registered once at startup in an immutable registry
//! - **Lanes**: every deployment stack (or developer machine) gets an isolated key space in a shared backend
//! - **Automatic retries**: fixed or exponential backoff, scheduled through delayed visibility
//! - **Leases**: claimed jobs are renewed while running and reclaimed when a worker dies
//! - **Error telemetry**: failures are logged and reported to Sentry off the hot path
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   enqueue    ┌─────────────────────────────────┐
//! │   Producer   │─────────────▶│          QueueBackend           │
//! └──────────────┘              │ (memory / PostgreSQL / Redis)   │
//!                               │  namespace = {stack}:{mq}:lane  │
//! ┌──────────────┐   due crons  └─────────────────────────────────┘
//! │CronScheduler │─────────────▶        ▲        │
//! └──────────────┘                      │ ack    │ claim
//!                               ┌───────┴────────▼────────────────┐
//!                               │           WorkerPool            │
//!                               │ (bounded slots, leases, reclaim)│
//!                               └───────────────┬─────────────────┘
//!                                               │ events
//!                                               ▼
//!                               ┌─────────────────────────────────┐
//!                               │   EventSink → tracing + Sentry  │
//!                               └─────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use laneq::prelude::*;
//!
//! let mut builder = RegistryBuilder::new();
//! builder.register_job(SendWelcomeEmail)?;
//!
//! let config = LaneqConfig::from_env()?;
//! let backend = Arc::new(InMemoryQueueBackend::new());
//! let runtime =
//!     QueueRuntime::start(config, Arc::new(builder.build()), backend, Arc::new(NoopReporter)).await?;
//!
//! runtime
//!     .producer()
//!     .enqueue_job::<SendWelcomeEmail>(&WelcomeEmail { user_id: "42".into() }, None)
//!     .await?;
//!
//! runtime.stop().await;
//! ```

pub mod config;
pub mod job;
pub mod lane;
pub mod observability;
pub mod persistence;
pub mod producer;
pub mod registry;
pub mod reliability;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;
pub mod worker;

mod util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{BackendKind, LaneqConfig};
    pub use crate::job::{Cron, Job, JobContext, JobError, JobHandle, JobOptions};
    pub use crate::lane::{Lane, LaneConfig, Namespace};
    pub use crate::observability::{JobEvent, NoopReporter, SentryReporter, TelemetryReporter};
    pub use crate::persistence::{InMemoryQueueBackend, PostgresQueueBackend, QueueBackend};
    pub use crate::producer::{EnqueueError, Producer};
    pub use crate::registry::{JobRegistry, RegistryBuilder};
    pub use crate::reliability::{Backoff, RetryPolicy};
    pub use crate::runtime::QueueRuntime;
    pub use async_trait::async_trait;
    pub use serde::{Deserialize, Serialize};
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use config::{BackendKind, ConfigError, LaneqConfig};
pub use job::{Cron, Job, JobContext, JobError, JobHandle, JobInstance, JobOptions};
pub use lane::{Lane, LaneConfig, LaneError, Namespace};
pub use observability::{
    init_sentry, EventSink, FailureReason, JobEvent, NoopReporter, SentryReporter,
    TelemetryReporter,
};
#[cfg(feature = "redis")]
pub use persistence::RedisQueueBackend;
pub use persistence::{
    InMemoryQueueBackend, PostgresQueueBackend, QueueBackend, QueueCounts, StallPolicy,
    StoreError,
};
pub use producer::{EnqueueError, Producer};
pub use registry::{CronDefinition, JobDefinition, JobRegistry, RegistryBuilder, RegistryError};
pub use reliability::{Backoff, BackoffKind, RetryPolicy};
pub use runtime::{QueueRuntime, RuntimeError};
pub use scheduler::{CronSchedule, CronScheduler, ScheduleError, SchedulerConfig};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
