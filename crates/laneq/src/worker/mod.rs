//! Worker pool for job execution
//!
//! This module provides:
//! - [`WorkerPool`] - bounded concurrent execution of one lane's jobs
//! - [`BackpressureConfig`] - load-aware claiming
//! - [`PollerConfig`] - adaptive polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐  ┌─────────────────┐  ┌─────────────────┐  │
//! │  │  JobPoller  │  │  Lease renewal  │  │ Stale reclaimer │  │
//! │  │  (adaptive) │  │  (lease / 3)    │  │     (30s)       │  │
//! │  └──────┬──────┘  └─────────────────┘  └─────────────────┘  │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │              BackpressureState                       │    │
//! │  │  (high/low watermarks, in-flight tracking)          │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │          JobExecutor (Semaphore-limited)            │    │
//! │  │  [Job 1] [Job 2] [Job 3] ... [Job N]                │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each slot moves through `Idle → Leased → Executing → Completing | Failing
//! → Idle`. Retries go back to the backend with a visibility delay; a slot
//! never sleeps through a backoff.

mod backpressure;
mod executor;
mod poller;
mod pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use executor::{ExecutionOutcome, PANIC, TIMEOUT, UNKNOWN_JOB};
pub use poller::{JobPoller, PollerConfig};
pub use pool::{
    WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus, DEFAULT_MAX_CONCURRENCY,
};
