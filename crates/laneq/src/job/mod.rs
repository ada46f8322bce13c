//! Job abstractions
//!
//! Jobs are named units of asynchronous work executed by the worker pool. They:
//! - Receive a JSON payload (typed through [`Job::Payload`])
//! - May fail and be retried according to their retry policy
//! - Must tolerate running more than once (at-least-once delivery)

mod context;
mod definition;
mod instance;

pub use context::JobContext;
pub use definition::{Cron, Job, JobError};
pub use instance::{JobHandle, JobInstance, JobOptions};
