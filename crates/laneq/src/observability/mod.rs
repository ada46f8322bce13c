//! Failure and observability sink
//!
//! This module provides:
//! - [`JobEvent`] - completed, retrying, failed and backend error events
//! - [`EventSink`] - logs every event, queues error events for telemetry
//! - [`TelemetryReporter`] - pluggable error telemetry ([`SentryReporter`], [`NoopReporter`])

mod events;
mod reporter;
mod sink;

pub use events::{FailureContext, FailureReason, FailureReport, JobEvent};
pub use reporter::{init_sentry, NoopReporter, SentryReporter, TelemetryReporter};
pub use sink::{EventSink, DEFAULT_SINK_CAPACITY};
