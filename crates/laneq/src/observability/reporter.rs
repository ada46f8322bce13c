//! Error telemetry reporters

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::events::FailureContext;

/// Destination for error-class events
///
/// Called from a background task, never from the worker's hot path.
/// Implementations should not block for long; a panic is caught and logged.
#[async_trait]
pub trait TelemetryReporter: Send + Sync + 'static {
    /// Record one failure
    async fn report_failure(&self, error: &str, context: &FailureContext);

    /// Deliver buffered reports, waiting at most `timeout`
    async fn flush(&self, _timeout: Duration) {}
}

/// Reporter that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

#[async_trait]
impl TelemetryReporter for NoopReporter {
    async fn report_failure(&self, _error: &str, _context: &FailureContext) {}
}

/// Reporter that forwards failures to Sentry
///
/// Uses the process-wide hub, so [`init_sentry`] must have run for reports
/// to go anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentryReporter;

impl SentryReporter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TelemetryReporter for SentryReporter {
    async fn report_failure(&self, error: &str, context: &FailureContext) {
        sentry::with_scope(
            |scope| {
                scope.set_tag("laneq.event", &context.kind);
                if let Some(name) = &context.job_name {
                    scope.set_tag("job.name", name);
                }
                if let Some(reason) = context.reason {
                    scope.set_tag("job.failure_reason", reason.as_str());
                }
                if let Some(operation) = &context.operation {
                    scope.set_tag("backend.operation", operation);
                }
                if let Some(id) = &context.job_id {
                    scope.set_extra("job.id", id.clone().into());
                }
                if let Some(attempt) = context.attempt {
                    scope.set_extra("job.attempt", attempt.into());
                }
            },
            || sentry::capture_message(error, sentry::Level::Error),
        );
    }

    async fn flush(&self, timeout: Duration) {
        if let Some(client) = sentry::Hub::current().client() {
            client.flush(Some(timeout));
        }
    }
}

/// Initialize the global Sentry client
///
/// Returns `None` (Sentry stays disabled) in dev mode or without a DSN.
/// Keep the guard alive for the life of the process; dropping it flushes
/// pending events.
pub fn init_sentry(
    dsn: Option<&str>,
    environment: &str,
    dev: bool,
) -> Option<sentry::ClientInitGuard> {
    if dev {
        info!("Sentry disabled in dev mode");
        return None;
    }

    let dsn = match dsn.map(str::trim).filter(|d| !d.is_empty()) {
        Some(dsn) => dsn,
        None => {
            info!("SENTRY_DSN not set, Sentry disabled");
            return None;
        }
    };

    let parsed = match dsn.parse::<sentry::types::Dsn>() {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Invalid SENTRY_DSN, Sentry disabled");
            return None;
        }
    };

    let guard = sentry::init(sentry::ClientOptions {
        dsn: Some(parsed),
        environment: Some(environment.to_string().into()),
        release: sentry::release_name!(),
        ..Default::default()
    });

    info!(environment, "Sentry initialized");
    Some(guard)
}
