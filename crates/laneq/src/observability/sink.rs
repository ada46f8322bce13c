//! Event sink: structured logs plus best-effort telemetry
//!
//! Every event is logged synchronously through `tracing`. Error-class events
//! are also queued on a bounded channel that a background task drains into
//! the [`TelemetryReporter`]. Emitting never blocks and never fails: when
//! the channel is full the report is dropped and counted.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{FailureReport, JobEvent};
use super::reporter::TelemetryReporter;

/// Default capacity of the telemetry queue
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

const SUBSCRIBER_CAPACITY: usize = 256;

/// Cloneable handle to the event sink
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    tx: Mutex<Option<mpsc::Sender<FailureReport>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<JobEvent>,
    reporter: Arc<dyn TelemetryReporter>,
    dropped: AtomicU64,
    reported: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a sink and spawn its drain task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(reporter: Arc<dyn TelemetryReporter>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<FailureReport>(capacity.max(1));
        let (events, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let reported = Arc::new(AtomicU64::new(0));

        let drain_reporter = Arc::clone(&reporter);
        let drain_reported = Arc::clone(&reported);
        let drain = tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                let call = drain_reporter.report_failure(&report.error, &report.context);
                if AssertUnwindSafe(call).catch_unwind().await.is_err() {
                    error!(kind = %report.context.kind, "telemetry reporter panicked");
                    continue;
                }
                drain_reported.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Telemetry drain exited");
        });

        Self {
            inner: Arc::new(SinkInner {
                tx: Mutex::new(Some(tx)),
                drain: Mutex::new(Some(drain)),
                events,
                reporter,
                dropped: AtomicU64::new(0),
                reported,
            }),
        }
    }

    /// Record an event
    pub fn emit(&self, event: JobEvent) {
        log_event(&event);

        if let Some(report) = event.to_report() {
            let sent = match self.inner.tx.lock().as_ref() {
                Some(tx) => tx.try_send(report).is_ok(),
                None => false,
            };
            if !sent {
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(dropped, "telemetry report dropped");
            }
        }

        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Reports dropped because the queue was full or closed
    pub fn dropped_reports(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Reports handed to the reporter
    pub fn delivered_reports(&self) -> u64 {
        self.inner.reported.load(Ordering::Relaxed)
    }

    /// Stop accepting reports, drain the queue and flush the reporter
    ///
    /// Idempotent. Events emitted afterwards are still logged.
    pub async fn flush(&self, timeout: Duration) {
        // Dropping the sender ends the drain loop once the queue is empty
        drop(self.inner.tx.lock().take());
        let drain = self.inner.drain.lock().take();

        if let Some(handle) = drain {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Telemetry drain did not finish in time"
                );
            }
            self.inner.reporter.flush(timeout).await;
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("dropped", &self.dropped_reports())
            .field("delivered", &self.delivered_reports())
            .finish()
    }
}

fn log_event(event: &JobEvent) {
    match event {
        JobEvent::Completed {
            id,
            name,
            attempt,
            duration,
        } => info!(
            id = %id,
            name = %name,
            attempt,
            duration_ms = duration.as_millis() as u64,
            "completed"
        ),
        JobEvent::Retrying {
            id,
            name,
            attempt,
            error,
            delay,
        } => warn!(
            id = %id,
            name = %name,
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "retrying"
        ),
        JobEvent::Failed {
            id,
            name,
            attempt,
            error,
            reason,
        } => error!(
            id = %id,
            name = %name,
            attempt,
            error = %error,
            reason = %reason,
            "failed"
        ),
        JobEvent::BackendError { operation, error } => {
            error!(operation = %operation, error = %error, "error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{FailureContext, FailureReason, NoopReporter};
    use async_trait::async_trait;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(String, FailureContext)>>,
    }

    #[async_trait]
    impl TelemetryReporter for Recording {
        async fn report_failure(&self, error: &str, context: &FailureContext) {
            self.seen.lock().push((error.to_string(), context.clone()));
        }
    }

    struct Panicking;

    #[async_trait]
    impl TelemetryReporter for Panicking {
        async fn report_failure(&self, _error: &str, _context: &FailureContext) {
            panic!("reporter exploded");
        }
    }

    fn failed(id: &str) -> JobEvent {
        JobEvent::Failed {
            id: id.into(),
            name: "resize".into(),
            attempt: 3,
            error: "boom".into(),
            reason: FailureReason::Exhausted,
        }
    }

    #[tokio::test]
    async fn test_error_events_reach_reporter() {
        let reporter = Arc::new(Recording::default());
        let sink = EventSink::new(reporter.clone(), 16);

        sink.emit(JobEvent::Completed {
            id: "1".into(),
            name: "resize".into(),
            attempt: 1,
            duration: Duration::from_millis(5),
        });
        sink.emit(failed("2"));
        sink.flush(Duration::from_secs(1)).await;

        let seen = reporter.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "boom");
        assert_eq!(seen[0].1.job_id.as_deref(), Some("2"));
        assert_eq!(sink.delivered_reports(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let sink = EventSink::new(Arc::new(NoopReporter), 1);

        // The drain task has not run yet on this single-threaded runtime
        for i in 0..5 {
            sink.emit(failed(&i.to_string()));
        }
        assert_eq!(sink.dropped_reports(), 4);
        sink.flush(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_reporter_panic_is_contained() {
        let sink = EventSink::new(Arc::new(Panicking), 16);
        sink.emit(failed("1"));
        sink.emit(failed("2"));
        sink.flush(Duration::from_secs(1)).await;

        assert_eq!(sink.delivered_reports(), 0);
        assert_eq!(sink.dropped_reports(), 0);
    }

    #[tokio::test]
    async fn test_flush_is_idempotent_and_emit_after_flush_is_safe() {
        let sink = EventSink::new(Arc::new(NoopReporter), 4);
        sink.flush(Duration::from_secs(1)).await;
        sink.flush(Duration::from_secs(1)).await;

        sink.emit(failed("late"));
        assert_eq!(sink.dropped_reports(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_every_event() {
        let sink = EventSink::new(Arc::new(NoopReporter), 4);
        let mut rx = sink.subscribe();

        sink.emit(failed("1"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), Some("1"));
    }
}
