//! Shared helpers for queue integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use laneq::observability::FailureContext;
use laneq::{JobEvent, JobRegistry, LaneConfig, LaneqConfig, QueueRuntime, TelemetryReporter};
use laneq::{InMemoryQueueBackend, WorkerPoolConfig};

/// Reporter that keeps every report for inspection
#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<(String, FailureContext)>>,
}

impl RecordingReporter {
    pub fn kinds(&self) -> Vec<String> {
        self.reports
            .lock()
            .iter()
            .map(|(_, ctx)| ctx.kind.clone())
            .collect()
    }
}

#[async_trait]
impl TelemetryReporter for RecordingReporter {
    async fn report_failure(&self, error: &str, context: &FailureContext) {
        self.reports
            .lock()
            .push((error.to_string(), context.clone()));
    }
}

/// Config for a lane of the "test" stack
pub fn config(pool: WorkerPoolConfig) -> LaneqConfig {
    LaneqConfig {
        lane: LaneConfig::stack("test"),
        pool,
        ..Default::default()
    }
}

pub async fn start(
    config: LaneqConfig,
    registry: JobRegistry,
    backend: Arc<InMemoryQueueBackend>,
    reporter: Arc<dyn TelemetryReporter>,
) -> QueueRuntime {
    QueueRuntime::start(config, Arc::new(registry), backend, reporter)
        .await
        .expect("runtime should start")
}

/// Wait for the first event matching `predicate`
pub async fn next_event<F>(
    rx: &mut broadcast::Receiver<JobEvent>,
    timeout: Duration,
    predicate: F,
) -> JobEvent
where
    F: Fn(&JobEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect `count` events matching `predicate`
pub async fn collect_events<F>(
    rx: &mut broadcast::Receiver<JobEvent>,
    count: usize,
    timeout: Duration,
    predicate: F,
) -> Vec<JobEvent>
where
    F: Fn(&JobEvent) -> bool,
{
    let mut events = Vec::with_capacity(count);
    while events.len() < count {
        events.push(next_event(rx, timeout, &predicate).await);
    }
    events
}

pub fn is_completed(event: &JobEvent) -> bool {
    matches!(event, JobEvent::Completed { .. })
}

pub fn is_terminal(event: &JobEvent) -> bool {
    matches!(event, JobEvent::Completed { .. } | JobEvent::Failed { .. })
}
