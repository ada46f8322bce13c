//! Built-in jobs shipped with the worker binary

use std::time::Duration;

use async_trait::async_trait;
use laneq::{Cron, Job, JobContext, JobError, RegistryBuilder, RegistryError};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Writes a message to the log
pub struct LogMessage;

#[derive(Debug, Serialize, Deserialize)]
pub struct LogMessagePayload {
    pub message: String,
}

#[async_trait]
impl Job for LogMessage {
    const NAME: &'static str = "log:message";
    type Payload = LogMessagePayload;

    async fn run(&self, ctx: &JobContext, payload: LogMessagePayload) -> Result<(), JobError> {
        info!(id = %ctx.id, attempt = ctx.attempt, message = %payload.message, "log:message");
        Ok(())
    }
}

/// Holds a slot for a while; handy for checking shutdown and concurrency
pub struct Sleep;

#[derive(Debug, Serialize, Deserialize)]
pub struct SleepPayload {
    pub ms: u64,
}

#[async_trait]
impl Job for Sleep {
    const NAME: &'static str = "debug:sleep";
    type Payload = SleepPayload;

    async fn run(&self, _ctx: &JobContext, payload: SleepPayload) -> Result<(), JobError> {
        tokio::time::sleep(Duration::from_millis(payload.ms)).await;
        Ok(())
    }
}

/// Logs once a minute so an idle lane still shows signs of life
pub struct Heartbeat;

#[async_trait]
impl Cron for Heartbeat {
    const NAME: &'static str = "worker:heartbeat";
    const SCHEDULE: &'static str = "* * * * *";

    async fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        info!(lane = %ctx.lane, "heartbeat");
        Ok(())
    }
}

/// Register every built-in job
pub fn register(builder: &mut RegistryBuilder) -> Result<(), RegistryError> {
    builder
        .register_job(LogMessage)?
        .register_job(Sleep)?
        .register_cron_job(Heartbeat)?;
    Ok(())
}
