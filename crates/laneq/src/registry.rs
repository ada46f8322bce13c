//! Job and cron registry
//!
//! The registry maps job names to handlers. It is assembled once at process
//! start through [`RegistryBuilder`] and then frozen into an immutable
//! [`JobRegistry`] shared by the producer and the worker pool, so dispatch
//! needs no synchronization.
//!
//! Jobs and crons share one name space: a cron is a job plus a schedule and
//! is dispatched through the same path.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::job::{Cron, Job, JobContext, JobError};
use crate::reliability::RetryPolicy;
use crate::scheduler::{CronSchedule, ScheduleError};

/// Future returned by a job handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send>>;

/// Type-erased job handler
pub type JobHandler = Arc<dyn Fn(JobContext, Value) -> HandlerFuture + Send + Sync>;

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A job or cron with this name is already registered
    #[error("duplicate job name: {0}")]
    DuplicateName(String),

    /// No job or cron registered under this name
    #[error("unknown job: {0}")]
    NotFound(String),

    /// Cron expression could not be parsed
    #[error("invalid schedule for cron {name}: {source}")]
    InvalidSchedule {
        name: String,
        #[source]
        source: ScheduleError,
    },
}

/// A registered job
#[derive(Clone)]
pub struct JobDefinition {
    name: String,
    handler: JobHandler,
    retry: RetryPolicy,
}

impl JobDefinition {
    /// Job name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default retry policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Start one attempt of the handler
    pub fn invoke(&self, ctx: JobContext, payload: Value) -> HandlerFuture {
        (self.handler)(ctx, payload)
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// A registered recurring trigger
#[derive(Debug, Clone)]
pub struct CronDefinition {
    /// Cron name (also the job name it dispatches to)
    pub name: String,

    /// Parsed schedule
    pub schedule: CronSchedule,

    /// Payload delivered with every firing
    pub payload: Value,
}

/// Mutable registration surface, used once at startup
///
/// # Example
///
/// ```
/// use laneq::{JobError, RegistryBuilder, RetryPolicy};
///
/// let mut builder = RegistryBuilder::new();
/// builder
///     .register("email:send", |_ctx, _payload| async { Ok::<(), JobError>(()) }, RetryPolicy::default())
///     .unwrap()
///     .register_cron("report:daily", "0 6 * * *", |_ctx, _payload| async { Ok(()) }, RetryPolicy::default())
///     .unwrap();
///
/// let registry = builder.build();
/// assert!(registry.resolve("email:send").is_ok());
/// assert_eq!(registry.crons().len(), 1);
/// ```
#[derive(Default)]
pub struct RegistryBuilder {
    jobs: HashMap<String, JobDefinition>,
    crons: Vec<CronDefinition>,
}

impl RegistryBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler
    ///
    /// Fails with [`RegistryError::DuplicateName`] if the name is taken by a
    /// job or a cron.
    pub fn register<F, Fut>(
        &mut self,
        name: impl Into<String>,
        handler: F,
        retry: RetryPolicy,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let name = name.into();
        if self.jobs.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        let handler: JobHandler =
            Arc::new(move |ctx: JobContext, payload: Value| -> HandlerFuture {
                Box::pin(handler(ctx, payload))
            });
        self.jobs.insert(
            name.clone(),
            JobDefinition {
                name,
                handler,
                retry,
            },
        );
        Ok(self)
    }

    /// Register a cron: a job handler plus a recurring schedule
    pub fn register_cron<F, Fut>(
        &mut self,
        name: impl Into<String>,
        schedule: &str,
        handler: F,
        retry: RetryPolicy,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let name = name.into();
        if self.jobs.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }

        let schedule =
            CronSchedule::parse(schedule).map_err(|source| RegistryError::InvalidSchedule {
                name: name.clone(),
                source,
            })?;

        self.register(name.clone(), handler, retry)?;
        self.crons.push(CronDefinition {
            name,
            schedule,
            payload: Value::Null,
        });
        Ok(self)
    }

    /// Register a typed job
    ///
    /// Payloads that fail to deserialize into `J::Payload` are fatal: no
    /// retry can fix them.
    pub fn register_job<J: Job>(&mut self, job: J) -> Result<&mut Self, RegistryError> {
        let job = Arc::new(job);
        self.register(
            J::NAME,
            move |ctx, payload| {
                let job = Arc::clone(&job);
                async move {
                    let payload: J::Payload = serde_json::from_value(payload).map_err(|e| {
                        JobError::fatal(format!("invalid payload for {}: {}", J::NAME, e))
                            .with_type("INVALID_PAYLOAD")
                    })?;
                    job.run(&ctx, payload).await
                }
            },
            J::retry_policy(),
        )
    }

    /// Register a typed cron
    pub fn register_cron_job<C: Cron>(&mut self, cron: C) -> Result<&mut Self, RegistryError> {
        let cron = Arc::new(cron);
        self.register_cron(
            C::NAME,
            C::SCHEDULE,
            move |ctx, _payload| {
                let cron = Arc::clone(&cron);
                async move { cron.run(&ctx).await }
            },
            C::retry_policy(),
        )
    }

    /// Freeze the registry
    pub fn build(self) -> JobRegistry {
        JobRegistry {
            jobs: self.jobs,
            crons: self.crons,
        }
    }
}

/// Immutable name-to-handler table
pub struct JobRegistry {
    jobs: HashMap<String, JobDefinition>,
    crons: Vec<CronDefinition>,
}

impl JobRegistry {
    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Resolve a job (or cron) by name
    pub fn resolve(&self, name: &str) -> Result<&JobDefinition, RegistryError> {
        self.jobs
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Check if a name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Registered cron definitions
    pub fn crons(&self) -> &[CronDefinition] {
        &self.crons
    }

    /// Get all registered names
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(|s| s.as_str())
    }

    /// Number of registered names (jobs and crons)
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .field(
                "crons",
                &self.crons.iter().map(|c| &c.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobInstance;
    use crate::lane::Lane;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    fn noop_builder() -> RegistryBuilder {
        let mut builder = RegistryBuilder::new();
        builder
            .register("a", |_ctx, _p| async { Ok(()) }, RetryPolicy::default())
            .unwrap();
        builder
    }

    fn ctx_for(name: &str) -> JobContext {
        let instance = JobInstance::new(
            name,
            Value::Null,
            &RetryPolicy::default(),
            Lane::new("test").unwrap(),
        );
        JobContext::for_instance(&instance)
    }

    #[test]
    fn test_duplicate_job_name() {
        let mut builder = noop_builder();
        let result = builder.register("a", |_ctx, _p| async { Ok(()) }, RetryPolicy::default());
        assert!(matches!(result, Err(RegistryError::DuplicateName(n)) if n == "a"));
    }

    #[test]
    fn test_duplicate_across_jobs_and_crons() {
        let mut builder = noop_builder();
        let result = builder.register_cron(
            "a",
            "* * * * *",
            |_ctx, _p| async { Ok(()) },
            RetryPolicy::default(),
        );
        assert!(matches!(result, Err(RegistryError::DuplicateName(_))));

        let mut builder = RegistryBuilder::new();
        builder
            .register_cron("c", "* * * * *", |_ctx, _p| async { Ok(()) }, RetryPolicy::default())
            .unwrap();
        let result = builder.register("c", |_ctx, _p| async { Ok(()) }, RetryPolicy::default());
        assert!(matches!(result, Err(RegistryError::DuplicateName(_))));
    }

    #[test]
    fn test_invalid_cron_schedule() {
        let mut builder = RegistryBuilder::new();
        let result = builder.register_cron(
            "bad",
            "not a schedule",
            |_ctx, _p| async { Ok(()) },
            RetryPolicy::default(),
        );
        assert!(matches!(result, Err(RegistryError::InvalidSchedule { .. })));
        assert!(builder.build().is_empty());
    }

    #[test]
    fn test_resolve() {
        let registry = noop_builder().build();

        assert!(registry.resolve("a").is_ok());
        assert!(matches!(
            registry.resolve("missing"),
            Err(RegistryError::NotFound(n)) if n == "missing"
        ));
        assert!(registry.contains("a"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_invoke_closure_handler() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(
                "echo",
                |_ctx, payload| async move {
                    if payload["ok"] == true {
                        Ok(())
                    } else {
                        Err(JobError::fatal("not ok"))
                    }
                },
                RetryPolicy::default(),
            )
            .unwrap();
        let registry = builder.build();
        let echo = registry.resolve("echo").unwrap();

        assert!(echo
            .invoke(ctx_for("echo"), serde_json::json!({"ok": true}))
            .await
            .is_ok());
        assert!(echo
            .invoke(ctx_for("echo"), serde_json::json!({"ok": false}))
            .await
            .is_err());
    }

    struct Resize;

    #[derive(Serialize, Deserialize)]
    struct ResizePayload {
        width: u32,
    }

    #[async_trait]
    impl Job for Resize {
        const NAME: &'static str = "image:resize";
        type Payload = ResizePayload;

        fn retry_policy() -> RetryPolicy {
            RetryPolicy::default().with_attempts(5)
        }

        async fn run(&self, _ctx: &JobContext, payload: ResizePayload) -> Result<(), JobError> {
            if payload.width == 0 {
                return Err(JobError::retryable("zero width"));
            }
            Ok(())
        }
    }

    struct Nightly;

    #[async_trait]
    impl Cron for Nightly {
        const NAME: &'static str = "report:nightly";
        const SCHEDULE: &'static str = "0 3 * * *";

        async fn run(&self, _ctx: &JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_typed_job_registration() {
        let mut builder = RegistryBuilder::new();
        builder.register_job(Resize).unwrap();
        let registry = builder.build();

        let def = registry.resolve(Resize::NAME).unwrap();
        assert_eq!(def.retry_policy().attempts, 5);

        assert!(def
            .invoke(ctx_for(Resize::NAME), serde_json::json!({"width": 10}))
            .await
            .is_ok());

        let err = def
            .invoke(ctx_for(Resize::NAME), serde_json::json!({"height": 10}))
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("INVALID_PAYLOAD"));
    }

    #[test]
    fn test_typed_cron_registration() {
        let mut builder = RegistryBuilder::new();
        builder.register_cron_job(Nightly).unwrap();
        let registry = builder.build();

        assert!(registry.contains(Nightly::NAME));
        assert_eq!(registry.crons()[0].schedule.expression(), "0 3 * * *");
    }
}
