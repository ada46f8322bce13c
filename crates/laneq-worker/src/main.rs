mod jobs;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use laneq::telemetry::{init_telemetry, TelemetryConfig};
use laneq::{
    init_sentry, BackendKind, InMemoryQueueBackend, LaneqConfig, NoopReporter,
    PostgresQueueBackend, QueueBackend, QueueRuntime, RegistryBuilder, SentryReporter,
    TelemetryReporter,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - OTEL_SERVICE_NAME: Service name (default: "laneq-worker")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "laneq=info,laneq_worker=info")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "laneq" {
        telemetry_config.service_name = "laneq-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("laneq=info,laneq_worker=info".to_string());
    }
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = LaneqConfig::from_env().context("Invalid configuration")?;

    let sentry_guard = init_sentry(
        config.sentry_dsn.as_deref(),
        config.environment(),
        config.lane.dev,
    );
    let reporter: Arc<dyn TelemetryReporter> = if sentry_guard.is_some() {
        Arc::new(SentryReporter::new())
    } else {
        Arc::new(NoopReporter)
    };

    let mut builder = RegistryBuilder::new();
    jobs::register(&mut builder).context("Failed to register jobs")?;
    let registry = Arc::new(builder.build());

    let backend = connect(&config).await?;

    tracing::info!(
        backend = %config.backend,
        queue = %config.namespace(),
        worker_id = %config.pool.worker_id,
        max_concurrency = config.pool.max_concurrency,
        producer_only = config.producer_only,
        "laneq-worker starting"
    );

    let producer_only = config.producer_only;
    let runtime = QueueRuntime::start(config, registry, backend, reporter)
        .await
        .context("Failed to start queue runtime")?;

    if producer_only {
        // Script mode: enqueue one job from the command line and exit
        let result = enqueue_from_args(&runtime).await;
        runtime.stop().await;
        return result;
    }

    shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    runtime.stop().await;
    tracing::info!("Worker shutdown complete");
    Ok(())
}

async fn connect(config: &LaneqConfig) -> Result<Arc<dyn QueueBackend>> {
    Ok(match config.backend {
        BackendKind::Memory => {
            tracing::warn!("Using the in-memory backend; jobs do not survive a restart");
            Arc::new(InMemoryQueueBackend::new())
        }
        BackendKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is not set")?;
            let backend = PostgresQueueBackend::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            backend.migrate().await.context("Failed to run migrations")?;
            Arc::new(backend)
        }
        #[cfg(feature = "redis")]
        BackendKind::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("REDIS_URL is not set")?;
            Arc::new(
                laneq::RedisQueueBackend::connect(url)
                    .await
                    .context("Failed to connect to Redis")?,
            )
        }
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => bail!("laneq-worker was built without the redis feature"),
    })
}

async fn enqueue_from_args(runtime: &QueueRuntime) -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(name) = args.next() else {
        bail!("usage: SCRIPT=1 laneq-worker <job-name> [json-payload]");
    };
    let payload: serde_json::Value = match args.next() {
        Some(raw) => serde_json::from_str(&raw).context("Payload is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    let handle = runtime
        .producer()
        .enqueue(&name, &payload, None)
        .await
        .with_context(|| format!("Failed to enqueue {name}"))?;
    tracing::info!(id = %handle.id, name = %handle.name, lane = %handle.lane, "Job enqueued");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
