// Logging and tracing setup
//
// Installs the global tracing subscriber used by laneq processes:
// - Env-driven log filter
// - Human readable or JSON console output
// - OTLP span export (feature "otel")

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider as _;
#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
#[cfg(feature = "otel")]
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Configuration for logging and tracing
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces
    pub service_name: String,
    /// Service version
    pub service_version: Option<String>,
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub otlp_endpoint: Option<String>,
    /// Environment (e.g., "development", "production")
    pub environment: Option<String>,
    /// Log filter (e.g., "info", "laneq=debug")
    pub log_filter: Option<String>,
    /// Emit one JSON object per log line
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "laneq".to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            log_filter: None,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME`: Service name (default: "laneq")
    /// - `OTEL_SERVICE_VERSION`: Service version
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (used with the `otel` feature)
    /// - `OTEL_ENVIRONMENT` or `APP_ENV`: Deployment environment
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `LOG_FORMAT`: "json" for structured output
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "laneq".to_string()),
            service_version: std::env::var("OTEL_SERVICE_VERSION").ok(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),
            environment: std::env::var("OTEL_ENVIRONMENT")
                .ok()
                .or_else(|| std::env::var("APP_ENV").ok()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    /// Set the service name
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// The filter that will be installed
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Guard that shuts down span export when dropped
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<SdkTracerProvider>,
    installed: bool,
}

impl TelemetryGuard {
    /// False if another global subscriber was already installed
    pub fn installed(&self) -> bool {
        self.installed
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {:?}", e);
            }
        }
    }
}

/// Install the global tracing subscriber
///
/// Keep the returned guard alive for the lifetime of the process. Calling
/// this twice leaves the first subscriber in place.
///
/// # Example
///
/// ```ignore
/// use laneq::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let _guard = init_telemetry(TelemetryConfig::from_env());
///     // ... your application code
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(console_layer);

    #[cfg(feature = "otel")]
    let guard = {
        let (provider, otel_layer, otel_status) = match &config.otlp_endpoint {
            Some(endpoint) => match build_otlp_tracer(endpoint, &config) {
                Ok((provider, tracer)) => {
                    let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                    (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
                }
                Err(e) => (None, None, Some(Err(e.to_string()))),
            },
            None => (None, None, None),
        };

        let installed = registry.with(otel_layer).try_init().is_ok();

        match otel_status {
            Some(Ok(endpoint)) => {
                tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Failed to initialize OTLP tracer, continuing without tracing");
            }
            None => {
                tracing::debug!("OpenTelemetry tracing disabled: OTEL_EXPORTER_OTLP_ENDPOINT not set");
            }
        }

        TelemetryGuard {
            provider,
            installed,
        }
    };

    #[cfg(not(feature = "otel"))]
    let guard = {
        let installed = registry.try_init().is_ok();
        if config.otlp_endpoint.is_some() {
            tracing::warn!("OTEL_EXPORTER_OTLP_ENDPOINT is set but the otel feature is disabled");
        }
        TelemetryGuard { installed }
    };

    guard
}

#[cfg(feature = "otel")]
fn build_otlp_tracer(
    endpoint: &str,
    config: &TelemetryConfig,
) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), opentelemetry::trace::TraceError>
{
    let mut resource_attrs = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(version) = &config.service_version {
        resource_attrs.push(KeyValue::new("service.version", version.clone()));
    }
    if let Some(env) = &config.environment {
        resource_attrs.push(KeyValue::new("deployment.environment", env.clone()));
    }
    let resource = Resource::builder().with_attributes(resource_attrs).build();

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(std::time::Duration::from_secs(10))
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("laneq");

    Ok((provider, tracer))
}
