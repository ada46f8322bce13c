// Queue Configuration
//
// Process-level configuration, loaded from environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lane::{default_prefix, LaneConfig, Namespace};
use crate::observability::DEFAULT_SINK_CAPACITY;
use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerPoolConfig;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is required when {reason}")]
    Missing { var: &'static str, reason: String },

    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Which queue backend to connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Postgres,
    Redis,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown backend {other:?}, expected memory, postgres or redis")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
        })
    }
}

/// Everything a laneq process needs to start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneqConfig {
    /// Stack and development mode, which decide the lane
    pub lane: LaneConfig,

    /// Key prefix override (default `{stack}:{mq}`)
    pub prefix: Option<String>,

    /// Backend to use
    pub backend: BackendKind,

    /// PostgreSQL connection URL
    pub database_url: Option<String>,

    /// Redis connection URL
    pub redis_url: Option<String>,

    /// Producer only: enqueue but never claim or schedule
    pub producer_only: bool,

    /// Sentry DSN; error telemetry is off without it
    pub sentry_dsn: Option<String>,

    /// Bound of the telemetry report queue
    pub sink_capacity: usize,

    /// Worker pool settings
    pub pool: WorkerPoolConfig,

    /// Cron scheduler settings
    pub scheduler: SchedulerConfig,
}

impl Default for LaneqConfig {
    fn default() -> Self {
        Self {
            lane: LaneConfig::stack("local"),
            prefix: None,
            backend: BackendKind::Memory,
            database_url: None,
            redis_url: None,
            producer_only: false,
            sentry_dsn: None,
            sink_capacity: DEFAULT_SINK_CAPACITY,
            pool: WorkerPoolConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl LaneqConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `STACK`: Deployment stack (default: "local")
    /// - `DEV` or `APP_ENV=development`: Development mode (lane = host name)
    /// - `LANEQ_HOST`: Host name override for development mode
    /// - `LANEQ_PREFIX`: Key prefix override
    /// - `LANEQ_BACKEND`: memory, postgres or redis (default: postgres when
    ///   `DATABASE_URL` is set, otherwise memory)
    /// - `DATABASE_URL`, `REDIS_URL`: Backend connection URLs
    /// - `LANEQ_CONCURRENCY`: Maximum concurrent jobs (default: 50)
    /// - `LANEQ_LEASE_MS`: Lease duration (default: 30000)
    /// - `LANEQ_SHUTDOWN_TIMEOUT_MS`: Graceful shutdown timeout (default: 30000)
    /// - `LANEQ_REMOVE_ON_FAIL`: Delete terminally failed jobs (default: true)
    /// - `SCRIPT`: Any non-empty value runs the process producer-only
    /// - `SENTRY_DSN`: Error telemetry destination
    /// - `WORKER_ID`: Worker identity (default: generated)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let stack = get("STACK").unwrap_or_else(|| "local".to_string());
        let dev = match get("DEV") {
            Some(value) => parse_bool("DEV", &value)?,
            None => get("APP_ENV").is_some_and(|env| env.eq_ignore_ascii_case("development")),
        };
        let mut lane = if dev {
            LaneConfig::dev(stack)
        } else {
            LaneConfig::stack(stack)
        };
        if let Some(host) = get("LANEQ_HOST") {
            lane = lane.with_host(host);
        }

        let database_url = get("DATABASE_URL");
        let redis_url = get("REDIS_URL");
        let backend = match get("LANEQ_BACKEND") {
            Some(value) => value.parse::<BackendKind>().map_err(|reason| ConfigError::Invalid {
                var: "LANEQ_BACKEND",
                value,
                reason,
            })?,
            None if database_url.is_some() => BackendKind::Postgres,
            None => BackendKind::Memory,
        };

        match backend {
            BackendKind::Postgres if database_url.is_none() => {
                return Err(ConfigError::Missing {
                    var: "DATABASE_URL",
                    reason: "LANEQ_BACKEND=postgres".to_string(),
                })
            }
            BackendKind::Redis if redis_url.is_none() => {
                return Err(ConfigError::Missing {
                    var: "REDIS_URL",
                    reason: "LANEQ_BACKEND=redis".to_string(),
                })
            }
            _ => {}
        }

        let mut pool = WorkerPoolConfig::default();
        if let Some(id) = get("WORKER_ID") {
            pool = pool.with_worker_id(id);
        }
        if let Some(value) = get("LANEQ_CONCURRENCY") {
            let max = parse_number::<usize>("LANEQ_CONCURRENCY", &value)?;
            if max == 0 {
                return Err(ConfigError::Invalid {
                    var: "LANEQ_CONCURRENCY",
                    value,
                    reason: "must be at least 1".to_string(),
                });
            }
            pool = pool.with_max_concurrency(max);
        }
        if let Some(value) = get("LANEQ_LEASE_MS") {
            let lease = parse_number::<u64>("LANEQ_LEASE_MS", &value)?;
            if lease == 0 {
                return Err(ConfigError::Invalid {
                    var: "LANEQ_LEASE_MS",
                    value,
                    reason: "must be positive".to_string(),
                });
            }
            pool = pool.with_lease_duration(Duration::from_millis(lease));
        }
        if let Some(value) = get("LANEQ_SHUTDOWN_TIMEOUT_MS") {
            let timeout = parse_number::<u64>("LANEQ_SHUTDOWN_TIMEOUT_MS", &value)?;
            pool = pool.with_shutdown_timeout(Duration::from_millis(timeout));
        }
        if let Some(value) = get("LANEQ_REMOVE_ON_FAIL") {
            pool = pool.with_remove_on_fail(parse_bool("LANEQ_REMOVE_ON_FAIL", &value)?);
        }

        Ok(Self {
            lane,
            prefix: get("LANEQ_PREFIX"),
            backend,
            database_url,
            redis_url,
            producer_only: get("SCRIPT").is_some(),
            sentry_dsn: get("SENTRY_DSN"),
            sink_capacity: DEFAULT_SINK_CAPACITY,
            pool,
            scheduler: SchedulerConfig::default(),
        })
    }

    /// Namespace of the current lane
    pub fn namespace(&self) -> Namespace {
        let prefix = self
            .prefix
            .clone()
            .unwrap_or_else(|| default_prefix(&self.lane.stack));
        Namespace::new(prefix, self.lane.current_lane())
    }

    /// Environment name reported to error telemetry
    pub fn environment(&self) -> &str {
        if self.lane.dev {
            "development"
        } else {
            &self.lane.stack
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
