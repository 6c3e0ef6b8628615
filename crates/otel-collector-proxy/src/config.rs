// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use hyper::header::HeaderValue;

use crate::admission::AdmissionConfig;
use crate::batch::DataSource;
use crate::batcher::BatcherConfig;
use crate::errors::ConfigError;
use crate::health::{BackendConfig, HealthPolicy};
use crate::queue::OverflowPolicy;
use crate::rate_limit::RateLimitScope;
use crate::retry::RetryPolicy;
use crate::router::RoutingMode;
use crate::worker_pool::WorkerPoolConfig;

const DEFAULT_COLLECTOR_HOST: &str = "http://localhost:4318";
const DEFAULT_BACKEND_ID: &str = "default";
const FARO_BACKEND_ID: &str = "faro";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Deployment environment. Production masks ingest responses and logs as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Testing,
    Development,
    Staging,
    #[default]
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Environment> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TESTING" => Some(Environment::Testing),
            "DEVELOPMENT" => Some(Environment::Development),
            "STAGING" => Some(Environment::Staging),
            "PRODUCTION" => Some(Environment::Production),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Testing => "TESTING",
            Environment::Development => "DEVELOPMENT",
            Environment::Staging => "STAGING",
            Environment::Production => "PRODUCTION",
        }
    }

    pub fn is_production(&self) -> bool {
        *self == Environment::Production
    }

    pub fn is_debug(&self) -> bool {
        matches!(self, Environment::Testing | Environment::Development)
    }

    /// Production logs are structured JSON, every other environment logs to the console.
    pub fn json_logs(&self) -> bool {
        self.is_production()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub environment: Environment,
    pub log_level: String,
    pub host: IpAddr,
    pub port: u16,
    pub https_proxy: Option<String>,
    /// Scratch directory the Prometheus exposition is mirrored into.
    pub metrics_dir: Option<PathBuf>,
    /// Browser origins allowed to call the ingest routes. `*` allows any origin.
    pub cors_origins: Vec<String>,
    pub admission: AdmissionConfig,
    pub ingress_queue: QueueConfig,
    pub dispatch_queue: QueueConfig,
    pub batcher: BatcherConfig,
    pub routing: RoutingMode,
    pub backends: Vec<BackendConfig>,
    pub health: HealthPolicy,
    pub delivery: WorkerPoolConfig,
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            environment: Environment::Production,
            log_level: "info".to_string(),
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            https_proxy: None,
            metrics_dir: None,
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:8080".to_string(),
            ],
            admission: AdmissionConfig {
                max_batch_bytes: 5 * 1024 * 1024,
                rate_limit_requests: 100,
                rate_limit_window: Duration::from_secs(60),
                rate_limit_scope: RateLimitScope::PerCaller,
            },
            ingress_queue: QueueConfig {
                capacity: 1024,
                policy: OverflowPolicy::DropNewest,
            },
            dispatch_queue: QueueConfig {
                capacity: 256,
                policy: OverflowPolicy::BlockWithTimeout(Duration::from_secs(1)),
            },
            batcher: BatcherConfig {
                max_flush_bytes: 1024 * 1024,
                max_flush_records: 512,
                flush_interval: Duration::from_secs(1),
                group_by_caller: false,
            },
            routing: RoutingMode::Weighted,
            backends: vec![BackendConfig {
                id: DEFAULT_BACKEND_ID.to_string(),
                endpoint: DEFAULT_COLLECTOR_HOST.to_string(),
                weight: 1,
                source: DataSource::OpenTelemetrySdk,
            }],
            health: HealthPolicy {
                degraded_after: 3,
                unavailable_after: 3,
                failure_window: Duration::from_secs(30),
                canary_interval: Duration::from_secs(5),
            },
            delivery: WorkerPoolConfig {
                workers: 4,
                attempt_timeout: Duration::from_secs(10),
                retry: RetryPolicy::default(),
            },
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source. Unset keys take their default;
    /// set but unparsable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let environment = match get("ENVIRONMENT") {
            Some(value) => Environment::parse(&value).ok_or_else(|| {
                ConfigError::Invalid(format!("Unknown ENVIRONMENT '{value}'"))
            })?,
            None => defaults.environment,
        };
        let log_level = get("LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let host = parse_or("OTEL_PROXY_HOST", get("OTEL_PROXY_HOST"), defaults.host)?;
        let port = parse_or("OTEL_PROXY_PORT", get("OTEL_PROXY_PORT"), defaults.port)?;
        let https_proxy = get("HTTPS_PROXY").or_else(|| get("https_proxy"));
        let metrics_dir = get("PROMETHEUS_MULTIPROC_DIR").map(PathBuf::from);
        let cors_origins = match get("CORS_ORIGINS") {
            Some(value) => parse_origins(&value)?,
            None => defaults.cors_origins,
        };

        let rate_limit_scope = match get("RATE_LIMIT_SCOPE") {
            Some(value) => RateLimitScope::parse(&value).ok_or_else(|| {
                ConfigError::Invalid(format!("Unknown RATE_LIMIT_SCOPE '{value}'"))
            })?,
            None => defaults.admission.rate_limit_scope,
        };
        let admission = AdmissionConfig {
            max_batch_bytes: parse_or(
                "MAX_BODY_SIZE",
                get("MAX_BODY_SIZE"),
                defaults.admission.max_batch_bytes,
            )?,
            rate_limit_requests: parse_or(
                "RATE_LIMIT_REQUESTS",
                get("RATE_LIMIT_REQUESTS"),
                defaults.admission.rate_limit_requests,
            )?,
            rate_limit_window: Duration::from_secs(parse_or(
                "RATE_LIMIT_WINDOW",
                get("RATE_LIMIT_WINDOW"),
                defaults.admission.rate_limit_window.as_secs(),
            )?),
            rate_limit_scope,
        };

        let enqueue_timeout = millis_or(
            "OTEL_PROXY_ENQUEUE_TIMEOUT_MS",
            get("OTEL_PROXY_ENQUEUE_TIMEOUT_MS"),
            Duration::from_millis(100),
        )?;
        let ingress_policy = match get("OTEL_PROXY_OVERFLOW_POLICY") {
            Some(value) => parse_overflow_policy(&value, enqueue_timeout)?,
            None => defaults.ingress_queue.policy,
        };
        let ingress_queue = QueueConfig {
            capacity: parse_or(
                "OTEL_PROXY_QUEUE_CAPACITY",
                get("OTEL_PROXY_QUEUE_CAPACITY"),
                defaults.ingress_queue.capacity,
            )?,
            policy: ingress_policy,
        };
        let dispatch_queue = QueueConfig {
            capacity: parse_or(
                "OTEL_PROXY_DISPATCH_CAPACITY",
                get("OTEL_PROXY_DISPATCH_CAPACITY"),
                defaults.dispatch_queue.capacity,
            )?,
            policy: defaults.dispatch_queue.policy,
        };

        let routing = match get("OTEL_PROXY_ROUTING") {
            Some(value) => RoutingMode::parse(&value).ok_or_else(|| {
                ConfigError::Invalid(format!("Unknown OTEL_PROXY_ROUTING '{value}'"))
            })?,
            None => defaults.routing,
        };

        let batcher = BatcherConfig {
            max_flush_bytes: parse_or(
                "OTEL_PROXY_MAX_FLUSH_BYTES",
                get("OTEL_PROXY_MAX_FLUSH_BYTES"),
                defaults.batcher.max_flush_bytes,
            )?,
            max_flush_records: parse_or(
                "OTEL_PROXY_MAX_FLUSH_RECORDS",
                get("OTEL_PROXY_MAX_FLUSH_RECORDS"),
                defaults.batcher.max_flush_records,
            )?,
            flush_interval: millis_or(
                "OTEL_PROXY_FLUSH_INTERVAL_MS",
                get("OTEL_PROXY_FLUSH_INTERVAL_MS"),
                defaults.batcher.flush_interval,
            )?,
            group_by_caller: routing == RoutingMode::Hash,
        };

        let backends = match get("OTEL_PROXY_BACKENDS") {
            Some(value) => parse_backends(&value)?,
            None => {
                let mut backends = vec![BackendConfig {
                    id: DEFAULT_BACKEND_ID.to_string(),
                    endpoint: get("OTEL_COLLECTOR_HTTP_HOST")
                        .unwrap_or_else(|| DEFAULT_COLLECTOR_HOST.to_string()),
                    weight: 1,
                    source: DataSource::OpenTelemetrySdk,
                }];
                if let Some(faro) = get("OTEL_COLLECTOR_FARO_HOST") {
                    backends.push(BackendConfig {
                        id: FARO_BACKEND_ID.to_string(),
                        endpoint: faro,
                        weight: 1,
                        source: DataSource::Faro,
                    });
                }
                backends
            }
        };

        let health = HealthPolicy {
            degraded_after: parse_or(
                "OTEL_PROXY_DEGRADED_AFTER",
                get("OTEL_PROXY_DEGRADED_AFTER"),
                defaults.health.degraded_after,
            )?,
            unavailable_after: parse_or(
                "OTEL_PROXY_UNAVAILABLE_AFTER",
                get("OTEL_PROXY_UNAVAILABLE_AFTER"),
                defaults.health.unavailable_after,
            )?,
            failure_window: millis_or(
                "OTEL_PROXY_FAILURE_WINDOW_MS",
                get("OTEL_PROXY_FAILURE_WINDOW_MS"),
                defaults.health.failure_window,
            )?,
            canary_interval: millis_or(
                "OTEL_PROXY_CANARY_INTERVAL_MS",
                get("OTEL_PROXY_CANARY_INTERVAL_MS"),
                defaults.health.canary_interval,
            )?,
        };

        let retry = RetryPolicy {
            max_attempts: parse_or(
                "OTEL_PROXY_MAX_ATTEMPTS",
                get("OTEL_PROXY_MAX_ATTEMPTS"),
                defaults.delivery.retry.max_attempts,
            )?,
            base_delay: millis_or(
                "OTEL_PROXY_RETRY_BASE_MS",
                get("OTEL_PROXY_RETRY_BASE_MS"),
                defaults.delivery.retry.base_delay,
            )?,
            max_delay: millis_or(
                "OTEL_PROXY_RETRY_MAX_MS",
                get("OTEL_PROXY_RETRY_MAX_MS"),
                defaults.delivery.retry.max_delay,
            )?,
            jitter_ratio: parse_or(
                "OTEL_PROXY_RETRY_JITTER",
                get("OTEL_PROXY_RETRY_JITTER"),
                defaults.delivery.retry.jitter_ratio,
            )?,
        };
        let delivery = WorkerPoolConfig {
            workers: parse_or(
                "OTEL_PROXY_WORKERS",
                get("OTEL_PROXY_WORKERS"),
                defaults.delivery.workers,
            )?,
            attempt_timeout: millis_or(
                "OTEL_PROXY_REQUEST_TIMEOUT_MS",
                get("OTEL_PROXY_REQUEST_TIMEOUT_MS"),
                defaults.delivery.attempt_timeout,
            )?,
            retry,
        };

        let shutdown_grace = millis_or(
            "OTEL_PROXY_SHUTDOWN_GRACE_MS",
            get("OTEL_PROXY_SHUTDOWN_GRACE_MS"),
            defaults.shutdown_grace,
        )?;

        let config = Config {
            environment,
            log_level,
            host,
            port,
            https_proxy,
            metrics_dir,
            cors_origins,
            admission,
            ingress_queue,
            dispatch_queue,
            batcher,
            routing,
            backends,
            health,
            delivery,
            shutdown_grace,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.admission.max_batch_bytes == 0 {
            return invalid("MAX_BODY_SIZE must be greater than 0");
        }
        if self.admission.rate_limit_requests == 0 || self.admission.rate_limit_window.is_zero() {
            return invalid("RATE_LIMIT_REQUESTS and RATE_LIMIT_WINDOW must be greater than 0");
        }
        if self.ingress_queue.capacity == 0 || self.dispatch_queue.capacity == 0 {
            return invalid("Queue capacities must be greater than 0");
        }
        if self.batcher.max_flush_bytes == 0
            || self.batcher.max_flush_records == 0
            || self.batcher.flush_interval.is_zero()
        {
            return invalid("Flush thresholds must be greater than 0");
        }
        if self.health.degraded_after == 0 || self.health.unavailable_after == 0 {
            return invalid(
                "OTEL_PROXY_DEGRADED_AFTER and OTEL_PROXY_UNAVAILABLE_AFTER must be at least 1",
            );
        }
        if self.delivery.workers == 0 {
            return invalid("OTEL_PROXY_WORKERS must be at least 1");
        }
        if self.delivery.retry.max_attempts == 0 {
            return invalid("OTEL_PROXY_MAX_ATTEMPTS must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.delivery.retry.jitter_ratio) {
            return invalid("OTEL_PROXY_RETRY_JITTER must be between 0 and 1");
        }
        if self.delivery.retry.base_delay > self.delivery.retry.max_delay {
            return invalid("OTEL_PROXY_RETRY_BASE_MS cannot exceed OTEL_PROXY_RETRY_MAX_MS");
        }
        if self.backends.is_empty() {
            return invalid("At least one backend must be configured");
        }
        for origin in &self.cors_origins {
            let is_url = origin.starts_with("http://") || origin.starts_with("https://");
            if !(origin == "*" || is_url) || HeaderValue::from_str(origin).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "CORS origin '{origin}' must be '*' or an http(s) origin"
                )));
            }
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate backend id '{}'",
                    backend.id
                )));
            }
            let endpoint = &backend.endpoint;
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "Backend '{}' endpoint must be an http(s) URL, got '{}'",
                    backend.id, backend.endpoint
                )));
            }
            if backend.weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "Backend '{}' weight must be at least 1",
                    backend.id
                )));
            }
        }

        Ok(())
    }
}

/// Accepts a JSON array (`["http://a", "http://b"]`) or a comma separated list.
fn parse_origins(value: &str) -> Result<Vec<String>, ConfigError> {
    let origins: Vec<String> = if value.trim_start().starts_with('[') {
        serde_json::from_str(value)
            .map_err(|e| ConfigError::Invalid(format!("Invalid CORS_ORIGINS '{value}': {e}")))?
    } else {
        value.split(',').map(str::to_string).collect()
    };
    Ok(origins
        .into_iter()
        .map(|origin| origin.trim().trim_end_matches('/').to_string())
        .filter(|origin| !origin.is_empty())
        .collect())
}

fn invalid<T>(message: &str) -> Result<T, ConfigError> {
    Err(ConfigError::Invalid(message.to_string()))
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(format!("Invalid value for {key}: '{value}'"))),
        None => Ok(default),
    }
}

fn millis_or(key: &str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(value) => parse_or::<u64>(key, Some(value), 0).map(Duration::from_millis),
        None => Ok(default),
    }
}

fn parse_overflow_policy(value: &str, timeout: Duration) -> Result<OverflowPolicy, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "drop_newest" => Ok(OverflowPolicy::DropNewest),
        "drop_oldest" => Ok(OverflowPolicy::DropOldest),
        "block" | "block_with_timeout" => Ok(OverflowPolicy::BlockWithTimeout(timeout)),
        _ => Err(ConfigError::Invalid(format!(
            "Unknown OTEL_PROXY_OVERFLOW_POLICY '{value}'. Must be one of: drop_newest, drop_oldest, block"
        ))),
    }
}

/// Parses `id=url[;weight=N][;source=faro|opentelemetry-sdk]` entries separated by commas.
pub fn parse_backends(value: &str) -> Result<Vec<BackendConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.split(';').map(str::trim);
            let (id, endpoint) = parts
                .next()
                .and_then(|target| target.split_once('='))
                .map(|(id, url)| (id.trim(), url.trim()))
                .filter(|(id, url)| !id.is_empty() && !url.is_empty())
                .ok_or_else(|| {
                    ConfigError::Invalid(format!("Backend entry '{entry}' must look like id=url"))
                })?;

            let mut backend = BackendConfig {
                id: id.to_string(),
                endpoint: endpoint.to_string(),
                weight: 1,
                source: DataSource::OpenTelemetrySdk,
            };
            for option in parts {
                match option.split_once('=') {
                    Some(("weight", weight)) => {
                        backend.weight = parse_or("backend weight", Some(weight.to_string()), 1)?;
                    }
                    Some(("source", source)) => {
                        backend.source = DataSource::from_header(source).ok_or_else(|| {
                            ConfigError::Invalid(format!("Unknown backend source '{source}'"))
                        })?;
                    }
                    _ => {
                        return Err(ConfigError::Invalid(format!(
                            "Unknown option '{option}' for backend '{id}'"
                        )))
                    }
                }
            }
            Ok(backend)
        })
        .collect()
}
