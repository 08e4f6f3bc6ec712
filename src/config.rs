//! Configuration for the hooky daemon.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hooky_core::BackoffPolicy;
use hooky_scheduler::{ClientConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "hooky.toml";
const ENV_PREFIX: &str = "HOOKY_";

/// Daemon configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `HOOKY_` (e.g. `HOOKY_DATABASE_URL`)
/// 2. Configuration file (`hooky.toml`)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of pooled database connections.
    pub database_max_connections: u32,

    // Scheduler
    /// Reservation workers (concurrent store queries).
    pub max_store_queries: usize,
    /// Execution workers (concurrent HTTP requests).
    pub max_http_requests: usize,
    /// Tasks claimed per reservation.
    pub reserve_batch_size: usize,
    /// Handoff queue capacity. Defaults to `max_http_requests`.
    pub handoff_capacity: Option<usize>,
    /// Idle wait between reservation polls.
    pub poll_interval_ms: u64,
    /// Lease length granted on reserve and touch.
    pub lease_duration_secs: u64,
    /// Heartbeat period.
    pub touch_interval_secs: u64,
    /// Age after which attempts are purged.
    pub attempt_retention_hours: u64,
    /// Retention loop period.
    pub retention_interval_secs: u64,
    /// Grace period for in-flight deliveries on shutdown.
    pub shutdown_timeout_secs: u64,

    // Delivery
    /// Per-request HTTP timeout.
    pub http_timeout_secs: u64,
    /// Response body bytes kept on each attempt.
    pub response_excerpt_bytes: usize,

    // Default backoff
    /// First retry delay.
    pub retry_min_delay_ms: u64,
    /// Retry delay cap.
    pub retry_max_delay_ms: u64,
    /// Growth factor between retries.
    pub retry_factor: f64,

    // Logging
    /// Log filter, used when `RUST_LOG` is unset.
    pub rust_log: String,
}

impl Config {
    /// Loads defaults, then `hooky.toml`, then `HOOKY_*` environment
    /// variables.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Scheduler settings.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            reservation_workers: self.max_store_queries,
            execution_workers: self.max_http_requests,
            batch_size: self.reserve_batch_size,
            handoff_capacity: self.handoff_capacity.unwrap_or(self.max_http_requests),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            touch_interval: Duration::from_secs(self.touch_interval_secs),
            attempt_retention: self.attempt_retention().unwrap_or(Duration::MAX),
            retention_interval: Duration::from_secs(self.retention_interval_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            default_backoff: Arc::new(self.default_backoff()),
        }
    }

    /// Retention age, or `None` if the configured hours overflow.
    fn attempt_retention(&self) -> Option<Duration> {
        self.attempt_retention_hours.checked_mul(3600).map(Duration::from_secs)
    }

    /// HTTP dispatcher settings.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            response_excerpt_bytes: self.response_excerpt_bytes,
            ..ClientConfig::default()
        }
    }

    /// Backoff applied to tasks without their own policy.
    pub fn default_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::Exponential {
            min_ms: self.retry_min_delay_ms,
            max_ms: self.retry_max_delay_ms,
            factor: self.retry_factor,
        }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                // A colon right after the scheme belongs to `://`, not a password.
                if !self.database_url[colon_pos..].starts_with("://") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.max_store_queries == 0 {
            anyhow::bail!("max_store_queries must be greater than 0");
        }

        if self.max_http_requests == 0 {
            anyhow::bail!("max_http_requests must be greater than 0");
        }

        if self.reserve_batch_size == 0 {
            anyhow::bail!("reserve_batch_size must be greater than 0");
        }

        if self.handoff_capacity == Some(0) {
            anyhow::bail!("handoff_capacity must be greater than 0");
        }

        if self.lease_duration_secs <= self.touch_interval_secs {
            anyhow::bail!("lease_duration_secs must exceed touch_interval_secs");
        }

        if self.http_timeout_secs == 0 {
            anyhow::bail!("http_timeout_secs must be greater than 0");
        }

        if self.http_timeout_secs >= self.lease_duration_secs - self.touch_interval_secs {
            anyhow::bail!("http_timeout_secs must be below lease_duration_secs - touch_interval_secs");
        }

        if self.attempt_retention().is_none() {
            anyhow::bail!("attempt_retention_hours is too large");
        }

        self.default_backoff().validate().context("invalid default retry backoff")?;

        self.to_scheduler_config().validate().context("invalid scheduler settings")?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/hooky".to_string(),
            database_max_connections: 10,
            max_store_queries: hooky_scheduler::DEFAULT_RESERVATION_WORKERS,
            max_http_requests: hooky_scheduler::DEFAULT_EXECUTION_WORKERS,
            reserve_batch_size: hooky_scheduler::DEFAULT_BATCH_SIZE,
            handoff_capacity: None,
            poll_interval_ms: 1_000,
            lease_duration_secs: 60,
            touch_interval_secs: 5,
            attempt_retention_hours: 168,
            retention_interval_secs: 600,
            shutdown_timeout_secs: 30,
            http_timeout_secs: 30,
            response_excerpt_bytes: 1_024,
            retry_min_delay_ms: 1_000,
            retry_max_delay_ms: 3_600_000,
            retry_factor: 2.0,
            rust_log: "info,hooky=debug".to_string(),
        }
    }
}
