//! Configuration loader for the `sensorhub-ingest` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::{env, net::SocketAddr, time::Duration};

use crate::error::ConfigError;
use crate::scheduler::SamplingMode;

/// Default subscription pattern covering every hub and sensor.
pub const DEFAULT_TOPIC: &str = "topic/sensor/#";

/// Default SQLite location, relative to the working directory.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./db/node_data.db";

/// Parse an optional environment variable with a default value.
macro_rules! parse_env {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| ConfigError::Invalid {
                name: $var_name,
                reason: e.to_string(),
            })?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($lookup:expr, $var_name:expr) => {
        $lookup($var_name)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing($var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading. The sampling mode here is only the
/// startup value; the scheduler owns the live mode afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// SQLite connection string (storage location).
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// MQTT broker host name or address.
    pub broker_host: String,

    /// MQTT broker port.
    pub broker_port: u16,

    /// Client id presented to the broker.
    pub client_id: String,

    /// Wildcard subscription, e.g. `topic/sensor/#`.
    pub topic_pattern: String,

    /// MQTT keep-alive.
    pub keep_alive: Duration,

    /// Sampling mode in effect at startup.
    pub sampling_mode: SamplingMode,

    /// Interval used in testing mode.
    pub testing_interval_secs: u64,

    /// Interval used in normal mode.
    pub normal_interval_secs: u64,

    /// Plausible temperature range in °C, inclusive.
    pub temp_min_c: f64,
    pub temp_max_c: f64,

    /// Number of pipeline workers (shards).
    pub worker_count: usize,

    /// Capacity of the delivery queue between broker and pipeline.
    pub queue_capacity: usize,

    /// First reconnect delay and backoff cap.
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,

    /// Bind address of the read-only HTTP layer.
    pub http_addr: SocketAddr,
}

/// Load configuration from process environment variables with defaults.
///
/// Required:
/// - `MQTT_BROKER_HOST` – broker host name or address
///
/// Optional:
/// - `DATABASE_URL` – SQLite url (default: `sqlite://./db/node_data.db`)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `MQTT_BROKER_PORT` (default: 1883), `MQTT_CLIENT_ID`, `MQTT_TOPIC`
///   (default: `topic/sensor/#`), `MQTT_KEEP_ALIVE_SECS` (default: 30)
/// - `SAMPLING_MODE` – `testing` or `normal` (default: testing)
/// - `TESTING_INTERVAL_SECS` (default: 10), `NORMAL_INTERVAL_SECS` (default: 1800)
/// - `TEMP_MIN_C` (default: -40), `TEMP_MAX_C` (default: 85)
/// - `WORKER_COUNT` (default: 4), `QUEUE_CAPACITY` (default: 1024)
/// - `RECONNECT_BASE_SECS` (default: 1), `RECONNECT_MAX_SECS` (default: 60)
/// - `HTTP_ADDR` (default: `0.0.0.0:8080`)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config, ConfigError> {
    // ---
    load_from(|name| env::var(name).ok())
}

/// Same as [`load_from_env`] but reads values through `lookup`.
pub fn load_from<F>(lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // ---
    let broker_host = require_env!(lookup, "MQTT_BROKER_HOST");
    let broker_port = parse_env!(lookup, "MQTT_BROKER_PORT", u16, 1883);
    let client_id = lookup("MQTT_CLIENT_ID")
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| format!("sensorhub-ingest-{}", uuid::Uuid::new_v4().simple()));
    let topic_pattern = lookup("MQTT_TOPIC").unwrap_or_else(|| DEFAULT_TOPIC.to_string());
    let keep_alive_secs = parse_env!(lookup, "MQTT_KEEP_ALIVE_SECS", u64, 30);

    let db_url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
    let db_pool_max = parse_env!(lookup, "DB_POOL_MAX", u32, 5);

    let sampling_mode = parse_env!(lookup, "SAMPLING_MODE", SamplingMode, SamplingMode::Testing);
    let testing_interval_secs = parse_env!(lookup, "TESTING_INTERVAL_SECS", u64, 10);
    let normal_interval_secs = parse_env!(lookup, "NORMAL_INTERVAL_SECS", u64, 1800);

    let temp_min_c = parse_env!(lookup, "TEMP_MIN_C", f64, -40.0);
    let temp_max_c = parse_env!(lookup, "TEMP_MAX_C", f64, 85.0);

    let worker_count = parse_env!(lookup, "WORKER_COUNT", usize, 4);
    let queue_capacity = parse_env!(lookup, "QUEUE_CAPACITY", usize, 1024);

    let reconnect_base_secs = parse_env!(lookup, "RECONNECT_BASE_SECS", u64, 1);
    let reconnect_max_secs = parse_env!(lookup, "RECONNECT_MAX_SECS", u64, 60);

    let http_addr = parse_env!(
        lookup,
        "HTTP_ADDR",
        SocketAddr,
        SocketAddr::from(([0, 0, 0, 0], 8080))
    );

    let cfg = Config {
        db_url,
        db_pool_max,
        broker_host: broker_host.trim().to_string(),
        broker_port,
        client_id,
        topic_pattern,
        keep_alive: Duration::from_secs(keep_alive_secs),
        sampling_mode,
        testing_interval_secs,
        normal_interval_secs,
        temp_min_c,
        temp_max_c,
        worker_count,
        queue_capacity,
        reconnect_base: Duration::from_secs(reconnect_base_secs),
        reconnect_max: Duration::from_secs(reconnect_max_secs),
        http_addr,
    };
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    /// Topic prefix the parser expects, i.e. the pattern without `/#`.
    pub fn topic_prefix(&self) -> &str {
        // ---
        self.topic_pattern
            .strip_suffix("/#")
            .unwrap_or(&self.topic_pattern)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // ---
        let invalid = |name, reason: &str| ConfigError::Invalid {
            name,
            reason: reason.to_string(),
        };

        if self.broker_host.chars().any(char::is_whitespace) {
            return Err(invalid("MQTT_BROKER_HOST", "must not contain whitespace"));
        }
        if self.broker_port == 0 {
            return Err(invalid("MQTT_BROKER_PORT", "must be non-zero"));
        }
        if self.keep_alive < Duration::from_secs(5) {
            return Err(invalid("MQTT_KEEP_ALIVE_SECS", "must be at least 5"));
        }
        if !self.topic_pattern.ends_with("/#") || self.topic_prefix().is_empty() {
            return Err(invalid("MQTT_TOPIC", "must look like '<prefix>/#'"));
        }
        if self.topic_prefix().contains(['#', '+']) {
            return Err(invalid("MQTT_TOPIC", "prefix must not contain wildcards"));
        }
        if !self.db_url.starts_with("sqlite:") {
            return Err(invalid("DATABASE_URL", "only sqlite: urls are supported"));
        }
        if self.db_pool_max == 0 {
            return Err(invalid("DB_POOL_MAX", "must be at least 1"));
        }
        if self.testing_interval_secs == 0 {
            return Err(invalid("TESTING_INTERVAL_SECS", "must be non-zero"));
        }
        if self.normal_interval_secs == 0 {
            return Err(invalid("NORMAL_INTERVAL_SECS", "must be non-zero"));
        }
        if !(self.temp_min_c.is_finite() && self.temp_max_c.is_finite())
            || self.temp_min_c >= self.temp_max_c
        {
            return Err(invalid("TEMP_MIN_C", "must be finite and below TEMP_MAX_C"));
        }
        if self.worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("QUEUE_CAPACITY", "must be at least 1"));
        }
        if self.reconnect_base.is_zero() || self.reconnect_base > self.reconnect_max {
            return Err(invalid(
                "RECONNECT_BASE_SECS",
                "must be non-zero and not above RECONNECT_MAX_SECS",
            ));
        }
        Ok(())
    }

    /// Log the loaded configuration for debugging purposes.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL          : {}", self.db_url);
        tracing::info!("  DB_POOL_MAX           : {}", self.db_pool_max);
        tracing::info!(
            "  MQTT broker           : {}:{}",
            self.broker_host,
            self.broker_port
        );
        tracing::info!("  MQTT_CLIENT_ID        : {}", self.client_id);
        tracing::info!("  MQTT_TOPIC            : {}", self.topic_pattern);
        tracing::info!("  SAMPLING_MODE         : {}", self.sampling_mode);
        tracing::info!(
            "  intervals (test/norm) : {}s / {}s",
            self.testing_interval_secs,
            self.normal_interval_secs
        );
        tracing::info!(
            "  temperature bounds    : {}..={} °C",
            self.temp_min_c,
            self.temp_max_c
        );
        tracing::info!(
            "  workers / queue       : {} / {}",
            self.worker_count,
            self.queue_capacity
        );
        tracing::info!(
            "  reconnect backoff     : {:?} .. {:?}",
            self.reconnect_base,
            self.reconnect_max
        );
        tracing::info!("  HTTP_ADDR             : {}", self.http_addr);
    }
}
