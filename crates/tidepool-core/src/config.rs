//! # Pool Configuration
//!
//! A single immutable [`PoolConfig`] is built once at startup and handed to
//! the pool constructor. Values come from [`PoolConfigBuilder`] defaults,
//! fluent setters, or the process environment.
//!
//! ## Environment Variables
//!
//! Durations accept humantime strings (`250ms`, `5s`, `2m`) or a bare integer
//! interpreted as milliseconds.
//!
//! - `TIDEPOOL_POOL_SIZE` - Maximum connections (default: 10, range 1-64)
//! - `TIDEPOOL_INITIAL_READ_ONLY` - Read-only connections opened at startup (default: 1)
//! - `TIDEPOOL_CONNECTION_TIMEOUT` - Budget for opening one connection (default: 5s)
//! - `TIDEPOOL_BUSY_TIMEOUT` - SQLite busy handler wait per statement (default: 5s)
//! - `TIDEPOOL_LOCK_RETRY_COUNT` - Total attempts for a contended operation (default: 3)
//! - `TIDEPOOL_LOCK_RETRY_BASE` - Base delay of the exponential backoff (default: 100ms)
//! - `TIDEPOOL_MAINTENANCE_INTERVAL` - Period of the idle sweep (default: 60s)
//! - `TIDEPOOL_MAX_IDLE_AGE` - Idle time after which a connection is closed (default: 5m)
//! - `TIDEPOOL_STALE_THRESHOLD` - Hold time after which a connection may be reclaimed (default: 10s)
//! - `TIDEPOOL_SLOW_OPERATION_THRESHOLD` - Operations slower than this are logged (default: 1s)

use std::time::Duration;

use crate::database::PoolSize;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

pub const ENV_POOL_SIZE: &str = "TIDEPOOL_POOL_SIZE";
pub const ENV_INITIAL_READ_ONLY: &str = "TIDEPOOL_INITIAL_READ_ONLY";
pub const ENV_CONNECTION_TIMEOUT: &str = "TIDEPOOL_CONNECTION_TIMEOUT";
pub const ENV_BUSY_TIMEOUT: &str = "TIDEPOOL_BUSY_TIMEOUT";
pub const ENV_LOCK_RETRY_COUNT: &str = "TIDEPOOL_LOCK_RETRY_COUNT";
pub const ENV_LOCK_RETRY_BASE: &str = "TIDEPOOL_LOCK_RETRY_BASE";
pub const ENV_MAINTENANCE_INTERVAL: &str = "TIDEPOOL_MAINTENANCE_INTERVAL";
pub const ENV_MAX_IDLE_AGE: &str = "TIDEPOOL_MAX_IDLE_AGE";
pub const ENV_STALE_THRESHOLD: &str = "TIDEPOOL_STALE_THRESHOLD";
pub const ENV_SLOW_OPERATION_THRESHOLD: &str = "TIDEPOOL_SLOW_OPERATION_THRESHOLD";

/// Validated pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on open connections
    pub max_size: PoolSize,
    /// Read-only connections opened eagerly next to the first write connection
    pub initial_read_only: usize,
    /// How long opening a single connection may keep retrying on a locked file
    pub connection_timeout: Duration,
    /// SQLite `busy_timeout` applied to every connection
    pub busy_timeout: Duration,
    /// Retry budget and backoff base for contended operations
    pub retry: RetryPolicy,
    /// Period of the background idle sweep
    pub maintenance_interval: Duration,
    /// Idle connections older than this are closed by maintenance
    pub max_idle_age: Duration,
    /// In-use connections held longer than this are reclamation candidates
    pub stale_threshold: Duration,
    /// Operations slower than this are logged as slow
    pub slow_operation_threshold: Duration,
}

impl PoolConfig {
    /// Build from the process environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        PoolConfigBuilder::from_env()?.build()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfigBuilder::default().into_config()
    }
}

/// Builder for [`PoolConfig`] with environment variable support
#[derive(Debug, Clone)]
pub struct PoolConfigBuilder {
    max_size: usize,
    initial_read_only: usize,
    connection_timeout: Duration,
    busy_timeout: Duration,
    lock_retry_count: u32,
    lock_retry_base: Duration,
    maintenance_interval: Duration,
    max_idle_age: Duration,
    stale_threshold: Duration,
    slow_operation_threshold: Duration,
}

impl Default for PoolConfigBuilder {
    fn default() -> Self {
        Self {
            max_size: PoolSize::DEFAULT,
            initial_read_only: 1,
            connection_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
            lock_retry_count: 3,
            lock_retry_base: Duration::from_millis(100),
            maintenance_interval: Duration::from_secs(60),
            max_idle_age: Duration::from_secs(300),
            stale_threshold: Duration::from_secs(10),
            slow_operation_threshold: Duration::from_secs(1),
        }
    }
}

impl PoolConfigBuilder {
    /// Create a new builder with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvVar` if any variable is present but
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// `from_env` is this function over `std::env::var`; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::default();

        if let Some(size) = parse_usize(&lookup, ENV_POOL_SIZE)? {
            builder = builder.max_size(size);
        }
        if let Some(count) = parse_usize(&lookup, ENV_INITIAL_READ_ONLY)? {
            builder = builder.initial_read_only(count);
        }
        if let Some(timeout) = parse_duration(&lookup, ENV_CONNECTION_TIMEOUT)? {
            builder = builder.connection_timeout(timeout);
        }
        if let Some(timeout) = parse_duration(&lookup, ENV_BUSY_TIMEOUT)? {
            builder = builder.busy_timeout(timeout);
        }
        if let Some(count) = parse_u32(&lookup, ENV_LOCK_RETRY_COUNT)? {
            builder = builder.lock_retry_count(count);
        }
        if let Some(base) = parse_duration(&lookup, ENV_LOCK_RETRY_BASE)? {
            builder = builder.lock_retry_base(base);
        }
        if let Some(interval) = parse_duration(&lookup, ENV_MAINTENANCE_INTERVAL)? {
            builder = builder.maintenance_interval(interval);
        }
        if let Some(age) = parse_duration(&lookup, ENV_MAX_IDLE_AGE)? {
            builder = builder.max_idle_age(age);
        }
        if let Some(threshold) = parse_duration(&lookup, ENV_STALE_THRESHOLD)? {
            builder = builder.stale_threshold(threshold);
        }
        if let Some(threshold) = parse_duration(&lookup, ENV_SLOW_OPERATION_THRESHOLD)? {
            builder = builder.slow_operation_threshold(threshold);
        }

        Ok(builder)
    }

    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    #[must_use]
    pub fn initial_read_only(mut self, count: usize) -> Self {
        self.initial_read_only = count;
        self
    }

    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Total attempts (first try included) for a contended operation
    #[must_use]
    pub fn lock_retry_count(mut self, count: u32) -> Self {
        self.lock_retry_count = count;
        self
    }

    #[must_use]
    pub fn lock_retry_base(mut self, base: Duration) -> Self {
        self.lock_retry_base = base;
        self
    }

    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    #[must_use]
    pub fn max_idle_age(mut self, age: Duration) -> Self {
        self.max_idle_age = age;
        self
    }

    #[must_use]
    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    #[must_use]
    pub fn slow_operation_threshold(mut self, threshold: Duration) -> Self {
        self.slow_operation_threshold = threshold;
        self
    }

    /// Validate configuration and build [`PoolConfig`]
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the pool size is out of range or the values
    /// are inconsistent with each other.
    pub fn build(self) -> Result<PoolConfig, ConfigError> {
        let max_size = PoolSize::new(self.max_size)?;

        if self.initial_read_only >= max_size.get() {
            return Err(ConfigError::Validation(format!(
                "initial_read_only ({}) must leave room for a write connection in a pool of {}",
                self.initial_read_only, max_size
            )));
        }
        if self.lock_retry_count == 0 {
            return Err(ConfigError::Validation(
                "lock_retry_count must be at least 1".to_string(),
            ));
        }
        if self.lock_retry_base.is_zero() {
            return Err(ConfigError::Validation(
                "lock_retry_base must be greater than 0".to_string(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "connection_timeout must be greater than 0".to_string(),
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::Validation(
                "maintenance_interval must be greater than 0".to_string(),
            ));
        }

        Ok(self.into_config_with(max_size))
    }

    fn into_config(self) -> PoolConfig {
        self.into_config_with(PoolSize::default())
    }

    fn into_config_with(self, max_size: PoolSize) -> PoolConfig {
        PoolConfig {
            max_size,
            initial_read_only: self.initial_read_only,
            connection_timeout: self.connection_timeout,
            busy_timeout: self.busy_timeout,
            retry: RetryPolicy::new(self.lock_retry_count, self.lock_retry_base),
            maintenance_interval: self.maintenance_interval,
            max_idle_age: self.max_idle_age,
            stale_threshold: self.stale_threshold,
            slow_operation_threshold: self.slow_operation_threshold,
        }
    }
}

// Environment value parsing

fn parse_usize<F>(lookup: &F, key: &str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| ConfigError::invalid_env(key, format!("invalid usize value '{val}': {e}"))),
        None => Ok(None),
    }
}

fn parse_u32<F>(lookup: &F, key: &str) -> Result<Option<u32>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| ConfigError::invalid_env(key, format!("invalid u32 value '{val}': {e}"))),
        None => Ok(None),
    }
}

fn parse_duration<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(val) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = val.trim();

    if let Ok(millis) = trimmed.parse::<u64>() {
        return Ok(Some(Duration::from_millis(millis)));
    }

    humantime::parse_duration(trimmed)
        .map(Some)
        .map_err(|e| ConfigError::invalid_env(key, format!("invalid duration '{val}': {e}")))
}
