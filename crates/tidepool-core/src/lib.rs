//! # Tidepool Core
//!
//! Storage-agnostic building blocks for the Tidepool connection pool.
//! This crate holds everything that does not need a SQLite handle: the pool
//! configuration and its environment loader, connection identity, the
//! contention retry policy, cancellation, and the health/statistics types
//! consumed by monitoring tools.

pub mod cancel;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod identifiers;
pub mod retry;

pub use cancel::CancellationToken;
pub use config::{PoolConfig, PoolConfigBuilder};
pub use database::PoolSize;
pub use error::ConfigError;
pub use health::{
    ConnectionInfo, HealthCheckOptions, HealthCheckResult, PoolStatistics, Probe, ProbeTiming,
};
pub use identifiers::{AccessMode, ConnectionId};
pub use retry::{AttemptState, ErrorClass, RetryMode, RetryPolicy};
