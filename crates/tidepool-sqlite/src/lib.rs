//! # Tidepool SQLite
//!
//! A contention-aware connection pool over one WAL-mode SQLite file,
//! built on `rusqlite`.
//!
//! ## Components
//!
//! - **[SqlitePool]**: bounded set of read-only and write connections with
//!   reuse, on-demand creation, stale-connection reclamation and idle sweeps
//! - **[Executor]**: retries units of work on `SQLITE_BUSY`/`SQLITE_LOCKED`
//!   with jittered exponential backoff
//! - **[HealthChecker]**: ordered probes against a single connection
//! - **[StoreRecovery]**: permission repair, read-only store recovery, rebuild and reset
//! - **[diagnostics]**: file/table snapshot and WAL checkpointing
//! - **[AsyncPool]**: tokio facade (requires the `async` feature, on by default)
//!
//! ## Example
//!
//! ```rust,no_run
//! use tidepool_sqlite::{AccessMode, PoolConfig, SqlitePool};
//!
//! # fn main() -> Result<(), tidepool_sqlite::DbError> {
//! let pool = SqlitePool::open("appdata.db", PoolConfig::default())?;
//!
//! pool.with_transaction(|conn| {
//!     conn.execute_batch("CREATE TABLE IF NOT EXISTS notes (body TEXT)")?;
//!     conn.execute("INSERT INTO notes (body) VALUES (?1)", ["hello"])?;
//!     Ok(())
//! })?;
//!
//! let count: i64 = pool.with_connection(AccessMode::ReadOnly, |conn| {
//!     Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?)
//! })?;
//! # let _ = count;
//! # Ok(())
//! # }
//! ```

pub use tidepool_core::{
    AccessMode, AttemptState, CancellationToken, ConfigError, ConnectionId, ConnectionInfo,
    ErrorClass, HealthCheckOptions, HealthCheckResult, PoolConfig, PoolConfigBuilder, PoolSize,
    PoolStatistics, Probe, ProbeTiming, RetryMode, RetryPolicy,
};

mod connection;
pub use connection::PooledConnection;

pub mod diagnostics;
pub use diagnostics::{CheckpointMode, CheckpointReport, DatabaseInfo, TableInfo};

mod error;
pub use error::{BoxError, DbError, classify};

mod executor;
pub use executor::{Executor, OperationOutcome, RunOptions};

mod health;
pub use health::HealthChecker;

mod maintenance;
pub use maintenance::{CloseReport, MaintenanceReport, MaintenanceWorker};

mod pool;
pub use pool::SqlitePool;

mod recovery;
pub use recovery::{BackupPaths, RepairReport, RepairStep, ResetReport, StoreRecovery};

mod transaction;
pub use transaction::{TransactionBehavior, TransactionOptions};

#[cfg(feature = "async")]
mod async_pool;
#[cfg(feature = "async")]
pub use async_pool::AsyncPool;
