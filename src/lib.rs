//! # Tidepool
//!
//! Contention-aware connection pooling for a single WAL-mode SQLite file.
//!
//! This facade re-exports the two workspace crates:
//!
//! - [`tidepool_core`]: configuration, retry policy, identifiers and
//!   health/statistics types
//! - [`tidepool_sqlite`]: the rusqlite-backed pool, executor, transaction
//!   wrapper, health checker, recovery helpers and diagnostics

pub use tidepool_core;
pub use tidepool_sqlite;

pub use tidepool_sqlite::*;
