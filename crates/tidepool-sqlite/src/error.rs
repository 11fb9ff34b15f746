//! Runtime errors for the SQLite pool.
//!
//! Every terminal failure that reaches a caller carries enough context
//! (connection id, access class, attempts, elapsed time) to diagnose it
//! from the error text alone. [`DbError::class`] maps an error onto the
//! [`ErrorClass`] used to choose between retry, repair and re-raise.

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::ffi::ErrorCode;
use tidepool_core::{AccessMode, ConfigError, ConnectionId, ErrorClass};

/// Boxed error returned by caller-supplied units of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the pool, executor and helpers.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Error reported by SQLite while running a statement.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Lock contention persisted through the whole retry budget.
    #[error(
        "Lock contention on {access} connection {} persisted after {attempts} attempts ({elapsed:?}): {source}",
        display_connection(.connection_id)
    )]
    Contention {
        connection_id: Option<ConnectionId>,
        access: AccessMode,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: rusqlite::Error,
    },

    /// No idle connection, no capacity and no reclamation candidate.
    #[error("Connection pool exhausted: {in_use} of {max_size} connections in use, none reclaimable")]
    PoolExhausted { max_size: usize, in_use: usize },

    #[error("Connection pool is closed")]
    PoolClosed,

    /// Opening or configuring a new handle failed.
    #[error("Failed to open {access} connection to {}: {source}", .path.display())]
    ConnectionFailed {
        path: PathBuf,
        access: AccessMode,
        #[source]
        source: rusqlite::Error,
    },

    /// The pool reclaimed this connection while the caller still held it.
    #[error("Connection {connection_id} was reclaimed by the pool; the operation's result was discarded")]
    ConnectionReclaimed { connection_id: ConnectionId },

    #[error("Operation cancelled after {attempts} attempts ({elapsed:?})")]
    Cancelled { attempts: u32, elapsed: Duration },

    #[error("Operation timed out after {attempts} attempts ({elapsed:?})")]
    TimedOut { attempts: u32, elapsed: Duration },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Pool state lock poisoned: {0}")]
    LockPoisoned(String),

    /// A blocking task on the async runtime panicked or was aborted.
    #[error("Blocking task failed: {0}")]
    TaskJoin(String),

    /// Error raised by a caller-supplied unit of work.
    #[error("{0}")]
    Callback(#[source] BoxError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn display_connection(id: &Option<ConnectionId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "<not acquired>".to_string(),
    }
}

impl DbError {
    /// Wrap an arbitrary caller error.
    pub fn callback<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        DbError::Callback(error.into())
    }

    /// Classification used by the executor and the pool's creation path.
    pub fn class(&self) -> ErrorClass {
        match self {
            DbError::Sqlite(err) | DbError::ConnectionFailed { source: err, .. } => classify(err),
            DbError::Contention { .. } => ErrorClass::Contention,
            _ => ErrorClass::Other,
        }
    }

    pub fn is_contention(&self) -> bool {
        self.class() == ErrorClass::Contention
    }

    /// The underlying SQLite error, if any.
    pub fn sqlite_error(&self) -> Option<&rusqlite::Error> {
        match self {
            DbError::Sqlite(err)
            | DbError::ConnectionFailed { source: err, .. }
            | DbError::Contention { source: err, .. } => Some(err),
            _ => None,
        }
    }
}

/// Classify a raw SQLite error by its primary result code.
pub fn classify(err: &rusqlite::Error) -> ErrorClass {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => ErrorClass::Contention,
            ErrorCode::ReadOnly => ErrorClass::ReadOnly,
            ErrorCode::CannotOpen
            | ErrorCode::PermissionDenied
            | ErrorCode::AuthorizationForStatementDenied => ErrorClass::Permission,
            _ => ErrorClass::Other,
        },
        _ => ErrorClass::Other,
    }
}

pub(crate) fn lock_poisoned<T>(err: std::sync::PoisonError<T>) -> DbError {
    DbError::LockPoisoned(err.to_string())
}
