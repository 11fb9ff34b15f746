//! Transaction wrapper built on the executor
//!
//! A transaction always runs on a write connection. A contended transaction
//! is replayed from `BEGIN` on a fresh acquisition, so callbacks must only
//! touch the store; callers with external side effects use
//! [`TransactionOptions::non_idempotent`] to get a single attempt.

use std::time::Duration;

use rusqlite::Connection;
use tidepool_core::{AccessMode, CancellationToken, ConnectionId, RetryMode};

use crate::connection::PooledConnection;
use crate::error::DbError;
use crate::executor::{Executor, OperationOutcome, RunOptions};
use crate::pool::SqlitePool;

/// Locking mode of the `BEGIN` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionBehavior {
    Deferred,
    /// Takes the write lock up front, so contention surfaces at `BEGIN`
    /// rather than halfway through the callback.
    #[default]
    Immediate,
    Exclusive,
}

impl TransactionBehavior {
    fn begin_sql(self) -> &'static str {
        match self {
            TransactionBehavior::Deferred => "BEGIN DEFERRED",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub behavior: TransactionBehavior,
    pub retry: RetryMode,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl TransactionOptions {
    /// Single attempt; the callback is never replayed.
    pub fn non_idempotent() -> Self {
        Self {
            retry: RetryMode::Disabled,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn behavior(mut self, behavior: TransactionBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn run_options(&self) -> RunOptions {
        RunOptions {
            access: AccessMode::ReadWrite,
            retry: self.retry,
            timeout: self.timeout,
            cancel: self.cancel.clone(),
        }
    }
}

impl Executor {
    /// Run `f` between `BEGIN` and `COMMIT` on a write connection.
    ///
    /// Any error from `f` rolls back and is returned unchanged; a failing
    /// rollback is logged and never replaces it.
    pub fn transaction<T, F>(
        &self,
        options: TransactionOptions,
        mut f: F,
    ) -> Result<OperationOutcome<T>, DbError>
    where
        F: FnMut(&Connection) -> Result<T, DbError>,
    {
        let behavior = options.behavior;
        self.execute(&options.run_options(), "transaction", |pooled| {
            run_in_transaction(pooled, behavior, &mut f)
        })
    }
}

impl SqlitePool {
    /// Run `f` in an immediate transaction with the pool's retry policy.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnMut(&Connection) -> Result<T, DbError>,
    {
        Executor::new(self.clone())
            .transaction(TransactionOptions::default(), f)
            .map(OperationOutcome::into_value)
    }
}

fn run_in_transaction<T, F>(
    pooled: &PooledConnection,
    behavior: TransactionBehavior,
    f: &mut F,
) -> Result<T, DbError>
where
    F: FnMut(&Connection) -> Result<T, DbError>,
{
    let conn = pooled.connection();
    conn.execute_batch(behavior.begin_sql())?;
    let _unwind = UnwindRollback {
        conn,
        id: pooled.id(),
    };

    match f(conn) {
        Ok(value) => {
            if pooled.is_poisoned() {
                rollback(conn, pooled.id());
                return Err(DbError::ConnectionReclaimed {
                    connection_id: pooled.id(),
                });
            }
            if let Err(e) = conn.execute_batch("COMMIT") {
                rollback(conn, pooled.id());
                return Err(e.into());
            }
            Ok(value)
        }
        Err(err) => {
            rollback(conn, pooled.id());
            Err(err)
        }
    }
}

/// Rolls the transaction back when the callback panics.
struct UnwindRollback<'a> {
    conn: &'a Connection,
    id: ConnectionId,
}

impl Drop for UnwindRollback<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(connection_id = %self.id, "Transaction callback panicked, rolling back");
            rollback(self.conn, self.id);
        }
    }
}

fn rollback(conn: &Connection, id: ConnectionId) {
    // The callback may already have ended the transaction itself.
    if conn.is_autocommit() {
        return;
    }
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(connection_id = %id, error = %e, "Rollback failed");
    }
}
