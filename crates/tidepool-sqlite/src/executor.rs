//! Contention-aware operation executor
//!
//! Runs a unit of work against a pooled connection. Lock contention
//! (SQLITE_BUSY / SQLITE_LOCKED) is retried with jittered exponential
//! backoff on a fresh acquisition; every other error is re-raised as is.
//! The connection is released on every exit path before the executor
//! sleeps or returns.

use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use tidepool_core::{AccessMode, AttemptState, CancellationToken, ConnectionId, RetryMode, RetryPolicy};

use crate::connection::PooledConnection;
use crate::error::DbError;
use crate::pool::SqlitePool;

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub access: AccessMode,
    pub retry: RetryMode,
    /// Bound on total latency, backoff included.
    pub timeout: Option<Duration>,
    /// Checked before each attempt; interrupts backoff waits.
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new(access: AccessMode) -> Self {
        Self {
            access,
            retry: RetryMode::Retry,
            timeout: None,
            cancel: None,
        }
    }

    pub fn read() -> Self {
        Self::new(AccessMode::ReadOnly)
    }

    pub fn write() -> Self {
        Self::new(AccessMode::ReadWrite)
    }

    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.retry = RetryMode::Disabled;
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
}

/// Result of a successful run with its retry accounting.
#[derive(Debug, Clone)]
pub struct OperationOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub retries: u32,
    pub elapsed: Duration,
    /// Connection that served the successful attempt.
    pub connection_id: ConnectionId,
}

impl<T> OperationOutcome<T> {
    pub fn into_value(self) -> T {
        self.value
    }
}

/// Retry wrapper over [`SqlitePool::acquire`].
#[derive(Debug, Clone)]
pub struct Executor {
    pool: SqlitePool,
    policy: RetryPolicy,
    slow_threshold: Duration,
}

impl Executor {
    /// Executor using the pool's configured retry policy.
    pub fn new(pool: SqlitePool) -> Self {
        let policy = pool.config().retry;
        let slow_threshold = pool.config().slow_operation_threshold;
        Self {
            pool,
            policy,
            slow_threshold,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `f` on a connection of the requested class, retrying on contention.
    ///
    /// An error that is not contention is returned unchanged, without a
    /// retry; the connection id, error class and elapsed time only go to the
    /// log. Exhausting the retry budget returns [`DbError::Contention`],
    /// which carries that context.
    pub fn run<T, F>(&self, options: RunOptions, mut f: F) -> Result<OperationOutcome<T>, DbError>
    where
        F: FnMut(&Connection) -> Result<T, DbError>,
    {
        self.execute(&options, "operation", |conn| f(conn.connection()))
    }

    pub(crate) fn execute<T, F>(
        &self,
        options: &RunOptions,
        label: &'static str,
        mut f: F,
    ) -> Result<OperationOutcome<T>, DbError>
    where
        F: FnMut(&PooledConnection) -> Result<T, DbError>,
    {
        let policy = match options.retry {
            RetryMode::Retry => self.policy,
            RetryMode::Disabled => RetryPolicy::no_retry(),
        };
        let mut state = AttemptState::start();
        let mut last_connection = None;

        loop {
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                tracing::info!(kind = label, attempts = state.attempts(), "Operation cancelled");
                return Err(DbError::Cancelled {
                    attempts: state.attempts(),
                    elapsed: state.elapsed(),
                });
            }
            if options.timeout.is_some_and(|t| state.elapsed() >= t) {
                return Err(self.timed_out(label, &state));
            }

            let attempt = state.begin_attempt();
            let result = match self.pool.acquire(options.access) {
                Ok(conn) => {
                    let connection_id = conn.id();
                    last_connection = Some(connection_id);
                    let result = f(&conn);
                    let poisoned = conn.is_poisoned();
                    drop(conn);

                    if poisoned {
                        tracing::error!(
                            kind = label,
                            connection_id = %connection_id,
                            attempt,
                            "Connection was reclaimed while the operation ran"
                        );
                        return Err(DbError::ConnectionReclaimed { connection_id });
                    }
                    result.map(|value| (value, connection_id))
                }
                Err(e) => Err(e),
            };

            let err = match result {
                Ok((value, connection_id)) => {
                    let outcome = OperationOutcome {
                        value,
                        attempts: state.attempts(),
                        retries: state.retries(),
                        elapsed: state.elapsed(),
                        connection_id,
                    };
                    self.log_success(label, options.access, &outcome);
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            let class = err.class();
            state.record_failure(class);

            if !class.is_retryable() {
                tracing::warn!(
                    kind = label,
                    access = %options.access,
                    connection_id = ?last_connection.map(|id| id.to_string()),
                    attempt,
                    error_class = %class,
                    elapsed_ms = state.elapsed().as_millis() as u64,
                    error = %err,
                    "Operation failed"
                );
                return Err(err);
            }

            if !policy.should_retry(attempt) {
                tracing::error!(
                    kind = label,
                    access = %options.access,
                    connection_id = ?last_connection.map(|id| id.to_string()),
                    attempts = attempt,
                    elapsed_ms = state.elapsed().as_millis() as u64,
                    error = %err,
                    "Lock contention persisted through retry budget"
                );
                return Err(exhausted(err, last_connection, options.access, &state));
            }

            let delay = policy.jittered_delay(attempt);
            if options.timeout.is_some_and(|t| state.elapsed() + delay > t) {
                return Err(self.timed_out(label, &state));
            }

            tracing::debug!(
                kind = label,
                access = %options.access,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Lock contention, backing off"
            );

            let cancelled = match &options.cancel {
                Some(token) => token.wait_timeout(delay),
                None => {
                    thread::sleep(delay);
                    false
                }
            };
            if cancelled {
                tracing::info!(kind = label, attempts = state.attempts(), "Operation cancelled during backoff");
                return Err(DbError::Cancelled {
                    attempts: state.attempts(),
                    elapsed: state.elapsed(),
                });
            }
        }
    }

    fn timed_out(&self, label: &'static str, state: &AttemptState) -> DbError {
        tracing::warn!(
            kind = label,
            attempts = state.attempts(),
            elapsed_ms = state.elapsed().as_millis() as u64,
            "Operation timed out"
        );
        DbError::TimedOut {
            attempts: state.attempts(),
            elapsed: state.elapsed(),
        }
    }

    fn log_success<T>(&self, label: &'static str, access: AccessMode, outcome: &OperationOutcome<T>) {
        if outcome.elapsed > self.slow_threshold {
            tracing::warn!(
                kind = label,
                access = %access,
                connection_id = %outcome.connection_id,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                retries = outcome.retries,
                "Slow database operation"
            );
        } else if outcome.retries > 0 {
            tracing::info!(
                kind = label,
                access = %access,
                connection_id = %outcome.connection_id,
                retries = outcome.retries,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                "Operation succeeded after contention retries"
            );
        }
    }
}

/// Turn the last contention failure into the terminal error.
fn exhausted(
    err: DbError,
    connection_id: Option<ConnectionId>,
    access: AccessMode,
    state: &AttemptState,
) -> DbError {
    let source = match err {
        DbError::Sqlite(source) | DbError::ConnectionFailed { source, .. } => source,
        // Already terminal, e.g. from a nested executor.
        other => return other,
    };
    DbError::Contention {
        connection_id,
        access,
        attempts: state.attempts(),
        elapsed: state.elapsed(),
        source,
    }
}

impl SqlitePool {
    /// Run `f` on a connection of class `access` with the pool's retry policy.
    pub fn with_connection<T, F>(&self, access: AccessMode, f: F) -> Result<T, DbError>
    where
        F: FnMut(&Connection) -> Result<T, DbError>,
    {
        Executor::new(self.clone())
            .run(RunOptions::new(access), f)
            .map(OperationOutcome::into_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;
    use std::cell::Cell;
    use std::time::Instant;
    use tempfile::TempDir;
    use tidepool_core::PoolConfigBuilder;

    fn busy() -> DbError {
        DbError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ))
    }

    fn pool(dir: &TempDir) -> SqlitePool {
        let config = PoolConfigBuilder::new()
            .max_size(3)
            .lock_retry_count(4)
            .lock_retry_base(Duration::from_millis(5))
            .build()
            .unwrap();
        SqlitePool::open(dir.path().join("exec.db"), config).unwrap()
    }

    #[test]
    fn succeeds_after_transient_contention() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(pool(&dir));
        let failures = Cell::new(0);

        let outcome = executor
            .run(RunOptions::write(), |conn| {
                if failures.get() < 2 {
                    failures.set(failures.get() + 1);
                    return Err(busy());
                }
                Ok(conn.query_row("SELECT 40 + 2", [], |r| r.get::<_, i64>(0))?)
            })
            .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.retries, 2);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(executor.pool().active_count(), 0);
    }

    #[test]
    fn exhaustion_reports_attempts() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(pool(&dir));
        let calls = Cell::new(0);

        let err = executor
            .run(RunOptions::write(), |_| -> Result<(), DbError> {
                calls.set(calls.get() + 1);
                Err(busy())
            })
            .unwrap_err();

        assert_eq!(calls.get(), 4);
        match err {
            DbError::Contention { attempts, access, connection_id, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(access, AccessMode::ReadWrite);
                assert!(connection_id.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(executor.pool().active_count(), 0);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(pool(&dir));
        let calls = Cell::new(0);

        let err = executor
            .run(RunOptions::read(), |conn| {
                calls.set(calls.get() + 1);
                conn.execute_batch("SELECT * FROM missing_table")?;
                Ok(())
            })
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert!(matches!(err, DbError::Sqlite(_)));
        assert_eq!(executor.pool().active_count(), 0);
    }

    #[test]
    fn retry_disabled_runs_once() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(pool(&dir));
        let calls = Cell::new(0);

        let err = executor
            .run(RunOptions::write().without_retry(), |_| -> Result<(), DbError> {
                calls.set(calls.get() + 1);
                Err(busy())
            })
            .unwrap_err();

        assert_eq!(calls.get(), 1);
        assert!(matches!(err, DbError::Contention { attempts: 1, .. }));
    }

    #[test]
    fn cancelled_token_stops_before_first_attempt() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(pool(&dir));
        let token = CancellationToken::new();
        token.cancel();

        let err = executor
            .run(RunOptions::read().with_cancel(token), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, DbError::Cancelled { attempts: 0, .. }));
    }

    #[test]
    fn timeout_bounds_backoff() {
        let dir = TempDir::new().unwrap();
        let executor = Executor::new(pool(&dir))
            .with_policy(RetryPolicy::new(10, Duration::from_millis(50)));

        let started = Instant::now();
        let err = executor
            .run(
                RunOptions::write().with_timeout(Duration::from_millis(120)),
                |_| -> Result<(), DbError> { Err(busy()) },
            )
            .unwrap_err();

        assert!(matches!(err, DbError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn with_connection_returns_value() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir);
        let value = pool
            .with_connection(AccessMode::ReadOnly, |conn| {
                Ok(conn.query_row("SELECT 'ok'", [], |r| r.get::<_, String>(0))?)
            })
            .unwrap();
        assert_eq!(value, "ok");
        assert_eq!(pool.active_count(), 0);
    }
}
