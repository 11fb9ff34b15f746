//! Async facade over [`SqlitePool`]
//!
//! SQLite calls block, so every unit of work runs on tokio's blocking pool.
//! A timeout, a dropped future or [`AsyncPool::close_all`] cancels the run's
//! token; the blocking task stops retrying at its next attempt boundary and
//! its result is discarded.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tidepool_core::{AccessMode, CancellationToken, PoolConfig, PoolStatistics};

use crate::error::DbError;
use crate::executor::{Executor, OperationOutcome, RunOptions};
use crate::maintenance::{CloseReport, MaintenanceReport};
use crate::pool::SqlitePool;
use crate::transaction::TransactionOptions;

/// Cheaply cloneable async handle to a pool.
#[derive(Debug, Clone)]
pub struct AsyncPool {
    pool: SqlitePool,
    /// Shared by every clone; cancelled by `close_all`.
    shutdown: tokio_util::sync::CancellationToken,
}

/// Cancels the token unless the run completed.
struct CancelOnDrop {
    token: CancellationToken,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
        }
    }
}

impl AsyncPool {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            shutdown: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Open the store without blocking the runtime.
    pub async fn open(path: impl Into<PathBuf>, config: PoolConfig) -> Result<Self, DbError> {
        let path = path.into();
        let pool = blocking(move || SqlitePool::open(path, config)).await??;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn into_inner(self) -> SqlitePool {
        self.pool
    }

    /// Cancelled once [`close_all`](Self::close_all) starts; lets tasks
    /// built around the pool stop with it.
    pub fn shutdown_token(&self) -> tokio_util::sync::CancellationToken {
        self.shutdown.clone()
    }

    /// Run `f` with the given options; `options.timeout` also bounds the
    /// time spent inside `f`.
    pub async fn run<T, F>(&self, mut options: RunOptions, f: F) -> Result<OperationOutcome<T>, DbError>
    where
        T: Send + 'static,
        F: FnMut(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let token = options.cancel.get_or_insert_with(CancellationToken::new).clone();
        let timeout = options.timeout;
        let executor = Executor::new(self.pool.clone());
        self.supervise(token, timeout, move || executor.run(options, f))
            .await
    }

    pub async fn with_connection<T, F>(&self, access: AccessMode, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnMut(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        self.run(RunOptions::new(access), f)
            .await
            .map(OperationOutcome::into_value)
    }

    /// Run `f` in a transaction; see [`Executor::transaction`].
    pub async fn transaction<T, F>(
        &self,
        mut options: TransactionOptions,
        f: F,
    ) -> Result<OperationOutcome<T>, DbError>
    where
        T: Send + 'static,
        F: FnMut(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        let token = options.cancel.get_or_insert_with(CancellationToken::new).clone();
        let timeout = options.timeout;
        let executor = Executor::new(self.pool.clone());
        self.supervise(token, timeout, move || executor.transaction(options, f))
            .await
    }

    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnMut(&Connection) -> Result<T, DbError> + Send + 'static,
    {
        self.transaction(TransactionOptions::default(), f)
            .await
            .map(OperationOutcome::into_value)
    }

    pub async fn statistics(&self) -> Result<PoolStatistics, DbError> {
        let pool = self.pool.clone();
        blocking(move || pool.statistics()).await?
    }

    pub async fn maintain(&self) -> Result<MaintenanceReport, DbError> {
        let pool = self.pool.clone();
        blocking(move || pool.maintain()).await?
    }

    /// Cancel in-flight operations, then close every connection.
    pub async fn close_all(&self) -> Result<CloseReport, DbError> {
        self.shutdown.cancel();
        let pool = self.pool.clone();
        blocking(move || pool.close_all()).await
    }

    async fn supervise<T, W>(
        &self,
        token: CancellationToken,
        timeout: Option<Duration>,
        work: W,
    ) -> Result<T, DbError>
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, DbError> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(DbError::PoolClosed);
        }

        let started = Instant::now();
        let mut guard = CancelOnDrop {
            token,
            armed: true,
        };
        let task = blocking(work);
        let bounded = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, task).await.map_err(|_| limit),
                None => Ok(task.await),
            }
        };

        // Returning early drops the guard, which cancels the token.
        let joined = tokio::select! {
            () = self.shutdown.cancelled() => {
                tracing::info!("Pool closing, cancelling blocking operation");
                return Err(DbError::Cancelled {
                    attempts: 0,
                    elapsed: started.elapsed(),
                });
            }
            result = bounded => match result {
                Ok(joined) => joined,
                Err(limit) => {
                    tracing::warn!(
                        timeout_ms = limit.as_millis() as u64,
                        "Blocking operation exceeded its timeout, cancelling"
                    );
                    return Err(DbError::TimedOut {
                        attempts: 0,
                        elapsed: started.elapsed(),
                    });
                }
            },
        };

        guard.armed = false;
        joined?
    }
}

impl From<SqlitePool> for AsyncPool {
    fn from(pool: SqlitePool) -> Self {
        Self::new(pool)
    }
}

async fn blocking<T, W>(work: W) -> Result<T, DbError>
where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DbError::TaskJoin(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tidepool_core::PoolConfigBuilder;

    async fn pool(dir: &TempDir) -> AsyncPool {
        let config = PoolConfigBuilder::new()
            .max_size(4)
            .lock_retry_count(5)
            .lock_retry_base(Duration::from_millis(5))
            .build()
            .unwrap();
        let pool = AsyncPool::open(dir.path().join("async.db"), config).await.unwrap();
        pool.with_connection(AccessMode::ReadWrite, |conn| {
            conn.execute_batch("CREATE TABLE events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL)")?;
            Ok(())
        })
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn open_creates_store_and_runs_a_unit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("opened.db");
        let config = PoolConfigBuilder::new().max_size(2).build().unwrap();

        let pool = AsyncPool::open(path.clone(), config).await.unwrap();
        let journal: String = pool
            .with_connection(AccessMode::ReadWrite, |conn| {
                Ok(conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?)
            })
            .await
            .unwrap();

        assert!(path.exists());
        assert_eq!(journal.to_lowercase(), "wal");
        assert_eq!(pool.pool().path(), path.as_path());
    }

    #[tokio::test]
    async fn runs_reads_and_writes() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;

        pool.with_transaction(|conn| {
            conn.execute("INSERT INTO events (kind) VALUES ('open')", [])?;
            conn.execute("INSERT INTO events (kind) VALUES ('close')", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = pool
            .with_connection(AccessMode::ReadOnly, |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(pool.pool().active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tasks_share_the_pool() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.with_transaction(move |conn| {
                    conn.execute("INSERT INTO events (kind) VALUES (?1)", [format!("task-{i}")])?;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stats = pool.statistics().await.unwrap();
        assert!(stats.total_connections <= 4);
        let count: i64 = pool
            .with_connection(AccessMode::ReadOnly, |conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 16);
    }

    #[tokio::test]
    async fn timeout_cancels_pending_retries() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let seen = Arc::clone(&calls);
        let options = RunOptions::write()
            .with_timeout(Duration::from_millis(20))
            .with_cancel(token.clone());
        let err = pool
            .run(options, move |_| -> Result<(), DbError> {
                seen.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                Err(DbError::Sqlite(rusqlite::Error::SqliteFailure(
                    ffi::Error::new(ffi::SQLITE_BUSY),
                    None,
                )))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::TimedOut { .. }), "{err}");
        assert!(token.is_cancelled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn callback_panic_becomes_task_join_error() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;

        let err = pool
            .with_connection(AccessMode::ReadOnly, |_| -> Result<(), DbError> {
                panic!("callback exploded")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::TaskJoin(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_all_cancels_in_flight_operations() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfigBuilder::new()
            .max_size(2)
            .lock_retry_count(50)
            .lock_retry_base(Duration::from_millis(5))
            .build()
            .unwrap();
        let pool = AsyncPool::open(dir.path().join("closing.db"), config).await.unwrap();
        let token = CancellationToken::new();

        let running = {
            let pool = pool.clone();
            let options = RunOptions::write().with_cancel(token.clone());
            tokio::spawn(async move {
                pool.run(options, |_| -> Result<(), DbError> {
                    std::thread::sleep(Duration::from_millis(10));
                    Err(DbError::Sqlite(rusqlite::Error::SqliteFailure(
                        ffi::Error::new(ffi::SQLITE_BUSY),
                        None,
                    )))
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        pool.close_all().await.unwrap();
        let err = running.await.unwrap().unwrap_err();

        assert!(matches!(err, DbError::Cancelled { .. }), "{err}");
        assert!(token.is_cancelled());
        assert!(pool.shutdown_token().is_cancelled());

        let err = pool
            .with_connection(AccessMode::ReadOnly, |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PoolClosed));
    }
}
