//! Periodic idle sweep
//!
//! [`MaintenanceWorker`] runs [`SqlitePool::maintain`] on a background thread
//! every `maintenance_interval`. The pool also sweeps opportunistically at the
//! top of `acquire`, so the worker is optional for busy pools.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::error::DbError;
use crate::pool::SqlitePool;

/// Outcome of one idle sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Idle connections past `max_idle_age`
    pub examined: usize,
    pub closed: usize,
    /// Handles removed from the pool whose close call failed
    pub close_failures: usize,
    /// An expired connection was kept because it was the last write connection
    pub preserved_write: bool,
    pub remaining: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Outcome of [`SqlitePool::close_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CloseReport {
    pub closed: usize,
    pub failed: usize,
    /// Connections still held by callers; closed when their guards drop
    pub checked_out: usize,
}

/// Background thread sweeping the pool at a fixed interval.
pub struct MaintenanceWorker {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Start sweeping `pool` every `maintenance_interval`.
    pub fn spawn(pool: SqlitePool) -> Result<Self, DbError> {
        let interval = pool.config().maintenance_interval;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("tidepool-maintenance".to_string())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "Maintenance worker started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if pool.is_closed() {
                                break;
                            }
                            if let Err(e) = pool.maintain() {
                                tracing::warn!(error = %e, "Scheduled maintenance failed");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("Maintenance worker stopped");
            })
            .map_err(|source| DbError::Io {
                path: "tidepool-maintenance".into(),
                source,
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signal the worker and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Maintenance worker panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;
    use tidepool_core::PoolConfigBuilder;

    #[test]
    fn worker_sweeps_expired_connections() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfigBuilder::new()
            .max_size(3)
            .initial_read_only(1)
            .maintenance_interval(Duration::from_millis(20))
            .max_idle_age(Duration::from_millis(10))
            .build()
            .unwrap();
        let pool = SqlitePool::open(dir.path().join("sweep.db"), config).unwrap();
        let worker = MaintenanceWorker::spawn(pool.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.statistics().unwrap().total_connections > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        worker.stop();

        let stats = pool.statistics().unwrap();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.write_connections, 1);
    }

    #[test]
    fn stop_returns_promptly() {
        let dir = TempDir::new().unwrap();
        let config = PoolConfigBuilder::new()
            .maintenance_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        let pool = SqlitePool::open(dir.path().join("idle.db"), config).unwrap();
        let worker = MaintenanceWorker::spawn(pool).unwrap();

        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
