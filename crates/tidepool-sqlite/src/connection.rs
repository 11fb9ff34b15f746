//! Opening pooled handles and the checked-out connection guard.

use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags};
use tidepool_core::{AccessMode, ConnectionId, ErrorClass, PoolConfig};

use crate::error::{DbError, classify};
use crate::pool::PoolShared;

/// First pause between attempts to open a handle on a locked file.
const OPEN_RETRY_INITIAL: Duration = Duration::from_millis(10);
const OPEN_RETRY_MAX: Duration = Duration::from_millis(250);

/// Open and configure a handle of the given class.
///
/// A locked file is retried until `connection_timeout` runs out; any other
/// failure is returned immediately as [`DbError::ConnectionFailed`].
pub(crate) fn open(path: &Path, access: AccessMode, config: &PoolConfig) -> Result<Connection, DbError> {
    let started = Instant::now();
    let mut pause = OPEN_RETRY_INITIAL;

    loop {
        match open_once(path, access, config.busy_timeout) {
            Ok(conn) => {
                tracing::debug!(
                    path = %path.display(),
                    access = %access,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Opened SQLite handle"
                );
                return Ok(conn);
            }
            Err(err)
                if classify(&err) == ErrorClass::Contention
                    && started.elapsed() + pause < config.connection_timeout =>
            {
                tracing::debug!(
                    path = %path.display(),
                    access = %access,
                    error = %err,
                    "Store locked while opening handle, retrying"
                );
                thread::sleep(pause);
                pause = (pause * 2).min(OPEN_RETRY_MAX);
            }
            Err(source) => {
                return Err(DbError::ConnectionFailed {
                    path: path.to_path_buf(),
                    access,
                    source,
                });
            }
        }
    }
}

fn open_flags(access: AccessMode) -> OpenFlags {
    let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    match access {
        AccessMode::ReadOnly => base | OpenFlags::SQLITE_OPEN_READ_ONLY,
        AccessMode::ReadWrite => {
            base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        }
    }
}

fn open_once(path: &Path, access: AccessMode, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(path, open_flags(access))?;
    conn.busy_timeout(busy_timeout)?;

    if access.is_write() {
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(
                path = %path.display(),
                journal_mode = %mode,
                "Store did not switch to WAL mode; readers will block the writer"
            );
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;\nPRAGMA foreign_keys = ON;")?;

        // SQLite opens a write-protected file read-only without complaint;
        // taking the reserved lock surfaces SQLITE_READONLY here instead of
        // on the caller's first write.
        conn.execute_batch("BEGIN IMMEDIATE;\nROLLBACK;")?;
    } else {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    }

    Ok(conn)
}

/// Close a handle, logging instead of failing.
pub(crate) fn close_quietly(conn: Connection, id: ConnectionId) -> bool {
    match conn.close() {
        Ok(()) => true,
        Err((_conn, err)) => {
            tracing::warn!(connection_id = %id, error = %err, "Failed to close SQLite handle");
            false
        }
    }
}

/// RAII guard for a checked-out connection.
///
/// Dropping the guard is the release path: the handle goes back to its slot
/// in the pool. A handle whose slot is gone (pool closed, connection
/// reclaimed or expired) is closed instead.
pub struct PooledConnection {
    conn: Option<Connection>,
    id: ConnectionId,
    access: AccessMode,
    operation_count: u64,
    poisoned: Arc<AtomicBool>,
    pool: Weak<PoolShared>,
}

impl PooledConnection {
    pub(crate) fn new(
        conn: Connection,
        id: ConnectionId,
        access: AccessMode,
        operation_count: u64,
        poisoned: Arc<AtomicBool>,
        pool: Weak<PoolShared>,
    ) -> Self {
        Self {
            conn: Some(conn),
            id,
            access,
            operation_count,
            poisoned,
            pool,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Class the handle was opened with; may be read-only even for a write
    /// request when the store could not be made writable.
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Whether the pool reclaimed this connection from under the holder.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Operations served by this connection, including the current one.
    pub fn operation_count(&self) -> u64 {
        self.operation_count
    }

    pub fn connection(&self) -> &Connection {
        self
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        std::ptr::eq(self.pool.as_ptr(), Arc::as_ptr(pool))
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("BUG: PooledConnection has None connection (this should never happen)")
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("access", &self.access)
            .field("operation_count", &self.operation_count)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let poisoned = self.is_poisoned();

        match self.pool.upgrade() {
            Some(pool) => pool.check_in(self.id, conn, poisoned),
            None => {
                tracing::debug!(connection_id = %self.id, "Pool dropped before release, closing handle");
                close_quietly(conn, self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> PoolConfig {
        PoolConfig::default()
    }

    #[test]
    fn write_handle_enables_wal_and_foreign_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let conn = open(&path, AccessMode::ReadWrite, &config()).unwrap();

        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let writer = open(&path, AccessMode::ReadWrite, &config()).unwrap();
        writer
            .execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY)")
            .unwrap();

        let reader = open(&path, AccessMode::ReadOnly, &config()).unwrap();
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let err = reader
            .execute("INSERT INTO items (id) VALUES (1)", [])
            .unwrap_err();
        assert_eq!(classify(&err), ErrorClass::ReadOnly);
    }

    #[test]
    fn read_only_handle_needs_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.db");
        let err = open(&path, AccessMode::ReadOnly, &config()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permission);
        assert!(matches!(err, DbError::ConnectionFailed { access: AccessMode::ReadOnly, .. }));
    }

    #[test]
    fn write_handle_retries_on_locked_store_until_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let holder = open(&path, AccessMode::ReadWrite, &config()).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let config = tidepool_core::PoolConfigBuilder::new()
            .busy_timeout(Duration::from_millis(10))
            .connection_timeout(Duration::from_millis(150))
            .build()
            .unwrap();

        let started = Instant::now();
        let err = open(&path, AccessMode::ReadWrite, &config).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Contention);
        assert!(started.elapsed() >= Duration::from_millis(50));

        holder.execute_batch("ROLLBACK").unwrap();
        assert!(open(&path, AccessMode::ReadWrite, &config).is_ok());
    }
}
