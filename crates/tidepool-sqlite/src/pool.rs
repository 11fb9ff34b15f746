//! Connection pool for a single WAL-mode SQLite file
//!
//! The pool owns a bounded set of connections, each tagged read-only or
//! write at creation. All bookkeeping lives behind one mutex; opening and
//! closing handles always happens outside it so a slow filesystem never
//! blocks other callers.
//!
//! Acquisition order for a read request: idle read-only connection, a new
//! read-only connection if capacity remains, then an idle write connection
//! as a logged fallback. For a write request: idle write connection, a new
//! write connection if capacity remains, then an idle read-only connection
//! is closed and replaced by a write connection. When nothing is idle the
//! longest-held connection past the staleness threshold is reclaimed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rusqlite::{Connection, InterruptHandle};
use tidepool_core::{
    AccessMode, ConnectionId, ConnectionInfo, ErrorClass, PoolConfig, PoolStatistics,
};

use crate::connection::{self, PooledConnection, close_quietly};
use crate::error::{DbError, lock_poisoned};
use crate::maintenance::{CloseReport, MaintenanceReport};
use crate::recovery::StoreRecovery;

/// Thread-safe pool handle; clones share the same connections.
#[derive(Clone)]
pub struct SqlitePool {
    shared: Arc<PoolShared>,
}

/// Opens one configured handle; [`connection::open`] outside tests.
pub(crate) type Opener = fn(&Path, AccessMode, &PoolConfig) -> Result<Connection, DbError>;

pub(crate) struct PoolShared {
    path: PathBuf,
    config: PoolConfig,
    recovery: StoreRecovery,
    opener: Opener,
    state: Mutex<PoolState>,
    counters: PoolCounters,
    created_at: Instant,
}

struct PoolState {
    slots: Vec<Slot>,
    /// Connections being opened outside the lock; they count against capacity.
    pending: usize,
    last_maintenance: Instant,
    closed: bool,
}

struct Slot {
    id: ConnectionId,
    access: AccessMode,
    in_use: bool,
    created_at: Instant,
    last_used: Instant,
    operation_count: u64,
    /// `None` while checked out.
    handle: Option<Connection>,
    poisoned: Arc<AtomicBool>,
    interrupt: InterruptHandle,
}

impl Slot {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            access: self.access,
            in_use: self.in_use,
            created_at: self.created_at,
            last_used: self.last_used,
            operation_count: self.operation_count,
        }
    }
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    reclaimed: AtomicU64,
    read_fallbacks: AtomicU64,
    degraded: AtomicU64,
    acquisitions: AtomicU64,
    exhausted: AtomicU64,
}

impl PoolCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decision taken under the lock; carried out after it is released.
enum Checkout {
    Ready(PooledConnection),
    Create {
        access: AccessMode,
        /// Idle handle evicted to make room; closed before creating.
        evicted: Option<(ConnectionId, Connection)>,
    },
}

impl SqlitePool {
    /// Open a pool over `path`.
    ///
    /// Permissions are repaired on a best-effort basis, then one write
    /// connection and `initial_read_only` read-only connections are opened.
    /// Failing to open the write connection is fatal; failing to open a
    /// read-only one is logged and left to on-demand creation.
    pub fn open(path: impl AsRef<Path>, config: PoolConfig) -> Result<Self, DbError> {
        Self::open_with(path.as_ref(), config, connection::open)
    }

    pub(crate) fn open_with(path: &Path, config: PoolConfig, opener: Opener) -> Result<Self, DbError> {
        let path = path.to_path_buf();
        let recovery = StoreRecovery::new(&path);
        recovery.fix_permissions();

        let now = Instant::now();
        let pool = Self {
            shared: Arc::new(PoolShared {
                path,
                config,
                recovery,
                opener,
                state: Mutex::new(PoolState {
                    slots: Vec::new(),
                    pending: 0,
                    last_maintenance: now,
                    closed: false,
                }),
                counters: PoolCounters::default(),
                created_at: now,
            }),
        };

        let access = pool.shared.add_idle(AccessMode::ReadWrite)?;
        if !access.is_write() {
            tracing::error!(
                path = %pool.shared.path.display(),
                "Pool initialised without a write connection; writes will fail"
            );
        }

        let mut opened = 1;
        for _ in 0..pool.shared.config.initial_read_only {
            match pool.shared.add_idle(AccessMode::ReadOnly) {
                Ok(_) => opened += 1,
                Err(e) => tracing::warn!(
                    path = %pool.shared.path.display(),
                    error = %e,
                    "Failed to open initial read-only connection"
                ),
            }
        }

        tracing::info!(
            path = %pool.shared.path.display(),
            max_size = pool.shared.config.max_size.get(),
            connections = opened,
            "SQLite pool opened"
        );

        Ok(pool)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a connection able to serve `access`.
    ///
    /// Runs the idle sweep first when the maintenance interval has elapsed.
    pub fn acquire(&self, access: AccessMode) -> Result<PooledConnection, DbError> {
        if self.shared.maintenance_due() {
            if let Err(e) = self.maintain() {
                tracing::warn!(error = %e, "Opportunistic maintenance failed");
            }
        }

        let plan = {
            let mut state = self.shared.lock_state()?;
            if state.closed {
                return Err(DbError::PoolClosed);
            }
            self.shared.plan_checkout(&mut state, access)?
        };

        match plan {
            Checkout::Ready(conn) => Ok(conn),
            Checkout::Create { access: class, evicted } => {
                if let Some((id, handle)) = evicted {
                    self.shared.close_handle(id, handle);
                }
                self.shared.create_checked_out(class)
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Equivalent to dropping the guard. A guard from another pool is logged
    /// and handed back to the pool it came from.
    pub fn release(&self, conn: PooledConnection) {
        if !conn.belongs_to(&self.shared) {
            tracing::warn!(
                connection_id = %conn.id(),
                path = %self.shared.path.display(),
                "Release of a connection that is not a member of this pool"
            );
        }
        drop(conn);
    }

    /// Close idle connections older than `max_idle_age`, keeping at least one
    /// write connection.
    pub fn maintain(&self) -> Result<MaintenanceReport, DbError> {
        let started = Instant::now();
        let max_idle_age = self.shared.config.max_idle_age;

        let (expired, examined, preserved_write, remaining) = {
            let mut state = self.shared.lock_state()?;
            let now = Instant::now();
            state.last_maintenance = now;

            let mut candidates: Vec<(Instant, ConnectionId, AccessMode)> = state
                .slots
                .iter()
                .filter(|s| !s.in_use && now.saturating_duration_since(s.last_used) > max_idle_age)
                .map(|s| (s.last_used, s.id, s.access))
                .collect();
            candidates.sort_by_key(|(last_used, _, _)| *last_used);

            let mut writes_left = state.slots.iter().filter(|s| s.access.is_write()).count();
            let mut preserved_write = false;
            let mut doomed = Vec::new();
            for (_, id, access) in &candidates {
                if access.is_write() {
                    if writes_left <= 1 {
                        preserved_write = true;
                        continue;
                    }
                    writes_left -= 1;
                }
                doomed.push(*id);
            }

            let mut expired = Vec::with_capacity(doomed.len());
            state.slots.retain_mut(|slot| {
                if doomed.contains(&slot.id) {
                    if let Some(handle) = slot.handle.take() {
                        expired.push((slot.id, handle));
                    }
                    false
                } else {
                    true
                }
            });

            (expired, candidates.len(), preserved_write, state.slots.len())
        };

        let mut closed = 0;
        let mut close_failures = 0;
        for (id, handle) in expired {
            tracing::debug!(connection_id = %id, "Closing idle-expired connection");
            if self.shared.close_handle(id, handle) {
                closed += 1;
            } else {
                close_failures += 1;
            }
        }

        let report = MaintenanceReport {
            examined,
            closed,
            close_failures,
            preserved_write,
            remaining,
            elapsed: started.elapsed(),
        };
        if report.closed > 0 || report.close_failures > 0 {
            tracing::info!(
                closed = report.closed,
                close_failures = report.close_failures,
                remaining = report.remaining,
                "Pool maintenance closed idle connections"
            );
        }
        Ok(report)
    }

    /// Close every connection and refuse further acquisitions.
    ///
    /// Connections still checked out are closed when their guards drop.
    pub fn close_all(&self) -> CloseReport {
        let slots = {
            let mut state = match self.shared.state.lock() {
                Ok(state) => state,
                Err(poisoned) => {
                    tracing::error!("Pool lock poisoned during shutdown, closing anyway");
                    poisoned.into_inner()
                }
            };
            state.closed = true;
            std::mem::take(&mut state.slots)
        };

        let mut report = CloseReport::default();
        for slot in slots {
            match slot.handle {
                Some(handle) => {
                    if self.shared.close_handle(slot.id, handle) {
                        report.closed += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                None => report.checked_out += 1,
            }
        }

        tracing::info!(
            path = %self.shared.path.display(),
            closed = report.closed,
            failed = report.failed,
            checked_out = report.checked_out,
            "SQLite pool closed"
        );
        report
    }

    /// Number of connections currently checked out.
    pub fn active_count(&self) -> usize {
        self.shared
            .lock_state()
            .map(|state| state.slots.iter().filter(|s| s.in_use).count())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().map(|s| s.closed).unwrap_or(true)
    }

    /// Snapshot of every connection's bookkeeping.
    pub fn connections(&self) -> Result<Vec<ConnectionInfo>, DbError> {
        let state = self.shared.lock_state()?;
        Ok(state.slots.iter().map(Slot::info).collect())
    }

    pub fn statistics(&self) -> Result<PoolStatistics, DbError> {
        let state = self.shared.lock_state()?;
        let counters = &self.shared.counters;
        let active = state.slots.iter().filter(|s| s.in_use).count();
        let read_only = state.slots.iter().filter(|s| s.access.is_read_only()).count();

        Ok(PoolStatistics {
            max_size: self.shared.config.max_size.get(),
            total_connections: state.slots.len(),
            idle_connections: state.slots.len() - active,
            active_connections: active,
            read_only_connections: read_only,
            write_connections: state.slots.len() - read_only,
            pending_creations: state.pending,
            utilization: 0.0,
            connections_created: counters.created.load(Ordering::Relaxed),
            connections_closed: counters.closed.load(Ordering::Relaxed),
            reclamations: counters.reclaimed.load(Ordering::Relaxed),
            read_fallbacks: counters.read_fallbacks.load(Ordering::Relaxed),
            degraded_creations: counters.degraded.load(Ordering::Relaxed),
            acquisitions: counters.acquisitions.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            uptime: self.shared.created_at.elapsed(),
        }
        .with_computed_utilization())
    }
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool")
            .field("path", &self.shared.path)
            .field("max_size", &self.shared.config.max_size)
            .finish_non_exhaustive()
    }
}

impl PoolShared {
    fn lock_state(&self) -> Result<MutexGuard<'_, PoolState>, DbError> {
        self.state.lock().map_err(lock_poisoned)
    }

    fn maintenance_due(&self) -> bool {
        self.lock_state()
            .map(|s| !s.closed && s.last_maintenance.elapsed() >= self.config.maintenance_interval)
            .unwrap_or(false)
    }

    fn plan_checkout(
        self: &Arc<Self>,
        state: &mut PoolState,
        requested: AccessMode,
    ) -> Result<Checkout, DbError> {
        let max_size = self.config.max_size.get();
        let has_capacity = state.slots.len() + state.pending < max_size;

        if let Some(conn) = idle_slot(state, requested).and_then(|idx| self.check_out(state, idx)) {
            return Ok(Checkout::Ready(conn));
        }

        if has_capacity {
            state.pending += 1;
            return Ok(Checkout::Create {
                access: requested,
                evicted: None,
            });
        }

        match requested {
            AccessMode::ReadOnly => {
                if let Some(conn) = idle_slot(state, AccessMode::ReadWrite)
                    .and_then(|idx| self.check_out(state, idx))
                {
                    PoolCounters::bump(&self.counters.read_fallbacks);
                    tracing::warn!(
                        connection_id = %conn.id(),
                        "No read-only connection available, serving read from a write connection"
                    );
                    return Ok(Checkout::Ready(conn));
                }
            }
            AccessMode::ReadWrite => {
                if let Some(idx) = idle_slot(state, AccessMode::ReadOnly) {
                    let slot = state.slots.remove(idx);
                    let id = slot.id;
                    tracing::info!(
                        connection_id = %id,
                        "Pool full, replacing idle read-only connection with a write connection"
                    );
                    state.pending += 1;
                    return Ok(Checkout::Create {
                        access: AccessMode::ReadWrite,
                        evicted: slot.handle.map(|handle| (id, handle)),
                    });
                }
            }
        }

        if let Some(idx) = reclaim_candidate(state, self.config.stale_threshold) {
            let slot = state.slots.remove(idx);
            slot.poisoned.store(true, Ordering::Release);
            slot.interrupt.interrupt();
            PoolCounters::bump(&self.counters.reclaimed);

            let replacement = match requested {
                AccessMode::ReadWrite => AccessMode::ReadWrite,
                AccessMode::ReadOnly => slot.access,
            };
            tracing::warn!(
                connection_id = %slot.id,
                access = %slot.access,
                held_ms = slot.last_used.elapsed().as_millis() as u64,
                replacement = %replacement,
                "Forcibly reclaiming stale connection"
            );

            state.pending += 1;
            return Ok(Checkout::Create {
                access: replacement,
                evicted: None,
            });
        }

        PoolCounters::bump(&self.counters.exhausted);
        let in_use = state.slots.iter().filter(|s| s.in_use).count();
        tracing::error!(max_size, in_use, requested = %requested, "Connection pool exhausted");
        Err(DbError::PoolExhausted { max_size, in_use })
    }

    fn check_out(self: &Arc<Self>, state: &mut PoolState, idx: usize) -> Option<PooledConnection> {
        let slot = state.slots.get_mut(idx)?;
        let handle = slot.handle.take()?;
        slot.in_use = true;
        slot.last_used = Instant::now();
        slot.operation_count += 1;
        PoolCounters::bump(&self.counters.acquisitions);

        tracing::debug!(connection_id = %slot.id, access = %slot.access, "Connection acquired");

        Some(PooledConnection::new(
            handle,
            slot.id,
            slot.access,
            slot.operation_count,
            Arc::clone(&slot.poisoned),
            Arc::downgrade(self),
        ))
    }

    /// Open a connection for a reserved capacity unit and hand it out.
    fn create_checked_out(self: &Arc<Self>, requested: AccessMode) -> Result<PooledConnection, DbError> {
        let opened = self.open_with_recovery(requested);

        let mut state = self.lock_state()?;
        state.pending = state.pending.saturating_sub(1);
        let (conn, access) = opened?;

        if state.closed {
            drop(state);
            drop(conn);
            return Err(DbError::PoolClosed);
        }

        let slot = self.new_slot(&conn, access, true);
        let guard = PooledConnection::new(
            conn,
            slot.id,
            slot.access,
            slot.operation_count,
            Arc::clone(&slot.poisoned),
            Arc::downgrade(self),
        );
        PoolCounters::bump(&self.counters.acquisitions);
        state.slots.push(slot);
        Ok(guard)
    }

    /// Open a connection and park it idle; used at pool start-up.
    fn add_idle(&self, requested: AccessMode) -> Result<AccessMode, DbError> {
        let (conn, access) = self.open_with_recovery(requested)?;
        let mut slot = self.new_slot(&conn, access, false);
        slot.handle = Some(conn);
        self.lock_state()?.slots.push(slot);
        Ok(access)
    }

    fn new_slot(&self, conn: &Connection, access: AccessMode, in_use: bool) -> Slot {
        let now = Instant::now();
        let slot = Slot {
            id: ConnectionId::generate(),
            access,
            in_use,
            created_at: now,
            last_used: now,
            operation_count: u64::from(in_use),
            handle: None,
            poisoned: Arc::new(AtomicBool::new(false)),
            interrupt: conn.get_interrupt_handle(),
        };
        PoolCounters::bump(&self.counters.created);
        tracing::info!(
            connection_id = %slot.id,
            access = %slot.access,
            path = %self.path.display(),
            "Created pooled connection"
        );
        slot
    }

    /// Open a handle, repairing the store once when it is read-only or
    /// inaccessible.
    fn open_with_recovery(&self, requested: AccessMode) -> Result<(Connection, AccessMode), DbError> {
        let err = match (self.opener)(&self.path, requested, &self.config) {
            Ok(conn) => return Ok((conn, requested)),
            Err(err) => err,
        };

        match (err.class(), requested) {
            (ErrorClass::ReadOnly, AccessMode::ReadWrite) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Store is read-only, attempting recovery"
                );
                if self.recovery.handle_readonly_store() {
                    match (self.opener)(&self.path, AccessMode::ReadWrite, &self.config) {
                        Ok(conn) => {
                            tracing::info!(path = %self.path.display(), "Store writable again after recovery");
                            return Ok((conn, AccessMode::ReadWrite));
                        }
                        Err(retry_err) => tracing::warn!(
                            error = %retry_err,
                            "Write connection still failing after recovery"
                        ),
                    }
                }

                PoolCounters::bump(&self.counters.degraded);
                tracing::error!(
                    path = %self.path.display(),
                    "Store could not be made writable, degrading to a read-only connection"
                );
                let conn = (self.opener)(&self.path, AccessMode::ReadOnly, &self.config)?;
                Ok((conn, AccessMode::ReadOnly))
            }
            (ErrorClass::Permission, _) => {
                tracing::warn!(
                    path = %self.path.display(),
                    access = %requested,
                    error = %err,
                    "Cannot open store, repairing permissions and retrying"
                );
                self.recovery.fix_permissions();
                let conn = (self.opener)(&self.path, requested, &self.config)?;
                Ok((conn, requested))
            }
            _ => {
                tracing::error!(
                    path = %self.path.display(),
                    access = %requested,
                    error = %err,
                    "Failed to create connection"
                );
                Err(err)
            }
        }
    }

    /// Called from the guard's `Drop`.
    ///
    /// A handle left inside a transaction is rolled back before it is
    /// re-slotted; one that cannot be rolled back is dropped from the pool.
    pub(crate) fn check_in(&self, id: ConnectionId, conn: Connection, poisoned: bool) {
        let clean = poisoned || reset_transaction(id, &conn);

        let leftover = match self.state.lock() {
            Ok(mut state) => {
                let position = state.slots.iter().position(|s| s.id == id);
                match position {
                    Some(idx) if state.slots[idx].in_use && state.slots[idx].handle.is_none() && !poisoned => {
                        if clean {
                            let slot = &mut state.slots[idx];
                            slot.in_use = false;
                            slot.last_used = Instant::now();
                            slot.handle = Some(conn);
                            tracing::debug!(connection_id = %id, "Connection released");
                            None
                        } else {
                            let slot = state.slots.remove(idx);
                            tracing::error!(
                                connection_id = %id,
                                access = %slot.access,
                                "Discarding connection stuck in an open transaction"
                            );
                            Some(conn)
                        }
                    }
                    Some(_) => {
                        tracing::warn!(connection_id = %id, "Release of a connection that is not checked out");
                        Some(conn)
                    }
                    None => {
                        if poisoned {
                            tracing::warn!(connection_id = %id, "Reclaimed connection released by its former holder");
                        } else {
                            tracing::debug!(connection_id = %id, "Released connection is no longer pooled");
                        }
                        Some(conn)
                    }
                }
            }
            Err(_) => {
                tracing::error!(connection_id = %id, "Pool lock poisoned on release, closing handle");
                Some(conn)
            }
        };

        if let Some(conn) = leftover {
            self.close_handle(id, conn);
        }
    }

    fn close_handle(&self, id: ConnectionId, conn: Connection) -> bool {
        PoolCounters::bump(&self.counters.closed);
        close_quietly(conn, id)
    }
}

/// Roll back a transaction the holder left open. Returns whether the handle
/// is back in autocommit mode.
fn reset_transaction(id: ConnectionId, conn: &Connection) -> bool {
    if conn.is_autocommit() {
        return true;
    }
    tracing::warn!(connection_id = %id, "Connection released inside a transaction, rolling back");
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        tracing::error!(connection_id = %id, error = %e, "Rollback on release failed");
    }
    conn.is_autocommit()
}

fn idle_slot(state: &PoolState, access: AccessMode) -> Option<usize> {
    state
        .slots
        .iter()
        .position(|s| !s.in_use && s.access == access && s.handle.is_some())
}

/// In-use slot held longest, provided it exceeds the staleness threshold.
fn reclaim_candidate(state: &PoolState, threshold: Duration) -> Option<usize> {
    let now = Instant::now();
    state
        .slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.info().is_stalled_at(threshold, now))
        .min_by_key(|(_, s)| s.last_used)
        .map(|(idx, _)| idx)
}
