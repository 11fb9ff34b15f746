//! Connection health checks
//!
//! Diagnostic probes run directly against a handle. A check never touches
//! pool bookkeeping, so monitoring can call it on any checked-out connection.

use std::time::{Duration, Instant};

use rusqlite::Connection;
use tidepool_core::{
    AccessMode, ConnectionId, ConnectionInfo, HealthCheckOptions, HealthCheckResult, Probe,
    ProbeTiming,
};

use crate::connection::PooledConnection;

/// Runs health probes against a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthChecker;

impl HealthChecker {
    /// Check a pooled connection.
    pub fn check(conn: &PooledConnection, options: &HealthCheckOptions) -> HealthCheckResult {
        Self::check_connection(conn.connection(), conn.id(), conn.access(), options)
    }

    /// Check a raw handle.
    ///
    /// Probes run in order (simple read, pragma, write, integrity); the first
    /// failure stops the run. The write probe is skipped on read-only handles.
    pub fn check_connection(
        conn: &Connection,
        id: ConnectionId,
        access: AccessMode,
        options: &HealthCheckOptions,
    ) -> HealthCheckResult {
        let started = Instant::now();
        let mut result = HealthCheckResult {
            connection_id: id,
            access,
            healthy: true,
            failed_check: None,
            error: None,
            timings: Vec::new(),
            skipped: Vec::new(),
            journal_mode: None,
            foreign_keys: None,
            duration: Duration::ZERO,
        };

        let mut plan = vec![Probe::SimpleRead];
        if options.pragma {
            plan.push(Probe::Pragma);
        }
        if options.write {
            if access.is_write() {
                plan.push(Probe::Write);
            } else {
                result.skipped.push(Probe::Write);
            }
        }
        if options.integrity {
            plan.push(Probe::Integrity);
        }

        for (idx, probe) in plan.iter().copied().enumerate() {
            let probe_started = Instant::now();
            let outcome = match probe {
                Probe::SimpleRead => simple_read(conn),
                Probe::Pragma => pragma_read(conn).map(|(mode, fk)| {
                    result.journal_mode = Some(mode);
                    result.foreign_keys = Some(fk);
                }),
                Probe::Write => write_probe(conn),
                Probe::Integrity => integrity_probe(conn, options.full_integrity),
            };

            result.timings.push(ProbeTiming {
                probe,
                passed: outcome.is_ok(),
                duration: probe_started.elapsed(),
            });

            if let Err(message) = outcome {
                tracing::warn!(
                    connection_id = %id,
                    access = %access,
                    probe = %probe,
                    error = %message,
                    "Health probe failed"
                );
                result.healthy = false;
                result.failed_check = Some(probe);
                result.error = Some(message);
                result.skipped.extend(plan.iter().skip(idx + 1).copied());
                break;
            }
        }

        result.duration = started.elapsed();
        tracing::debug!(
            connection_id = %id,
            healthy = result.healthy,
            duration_ms = result.duration.as_millis() as u64,
            "Health check finished"
        );
        result
    }

    /// Whether `info` is in use and untouched for longer than `threshold`.
    pub fn is_stalled(info: &ConnectionInfo, threshold: Duration) -> bool {
        info.is_stalled(threshold)
    }

    /// [`is_stalled`](Self::is_stalled) evaluated at `now`.
    pub fn is_stalled_at(info: &ConnectionInfo, threshold: Duration, now: Instant) -> bool {
        info.is_stalled_at(threshold, now)
    }
}

fn simple_read(conn: &Connection) -> Result<(), String> {
    let one: i64 = conn
        .query_row("SELECT 1", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if one == 1 {
        Ok(())
    } else {
        Err(format!("SELECT 1 returned {one}"))
    }
}

fn pragma_read(conn: &Connection) -> Result<(String, bool), String> {
    let mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    let fk: i64 = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    Ok((mode.to_lowercase(), fk == 1))
}

/// Create and fill a scratch table in the main schema inside a savepoint,
/// then roll it back. Needs the write lock, so it exercises the file itself.
fn write_probe(conn: &Connection) -> Result<(), String> {
    let savepoint = format!("health_{}", rand::random::<u32>());
    conn.execute_batch(&format!("SAVEPOINT {savepoint}"))
        .map_err(|e| e.to_string())?;

    let outcome = conn
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS main.tidepool_health_probe (id INTEGER PRIMARY KEY, note TEXT);
             INSERT INTO tidepool_health_probe (note) VALUES ('probe');",
        )
        .and_then(|()| {
            conn.query_row("SELECT COUNT(*) FROM main.tidepool_health_probe", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map_err(|e| e.to_string())
        .and_then(|rows| {
            if rows >= 1 {
                Ok(())
            } else {
                Err("write probe row not visible".to_string())
            }
        });

    let rollback = conn
        .execute_batch(&format!("ROLLBACK TO SAVEPOINT {savepoint}; RELEASE SAVEPOINT {savepoint};"))
        .map_err(|e| format!("rollback of write probe failed: {e}"));

    outcome.and(rollback)
}

fn integrity_probe(conn: &Connection, full: bool) -> Result<(), String> {
    let pragma = if full {
        "PRAGMA integrity_check"
    } else {
        "PRAGMA quick_check"
    };
    let mut stmt = conn.prepare(pragma).map_err(|e| e.to_string())?;
    let rows: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| e.to_string())?
        .collect::<Result<_, _>>()
        .map_err(|e| e.to_string())?;

    match rows.as_slice() {
        [only] if only.eq_ignore_ascii_case("ok") => Ok(()),
        _ => Err(rows.join("; ")),
    }
}
