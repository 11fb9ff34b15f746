//! Store-level diagnostics and WAL checkpointing

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::Serialize;
use tidepool_core::AccessMode;

use crate::error::DbError;
use crate::executor::{Executor, RunOptions};
use crate::pool::SqlitePool;
use crate::recovery::StoreRecovery;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub row_count: i64,
}

/// Snapshot of the store file and its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    /// Path reported by `PRAGMA database_list`; `None` for in-memory stores.
    pub file_path: Option<PathBuf>,
    pub journal_mode: String,
    pub wal_enabled: bool,
    /// First row of `PRAGMA integrity_check`, `"ok"` when healthy.
    pub integrity_check: String,
    pub size_bytes: Option<u64>,
    pub wal_size_bytes: Option<u64>,
    pub tables: Vec<TableInfo>,
    pub total_rows: i64,
}

impl DatabaseInfo {
    pub fn is_intact(&self) -> bool {
        self.integrity_check.eq_ignore_ascii_case("ok")
    }
}

/// `PRAGMA wal_checkpoint` mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    #[default]
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    fn as_sql(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PASSIVE",
            CheckpointMode::Full => "FULL",
            CheckpointMode::Restart => "RESTART",
            CheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_sql().to_lowercase())
    }
}

impl std::str::FromStr for CheckpointMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passive" => Ok(CheckpointMode::Passive),
            "full" => Ok(CheckpointMode::Full),
            "restart" => Ok(CheckpointMode::Restart),
            "truncate" => Ok(CheckpointMode::Truncate),
            other => Err(format!("unknown checkpoint mode '{other}'")),
        }
    }
}

/// Row returned by `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckpointReport {
    pub mode: CheckpointMode,
    /// The checkpoint could not complete because of a concurrent reader or writer.
    pub busy: bool,
    /// Frames in the WAL, or -1 when the store is not in WAL mode.
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// Collect a [`DatabaseInfo`] through a read connection.
pub fn database_info(pool: &SqlitePool) -> Result<DatabaseInfo, DbError> {
    pool.with_connection(AccessMode::ReadOnly, inspect)
}

/// Run a WAL checkpoint on a write connection.
pub fn checkpoint(pool: &SqlitePool, mode: CheckpointMode) -> Result<CheckpointReport, DbError> {
    let outcome = Executor::new(pool.clone()).run(RunOptions::write(), |conn| {
        let sql = format!("PRAGMA wal_checkpoint({})", mode.as_sql());
        let (busy, log_frames, checkpointed_frames) =
            conn.query_row(&sql, [], |row| Ok((row.get::<_, i64>(0)?, row.get(1)?, row.get(2)?)))?;
        Ok(CheckpointReport {
            mode,
            busy: busy != 0,
            log_frames,
            checkpointed_frames,
        })
    })?;

    let report = outcome.value;
    tracing::info!(
        mode = %mode,
        busy = report.busy,
        log_frames = report.log_frames,
        checkpointed_frames = report.checkpointed_frames,
        connection_id = %outcome.connection_id,
        "WAL checkpoint finished"
    );
    Ok(report)
}

fn inspect(conn: &Connection) -> Result<DatabaseInfo, DbError> {
    let file_path = main_file(conn)?;
    let (size_bytes, wal_size_bytes) = match &file_path {
        Some(path) => (
            file_size(path),
            file_size(&StoreRecovery::new(path.as_path()).wal_path()),
        ),
        None => (None, None),
    };

    let integrity_check: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    let wal_enabled = journal_mode.eq_ignore_ascii_case("wal");

    let names: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        stmt.query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?
    };

    let mut tables = Vec::with_capacity(names.len());
    let mut total_rows = 0;
    for name in names {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", name.replace('"', "\"\""));
        let row_count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        total_rows += row_count;
        tables.push(TableInfo { name, row_count });
    }

    Ok(DatabaseInfo {
        file_path,
        journal_mode,
        wal_enabled,
        integrity_check,
        size_bytes,
        wal_size_bytes,
        tables,
        total_rows,
    })
}

fn main_file(conn: &Connection) -> Result<Option<PathBuf>, DbError> {
    let mut stmt = conn.prepare("PRAGMA database_list")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "main" {
            let file: String = row.get(2)?;
            return Ok((!file.is_empty()).then(|| PathBuf::from(file)));
        }
    }
    Ok(None)
}

fn file_size(path: &Path) -> Option<u64> {
    match fs::metadata(path) {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read file metadata");
            None
        }
    }
}
