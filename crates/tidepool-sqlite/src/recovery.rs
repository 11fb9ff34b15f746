//! Store recovery helpers
//!
//! Invoked by the pool when opening a handle fails because the store is
//! read-only or inaccessible. Every step is best effort: failures are logged
//! and reflected in the return value, never raised.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use tidepool_core::AccessMode;

use crate::error::DbError;
use crate::pool::SqlitePool;

#[cfg(unix)]
const DIR_MODE: u32 = 0o775;
#[cfg(unix)]
const FILE_MODE: u32 = 0o664;

/// Files written by [`StoreRecovery::backup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupPaths {
    pub database: PathBuf,
    /// Copy of the write-ahead log, when one existed.
    pub wal: Option<PathBuf>,
}

/// One step of [`StoreRecovery::repair`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairStep {
    pub name: &'static str,
    /// `None` when the step succeeded.
    pub error: Option<String>,
}

impl RepairStep {
    fn record<T>(name: &'static str, result: Result<T, DbError>) -> Self {
        match result {
            Ok(_) => {
                tracing::info!(step = name, "Repair step completed");
                Self { name, error: None }
            }
            Err(e) => {
                tracing::warn!(step = name, error = %e, "Repair step failed");
                Self {
                    name,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of [`StoreRecovery::repair`].
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    /// Integrity check reported `ok` after the rebuild.
    pub success: bool,
    pub backup: Option<BackupPaths>,
    pub steps: Vec<RepairStep>,
    pub integrity_check: Option<String>,
}

/// Outcome of [`StoreRecovery::reset`].
#[derive(Debug, Clone, Serialize)]
pub struct ResetReport {
    pub backup: Option<BackupPaths>,
    pub removed: usize,
}

/// Filesystem repair routines for one store file and its sidecars.
#[derive(Debug, Clone)]
pub struct StoreRecovery {
    path: PathBuf,
}

impl StoreRecovery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<file>-wal`
    pub fn wal_path(&self) -> PathBuf {
        sidecar(&self.path, "wal")
    }

    /// `<file>-shm`
    pub fn shm_path(&self) -> PathBuf {
        sidecar(&self.path, "shm")
    }

    /// Create the containing directory if needed and make the directory,
    /// store and sidecars group-writable.
    pub fn fix_permissions(&self) {
        let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) else {
            return;
        };

        if !dir.exists() {
            tracing::info!(dir = %dir.display(), "Creating database directory");
            if let Err(e) = fs::create_dir_all(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to create database directory");
                return;
            }
        }

        #[cfg(unix)]
        {
            set_mode(dir, DIR_MODE);
            for file in [self.path.clone(), self.wal_path(), self.shm_path()] {
                if file.exists() {
                    set_mode(&file, FILE_MODE);
                }
            }
        }
    }

    /// Copy the store (and its WAL, if present) next to it as
    /// `<stem>.backup-<YYYYmmddHHMMSS>`.
    pub fn backup(&self) -> Result<BackupPaths, DbError> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let database = self.path.with_extension(format!("backup-{stamp}"));

        fs::copy(&self.path, &database).map_err(|source| DbError::Io {
            path: self.path.clone(),
            source,
        })?;

        let wal_source = self.wal_path();
        let wal = if wal_source.exists() {
            let target = sidecar(&database, "wal");
            fs::copy(&wal_source, &target).map_err(|source| DbError::Io {
                path: wal_source.clone(),
                source,
            })?;
            Some(target)
        } else {
            None
        };

        tracing::info!(
            source = %self.path.display(),
            backup = %database.display(),
            wal_copied = wal.is_some(),
            "Created store backup"
        );
        Ok(BackupPaths { database, wal })
    }

    /// Delete `-wal` and `-shm`; returns how many files were removed.
    pub fn remove_sidecars(&self) -> usize {
        let mut removed = 0;
        for file in [self.wal_path(), self.shm_path()] {
            if !file.exists() {
                continue;
            }
            match fs::remove_file(&file) {
                Ok(()) => {
                    tracing::info!(file = %file.display(), "Removed SQLite sidecar file");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "Failed to remove sidecar file");
                }
            }
        }
        removed
    }

    /// Try to make a read-only store writable again.
    ///
    /// Backs the store up, removes the sidecars (only when the backup
    /// succeeded, since the WAL may hold committed pages) and re-applies
    /// permissions. Returns whether the file now looks writable; opening a
    /// connection to confirm is left to the caller.
    pub fn handle_readonly_store(&self) -> bool {
        tracing::warn!(path = %self.path.display(), "Attempting read-only store recovery");

        if !self.path.exists() {
            tracing::warn!(path = %self.path.display(), "Store file missing, nothing to recover");
            return false;
        }

        match self.backup() {
            Ok(_) => {
                self.remove_sidecars();
            }
            Err(e) => {
                tracing::warn!(error = %e, "Store backup failed, keeping sidecar files");
            }
        }

        self.fix_permissions();

        let writable = self.is_plausibly_writable();
        if writable {
            tracing::info!(path = %self.path.display(), "Store appears writable after recovery");
        } else {
            tracing::error!(path = %self.path.display(), "Store still not writable after recovery");
        }
        writable
    }

    /// Back up the store, repair permissions, then rebuild it with `VACUUM`
    /// and `REINDEX` through `pool` and re-run `PRAGMA integrity_check`.
    ///
    /// Individual steps may fail; each outcome is recorded in the report.
    pub fn repair(&self, pool: &SqlitePool) -> RepairReport {
        tracing::info!(path = %self.path.display(), "Attempting store repair");

        let backup = if self.path.exists() {
            match self.backup() {
                Ok(paths) => Some(paths),
                Err(e) => {
                    tracing::warn!(error = %e, "Backup before repair failed, continuing");
                    None
                }
            }
        } else {
            None
        };

        self.fix_permissions();
        let mut steps = vec![RepairStep {
            name: "permissions",
            error: (!self.is_plausibly_writable()).then(|| "store is not writable".to_string()),
        }];

        for (name, sql) in [("vacuum", "VACUUM"), ("reindex", "REINDEX")] {
            let result = pool.with_connection(AccessMode::ReadWrite, |conn| Ok(conn.execute_batch(sql)?));
            steps.push(RepairStep::record(name, result));
        }

        let integrity = pool.with_connection(AccessMode::ReadWrite, |conn| {
            Ok(conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))?)
        });
        let integrity_check = integrity.as_ref().ok().cloned();
        steps.push(RepairStep::record("integrity_check", integrity));

        let success = integrity_check.as_deref() == Some("ok");
        if success {
            tracing::info!(path = %self.path.display(), "Store repair succeeded, integrity check passed");
        } else {
            tracing::warn!(
                path = %self.path.display(),
                integrity_check = ?integrity_check,
                "Store repair did not restore integrity"
            );
        }

        RepairReport {
            success,
            backup,
            steps,
            integrity_check,
        }
    }

    /// Back up the store, then delete it together with its sidecars.
    ///
    /// No pool may be open on the store. A failed backup aborts the reset
    /// before anything is deleted; [`SqlitePool::open`] re-creates an empty
    /// store afterwards.
    pub fn reset(&self) -> Result<ResetReport, DbError> {
        tracing::warn!(path = %self.path.display(), "Resetting store");

        let backup = if self.path.exists() {
            Some(self.backup()?)
        } else {
            None
        };

        let mut removed = self.remove_sidecars();
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|source| DbError::Io {
                path: self.path.clone(),
                source,
            })?;
            tracing::info!(file = %self.path.display(), "Removed store file");
            removed += 1;
        }

        for file in [self.wal_path(), self.shm_path()] {
            if file.exists() {
                return Err(DbError::Io {
                    path: file,
                    source: std::io::Error::other("sidecar file could not be removed"),
                });
            }
        }

        Ok(ResetReport { backup, removed })
    }

    /// Open the store for writing without truncating it.
    pub fn is_plausibly_writable(&self) -> bool {
        if self.path.exists() {
            return OpenOptions::new().write(true).open(&self.path).is_ok();
        }
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::metadata(dir).is_ok_and(|meta| !meta.permissions().readonly())
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push("-");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        tracing::warn!(path = %path.display(), mode = %format!("{mode:o}"), error = %e, "Failed to set permissions");
    }
}
