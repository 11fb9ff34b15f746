//! Recovery and diagnostics tests against real store files

use std::fs;

use tempfile::TempDir;
use tidepool::{
    AccessMode, CheckpointMode, HealthCheckOptions, HealthChecker, PoolConfigBuilder, Probe,
    SqlitePool, StoreRecovery, diagnostics,
};

fn config() -> tidepool::PoolConfig {
    PoolConfigBuilder::new().max_size(3).build().unwrap()
}

#[test]
fn test_open_creates_missing_directories() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("data").join("appdata.db");

    let pool = SqlitePool::open(&path, config()).unwrap();
    pool.with_transaction(|conn| {
        conn.execute_batch("CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT)")?;
        Ok(())
    })
    .unwrap();

    assert!(path.exists());
}

#[cfg(unix)]
#[test]
fn test_open_repairs_file_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locked.db");
    {
        let pool = SqlitePool::open(&path, config()).unwrap();
        pool.with_connection(AccessMode::ReadWrite, |conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")?;
            Ok(())
        })
        .unwrap();
        pool.close_all();
    }
    fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();

    let pool = SqlitePool::open(&path, config()).unwrap();
    let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o664);

    let rows: i64 = pool
        .with_transaction(|conn| {
            conn.execute("INSERT INTO t VALUES (2)", [])?;
            Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
        })
        .unwrap();
    assert_eq!(rows, 2);
    assert_eq!(pool.statistics().unwrap().degraded_creations, 0);
}

#[test]
fn test_readonly_recovery_keeps_committed_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    {
        let pool = SqlitePool::open(&path, config()).unwrap();
        pool.with_transaction(|conn| {
            conn.execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO items (name) VALUES ('one'), ('two');",
            )?;
            Ok(())
        })
        .unwrap();
        diagnostics::checkpoint(&pool, CheckpointMode::Truncate).unwrap();
        pool.close_all();
    }

    let recovery = StoreRecovery::new(&path);
    assert!(recovery.handle_readonly_store());

    let pool = SqlitePool::open(&path, config()).unwrap();
    let info = diagnostics::database_info(&pool).unwrap();
    assert_eq!(info.total_rows, 2);
    assert!(info.is_intact());

    let backups = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("store.backup-"))
        .count();
    assert!(backups >= 1);
}

#[test]
fn test_health_check_on_both_classes() {
    let dir = TempDir::new().unwrap();
    let pool = SqlitePool::open(dir.path().join("health.db"), config()).unwrap();
    let options = HealthCheckOptions::default().with_integrity(false);

    let writer = pool.acquire(AccessMode::ReadWrite).unwrap();
    let result = HealthChecker::check(&writer, &options);
    assert!(result.healthy, "{:?}", result.error);
    assert!(result.ran(Probe::Write));
    assert!(result.ran(Probe::Integrity));

    let reader = pool.acquire(AccessMode::ReadOnly).unwrap();
    let result = HealthChecker::check(&reader, &options);
    assert!(result.healthy, "{:?}", result.error);
    assert!(!result.ran(Probe::Write));
    assert!(result.skipped.contains(&Probe::Write));
}

#[test]
fn test_statistics_reflect_checkouts() {
    let dir = TempDir::new().unwrap();
    let pool = SqlitePool::open(dir.path().join("stats.db"), config()).unwrap();
    let _held = pool.acquire(AccessMode::ReadWrite).unwrap();

    let stats = pool.statistics().unwrap();
    assert_eq!(stats.active_connections, 1);
    assert!(stats.utilization > 0.0);

    let connections = pool.connections().unwrap();
    assert_eq!(connections.iter().filter(|c| c.in_use).count(), 1);
}
