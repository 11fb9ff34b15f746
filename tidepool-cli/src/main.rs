use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tidepool_core::{AccessMode, HealthCheckOptions, PoolConfig};
use tidepool_sqlite::{CheckpointMode, DbError, HealthChecker, SqlitePool, StoreRecovery, diagnostics};

#[derive(Parser, Debug)]
#[command(name = "tidepool", version)]
#[command(about = "Tidepool CLI - inspect and repair a WAL-mode SQLite store")]
struct Cli {
    /// Path to the database file
    #[arg(long, short = 'd', global = true, default_value = "appdata.db")]
    database: PathBuf,

    /// Pretty-print JSON output and use human-readable logs
    #[arg(long, global = true)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run health probes on a write and a read-only connection
    Health {
        /// Also run PRAGMA quick_check
        #[arg(long)]
        integrity: bool,
        /// Use the full integrity_check instead of quick_check
        #[arg(long, requires = "integrity")]
        full: bool,
    },
    /// Print pool statistics and per-connection info after a warm-up
    Stats,
    /// Print file sizes, journal mode, integrity and row counts
    Info,
    /// Run a WAL checkpoint
    Checkpoint {
        /// passive, full, restart or truncate
        #[arg(long, default_value = "passive")]
        mode: CheckpointMode,
    },
    /// Back up the store, drop its sidecars and repair permissions
    Recover,
    /// Create the database directory and make the store group-writable
    FixPermissions,
    /// Back up the store, then VACUUM, REINDEX and re-check integrity
    Repair,
    /// Back up the store, delete it with its sidecars and create it afresh
    Reset {
        /// Required; the store's contents are discarded
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("refusing to reset {0} without --yes")]
    ResetNotConfirmed(String),
    #[error("repair did not restore integrity")]
    RepairFailed,
}

#[derive(Serialize)]
struct RecoverOutput {
    recovered: bool,
    writable: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    let _ = if cli.pretty {
        subscriber.try_init()
    } else {
        subscriber.json().try_init()
    };

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(command = ?cli.command, error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Commands::Health { integrity, full } => {
            let pool = open(cli)?;
            let mut options = HealthCheckOptions::default();
            if *integrity {
                options = options.with_integrity(*full);
            }
            let mut results = Vec::new();
            for access in [AccessMode::ReadWrite, AccessMode::ReadOnly] {
                let conn = pool.acquire(access)?;
                results.push(HealthChecker::check(&conn, &options));
            }
            pool.close_all();
            let healthy = results.iter().all(|r| r.healthy);
            emit(cli, &serde_json::json!({ "healthy": healthy, "connections": results }))
        }
        Commands::Stats => {
            let pool = open(cli)?;
            let reader = pool.acquire(AccessMode::ReadOnly)?;
            let connections = pool.connections()?;
            let statistics = pool.statistics()?;
            drop(reader);
            pool.close_all();
            emit(
                cli,
                &serde_json::json!({ "statistics": statistics, "connections": connections }),
            )
        }
        Commands::Info => {
            let pool = open(cli)?;
            let info = diagnostics::database_info(&pool)?;
            pool.close_all();
            emit(cli, &info)
        }
        Commands::Checkpoint { mode } => {
            let pool = open(cli)?;
            let report = diagnostics::checkpoint(&pool, *mode)?;
            pool.close_all();
            emit(cli, &report)
        }
        Commands::Recover => {
            let recovery = StoreRecovery::new(&cli.database);
            let recovered = recovery.handle_readonly_store();
            let writable = recovery.is_plausibly_writable();
            emit(cli, &RecoverOutput { recovered, writable })
        }
        Commands::FixPermissions => {
            let recovery = StoreRecovery::new(&cli.database);
            recovery.fix_permissions();
            emit(
                cli,
                &serde_json::json!({
                    "path": recovery.path(),
                    "writable": recovery.is_plausibly_writable(),
                }),
            )
        }
        Commands::Repair => {
            let pool = open(cli)?;
            let report = StoreRecovery::new(&cli.database).repair(&pool);
            pool.close_all();
            emit(cli, &report)?;
            if report.success {
                Ok(())
            } else {
                Err(CliError::RepairFailed)
            }
        }
        Commands::Reset { yes } => {
            if !*yes {
                return Err(CliError::ResetNotConfirmed(cli.database.display().to_string()));
            }
            let report = StoreRecovery::new(&cli.database).reset()?;
            let pool = open(cli)?;
            let info = diagnostics::database_info(&pool)?;
            pool.close_all();
            emit(cli, &serde_json::json!({ "reset": report, "database": info }))
        }
    }
}

fn open(cli: &Cli) -> Result<SqlitePool, DbError> {
    let config = PoolConfig::from_env()?;
    SqlitePool::open(&cli.database, config)
}

fn emit<T: Serialize>(cli: &Cli, value: &T) -> Result<(), CliError> {
    let text = if cli.pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}
