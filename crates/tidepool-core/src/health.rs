//! Health check and pool monitoring types
//!
//! These types are produced by the SQLite backend and consumed by monitoring
//! collaborators (the CLI, embedding applications). None of them hold a
//! database handle; they are snapshots.
//!
//! Durations serialize as fractional milliseconds so reports stay readable
//! when printed as JSON.

use std::time::{Duration, Instant};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::identifiers::{AccessMode, ConnectionId};

/// Named sub-check of a connection health check, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Probe {
    /// `SELECT 1`
    SimpleRead,
    /// Journal mode and foreign key pragmas
    Pragma,
    /// Create, fill and roll back a scratch table
    Write,
    /// `quick_check` or `integrity_check`
    Integrity,
}

impl Probe {
    pub fn as_str(self) -> &'static str {
        match self {
            Probe::SimpleRead => "simple_read",
            Probe::Pragma => "pragma",
            Probe::Write => "write",
            Probe::Integrity => "integrity",
        }
    }
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which optional probes to run. The simple read always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckOptions {
    pub pragma: bool,
    /// Ignored for read-only connections.
    pub write: bool,
    pub integrity: bool,
    /// Use the full `integrity_check` instead of `quick_check`.
    pub full_integrity: bool,
}

impl HealthCheckOptions {
    /// Only the simple read probe.
    pub fn minimal() -> Self {
        Self {
            pragma: false,
            write: false,
            integrity: false,
            full_integrity: false,
        }
    }

    /// Every probe, with the full integrity check.
    pub fn thorough() -> Self {
        Self {
            pragma: true,
            write: true,
            integrity: true,
            full_integrity: true,
        }
    }

    #[must_use]
    pub fn with_integrity(mut self, full: bool) -> Self {
        self.integrity = true;
        self.full_integrity = full;
        self
    }
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            pragma: true,
            write: true,
            integrity: false,
            full_integrity: false,
        }
    }
}

/// Duration of one executed probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeTiming {
    pub probe: Probe,
    pub passed: bool,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

/// Outcome of a single health check invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub connection_id: ConnectionId,
    pub access: AccessMode,
    pub healthy: bool,
    /// First probe that failed; later probes were not run.
    pub failed_check: Option<Probe>,
    pub error: Option<String>,
    pub timings: Vec<ProbeTiming>,
    /// Requested probes that were not executed.
    pub skipped: Vec<Probe>,
    pub journal_mode: Option<String>,
    pub foreign_keys: Option<bool>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl HealthCheckResult {
    pub fn timing(&self, probe: Probe) -> Option<&ProbeTiming> {
        self.timings.iter().find(|t| t.probe == probe)
    }

    pub fn ran(&self, probe: Probe) -> bool {
        self.timing(probe).is_some()
    }
}

/// Bookkeeping snapshot of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub access: AccessMode,
    pub in_use: bool,
    pub created_at: Instant,
    pub last_used: Instant,
    pub operation_count: u64,
}

impl ConnectionInfo {
    /// Whether the connection is in use and untouched for longer than `threshold`.
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        self.is_stalled_at(threshold, Instant::now())
    }

    /// [`is_stalled`](Self::is_stalled) evaluated at an explicit instant.
    pub fn is_stalled_at(&self, threshold: Duration, now: Instant) -> bool {
        self.in_use && now.saturating_duration_since(self.last_used) > threshold
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl Serialize for ConnectionInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ConnectionInfo", 6)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("access", &self.access)?;
        state.serialize_field("in_use", &self.in_use)?;
        state.serialize_field("age_ms", &millis(self.age()))?;
        state.serialize_field("since_last_used_ms", &millis(self.idle_for()))?;
        state.serialize_field("operation_count", &self.operation_count)?;
        state.end()
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub max_size: usize,
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub read_only_connections: usize,
    pub write_connections: usize,
    /// Connections currently being opened outside the pool lock
    pub pending_creations: usize,
    /// Active connections as a fraction of `max_size` (0.0-1.0)
    pub utilization: f64,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub reclamations: u64,
    /// Read requests served by a write connection
    pub read_fallbacks: u64,
    /// Write connections that had to be opened read-only instead
    pub degraded_creations: u64,
    pub acquisitions: u64,
    pub exhausted: u64,
    #[serde(rename = "uptime_ms", serialize_with = "serialize_millis")]
    pub uptime: Duration,
}

impl PoolStatistics {
    /// Fill in `utilization` from the connection counts.
    #[must_use]
    pub fn with_computed_utilization(mut self) -> Self {
        self.utilization = if self.max_size == 0 {
            0.0
        } else {
            self.active_connections as f64 / self.max_size as f64
        };
        self
    }

    pub fn is_at_capacity(&self) -> bool {
        self.total_connections + self.pending_creations >= self.max_size
            && self.idle_connections == 0
    }

    pub fn is_overutilized(&self) -> bool {
        self.utilization > 0.8
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(millis(*duration))
}
