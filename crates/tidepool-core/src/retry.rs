//! Contention retry policy.
//!
//! Embedded stores in WAL mode serialise writers, so a second writer sees the
//! file as busy until the first commits. Contended operations are retried
//! with jittered exponential backoff: attempt `n` (1-based) is followed by a
//! wait of `base * 2^(n-1) * U[0.5, 1.0]`.

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Failure classification used to decide between retry, repair and re-raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The store reported busy or locked.
    Contention,
    /// The store refused a write because it is read-only.
    ReadOnly,
    /// The file could not be opened or accessed.
    Permission,
    Other,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Contention)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Contention => "contention",
            ErrorClass::ReadOnly => "read_only",
            ErrorClass::Permission => "permission",
            ErrorClass::Other => "other",
        };
        f.write_str(name)
    }
}

/// Whether a run may retry on contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    #[default]
    Retry,
    /// Single attempt; for callbacks with side effects outside the store.
    Disabled,
}

/// Retry budget and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Upper bound on the backoff exponent; keeps `2^n` from overflowing.
    const MAX_EXPONENT: u32 = 16;

    /// `max_attempts` counts the first try and is clamped to at least 1.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Whether another attempt may follow a contended `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Un-jittered backoff after `attempt`: `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(Self::MAX_EXPONENT);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Backoff after `attempt` scaled by a uniform factor in `[0.5, 1.0]`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let factor = rand::rng().random_range(0.5..=1.0);
        self.delay_for(attempt).mul_f64(factor)
    }

    /// Worst-case cumulative backoff when every attempt is contended.
    pub fn max_total_delay(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Best-case cumulative backoff when every attempt is contended.
    pub fn min_total_delay(&self) -> Duration {
        self.max_total_delay() / 2
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// Ephemeral state of one operation's retry loop.
#[derive(Debug, Clone)]
pub struct AttemptState {
    started: Instant,
    attempts: u32,
    last_error: Option<ErrorClass>,
}

impl AttemptState {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Record the beginning of a new attempt, returning its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn record_failure(&mut self, class: ErrorClass) {
        self.last_error = Some(class);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Retries performed so far (attempts after the first).
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn last_error(&self) -> Option<ErrorClass> {
        self.last_error
    }
}
