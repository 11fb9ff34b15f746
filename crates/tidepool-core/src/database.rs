//! Validated pool sizing
//!
//! The pool holds a handful of connections to a single file. SQLite in WAL
//! mode serialises writers, so very large pools buy nothing but file
//! descriptors; the accepted range is kept deliberately small.
//!
//! # Example
//!
//! ```rust
//! use tidepool_core::database::PoolSize;
//!
//! let size = PoolSize::new(8).unwrap();
//! assert_eq!(size.get(), 8);
//!
//! assert!(PoolSize::new(0).is_err());
//! assert!(PoolSize::new(65).is_err());
//!
//! // Four workers get six connections.
//! assert_eq!(PoolSize::with_headroom(4).get(), 6);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Connection pool size constrained to `1..=64`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct PoolSize(usize);

impl PoolSize {
    /// Minimum allowed pool size
    pub const MIN: usize = 1;
    /// Maximum allowed pool size
    pub const MAX: usize = 64;
    /// Default pool size, comfortably above the handful of background workers
    /// a desktop process runs concurrently.
    pub const DEFAULT: usize = 10;

    /// Create a pool size, rejecting values outside `1..=64`.
    pub fn new(size: usize) -> Result<Self, ConfigError> {
        if !(Self::MIN..=Self::MAX).contains(&size) {
            return Err(ConfigError::PoolSizeOutOfRange {
                size,
                min: Self::MIN,
                max: Self::MAX,
            });
        }
        Ok(Self(size))
    }

    /// Size a pool for `workers` concurrent callers, leaving headroom for
    /// maintenance probes and reclamation replacements.
    pub fn with_headroom(workers: usize) -> Self {
        let headroom = (workers / 2).max(2);
        Self(workers.saturating_add(headroom).clamp(Self::MIN, Self::MAX))
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl Default for PoolSize {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<usize> for PoolSize {
    type Error = ConfigError;

    fn try_from(size: usize) -> Result<Self, Self::Error> {
        Self::new(size)
    }
}

impl From<PoolSize> for usize {
    fn from(size: PoolSize) -> Self {
        size.get()
    }
}

impl std::fmt::Display for PoolSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1)]
    #[case(10)]
    #[case(64)]
    fn accepts_sizes_in_range(#[case] size: usize) {
        assert_eq!(PoolSize::new(size).unwrap().get(), size);
    }

    #[rstest]
    #[case(0)]
    #[case(65)]
    #[case(1000)]
    fn rejects_sizes_out_of_range(#[case] size: usize) {
        let err = PoolSize::new(size).unwrap_err();
        assert!(matches!(err, ConfigError::PoolSizeOutOfRange { .. }));
    }

    #[rstest]
    #[case(0, 2)]
    #[case(1, 3)]
    #[case(4, 6)]
    #[case(10, 15)]
    #[case(100, 64)]
    fn headroom_exceeds_worker_count(#[case] workers: usize, #[case] expected: usize) {
        assert_eq!(PoolSize::with_headroom(workers).get(), expected);
    }

    #[test]
    fn default_is_ten() {
        assert_eq!(PoolSize::default().get(), 10);
    }

    #[test]
    fn deserialization_validates() {
        let ok: PoolSize = serde_json::from_str("12").unwrap();
        assert_eq!(ok.get(), 12);
        assert!(serde_json::from_str::<PoolSize>("0").is_err());
    }
}
