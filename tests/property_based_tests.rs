//! Property-Based Tests for pool capacity and backoff invariants
//!
//! These tests drive random acquire/release sequences against a real pool
//! and check the retry policy's delay arithmetic for arbitrary inputs.

use std::time::{Duration, Instant};

use proptest::prelude::*;
use tempfile::TempDir;
use tidepool::{AccessMode, ConnectionInfo, ConnectionId, PoolConfigBuilder, PooledConnection, RetryPolicy, SqlitePool};

#[derive(Debug, Clone)]
enum Step {
    Acquire(AccessMode),
    Release(usize),
}

fn access_strategy() -> impl Strategy<Value = AccessMode> {
    prop_oneof![Just(AccessMode::ReadOnly), Just(AccessMode::ReadWrite)]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        access_strategy().prop_map(Step::Acquire),
        any::<usize>().prop_map(Step::Release),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: active connections never exceed max_size and at least one
    /// write connection always exists.
    #[test]
    fn prop_active_count_bounded(
        max_size in 1usize..5,
        initial_read_only in 0usize..4,
        steps in prop::collection::vec(step_strategy(), 1..40),
    ) {
        let initial_read_only = initial_read_only.min(max_size - 1);
        let dir = TempDir::new().unwrap();
        let config = PoolConfigBuilder::new()
            .max_size(max_size)
            .initial_read_only(initial_read_only)
            .stale_threshold(Duration::from_secs(3600))
            .build()
            .unwrap();
        let pool = SqlitePool::open(dir.path().join("prop.db"), config).unwrap();
        let mut held: Vec<PooledConnection> = Vec::new();

        for step in steps {
            match step {
                Step::Acquire(access) => {
                    if let Ok(conn) = pool.acquire(access) {
                        prop_assert!(conn.access().satisfies(access));
                        held.push(conn);
                    }
                }
                Step::Release(pick) => {
                    if !held.is_empty() {
                        let conn = held.swap_remove(pick % held.len());
                        pool.release(conn);
                    }
                }
            }

            let stats = pool.statistics().unwrap();
            prop_assert!(pool.active_count() <= max_size);
            prop_assert_eq!(pool.active_count(), held.len());
            prop_assert!(stats.total_connections <= max_size);
            prop_assert!(stats.write_connections >= 1);
        }
    }

    /// Property: a released connection is reused by the next compatible
    /// acquire without creating a new one.
    #[test]
    fn prop_release_then_acquire_reuses(access in access_strategy(), rounds in 1usize..6) {
        let dir = TempDir::new().unwrap();
        let config = PoolConfigBuilder::new().max_size(3).initial_read_only(1).build().unwrap();
        let pool = SqlitePool::open(dir.path().join("reuse.db"), config).unwrap();

        let first = pool.acquire(access).unwrap();
        let id = first.id();
        pool.release(first);
        let created = pool.statistics().unwrap().connections_created;

        for _ in 0..rounds {
            let conn = pool.acquire(access).unwrap();
            prop_assert_eq!(conn.id(), id);
            pool.release(conn);
        }
        prop_assert_eq!(pool.statistics().unwrap().connections_created, created);
    }

    /// Property: un-jittered delay doubles per attempt from the base.
    #[test]
    fn prop_delay_is_exponential(base_ms in 1u64..500, attempt in 1u32..12) {
        let policy = RetryPolicy::new(20, Duration::from_millis(base_ms));
        prop_assert_eq!(policy.delay_for(1), Duration::from_millis(base_ms));
        prop_assert_eq!(policy.delay_for(attempt + 1), policy.delay_for(attempt) * 2);
    }

    /// Property: jitter keeps every delay within [0.5, 1.0] of the nominal value.
    #[test]
    fn prop_jitter_within_bounds(base_ms in 1u64..1000, attempt in 1u32..10) {
        let policy = RetryPolicy::new(10, Duration::from_millis(base_ms));
        let nominal = policy.delay_for(attempt);
        let jittered = policy.jittered_delay(attempt);
        prop_assert!(jittered >= nominal.mul_f64(0.5) - Duration::from_nanos(1));
        prop_assert!(jittered <= nominal);
    }

    /// Property: retry budget counts the first attempt.
    #[test]
    fn prop_should_retry_respects_budget(max_attempts in 0u32..10, attempt in 1u32..12) {
        let policy = RetryPolicy::new(max_attempts, Duration::from_millis(10));
        prop_assert!(policy.max_attempts() >= 1);
        prop_assert_eq!(policy.should_retry(attempt), attempt < policy.max_attempts());
        prop_assert!(policy.min_total_delay() <= policy.max_total_delay());
    }

    /// Property: an idle connection is never stalled, however old.
    #[test]
    fn prop_idle_connection_never_stalled(idle_secs in 0u64..100_000, threshold_ms in 0u64..60_000) {
        let touched = Instant::now();
        let info = ConnectionInfo {
            id: ConnectionId::generate(),
            access: AccessMode::ReadWrite,
            in_use: false,
            created_at: touched,
            last_used: touched,
            operation_count: 1,
        };
        let now = touched + Duration::from_secs(idle_secs);
        prop_assert!(!info.is_stalled_at(Duration::from_millis(threshold_ms), now));
    }
}
