//! Property-Based Tests
//!
//! Invariants that must hold for any sequence of inputs: pool accounting,
//! retry attempt bounds and identifier validation.

use std::cell::Cell;

use proptest::prelude::*;
use resilite::{
    ConnectionPool, DbError, PoolConfig, PragmaConfig, RetryPolicy, SqlIdentifier,
    retry_with,
};
use tempfile::tempdir;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever mix of acquires and releases happens, the pool never exceeds
    /// its bound and every handle comes back
    #[test]
    fn prop_pool_accounting(max in 1usize..5, ops in prop::collection::vec(any::<bool>(), 1..24)) {
        let dir = tempdir().expect("tempdir");
        let pool = ConnectionPool::new(
            dir.path().join("prop.db"),
            PoolConfig::new(1, max, 10),
            PragmaConfig::default(),
        )
        .expect("pool");
        pool.initialize().expect("initialize");

        let mut held = Vec::new();
        for acquire in ops {
            if acquire {
                match pool.acquire() {
                    Ok(conn) => held.push(conn),
                    Err(DbError::PoolTimeout { .. }) => prop_assert_eq!(held.len(), max),
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }
            } else {
                held.pop();
            }

            let stats = pool.stats().expect("stats");
            prop_assert!(stats.total <= max);
            prop_assert_eq!(stats.in_use, held.len());
            prop_assert_eq!(stats.available + stats.in_use, stats.total);
        }

        held.clear();
        let stats = pool.stats().expect("stats");
        prop_assert_eq!(stats.in_use, 0);
        prop_assert_eq!(stats.available, stats.total);
    }

    /// The operation runs at most `max_attempts` times and stops at the
    /// first success
    #[test]
    fn prop_retry_attempt_bounds(max_attempts in 1u32..6, succeed_on in 1u32..9) {
        let policy = RetryPolicy::linear(max_attempts, std::time::Duration::ZERO);
        let calls = Cell::new(0u32);

        let outcome = retry_with(
            &policy,
            |attempt| {
                calls.set(calls.get() + 1);
                if attempt >= succeed_on { Ok(attempt) } else { Err("not yet") }
            },
            |_, _| true,
        );

        prop_assert!(calls.get() <= max_attempts);
        prop_assert_eq!(outcome.attempts, calls.get());
        if succeed_on <= max_attempts {
            prop_assert_eq!(outcome.result, Ok(succeed_on));
        } else {
            prop_assert!(outcome.result.is_err());
            prop_assert_eq!(outcome.attempts, max_attempts);
        }
    }

    /// Plain identifiers are accepted; anything carrying a quote or
    /// statement separator is not
    #[test]
    fn prop_identifier_validation(name in "[A-Za-z0-9_]{0,20}", junk in "[;'\" -]") {
        let name = format!("t_{}", name);
        prop_assert!(SqlIdentifier::new(name.as_str()).is_ok());
        let hostile = format!("{}{}x", name, junk);
        prop_assert!(SqlIdentifier::new(hostile).is_err());
    }
}
