//! Property-based tests for pure logic that doesn't need a live backend:
//! retry backoff bounds and the query catalog's version-gating monotonicity.

use pg_muster::catalog::get_applicable_queries;
use pg_muster::error::{RetryPolicy, RetryState};
use proptest::prelude::*;

proptest! {
    /// Backoff is always positive and never exceeds `max_delay_ms * 5 / 4`
    /// (the odd-attempt jitter multiplier is the largest applied).
    #[test]
    fn backoff_is_bounded(
        base in 1u64..5_000,
        max in 1u64..20_000,
        attempt in 0u32..32,
    ) {
        let policy = RetryPolicy { base_delay_ms: base, max_delay_ms: max, max_attempts: 10 };
        let delay = policy.backoff_ms(attempt);
        prop_assert!(delay > 0);
        prop_assert!(delay <= max.saturating_mul(5) / 4);
    }

    /// Backoff for attempt N+2 is never smaller than for attempt N: the
    /// underlying exponential term only grows, and the alternating jitter
    /// multiplier is the same at N and N+2.
    #[test]
    fn backoff_grows_every_other_attempt(
        base in 1u64..1_000,
        max in 1_000u64..20_000,
        attempt in 0u32..20,
    ) {
        let policy = RetryPolicy { base_delay_ms: base, max_delay_ms: max, max_attempts: 30 };
        prop_assert!(policy.backoff_ms(attempt + 2) >= policy.backoff_ms(attempt));
    }

    /// `should_retry` is a simple threshold; `backoff_ms` must stay
    /// well-defined (no panic, no overflow) for every attempt within it.
    #[test]
    fn should_retry_respects_max_attempts(max_attempts in 0u32..10, attempt in 0u32..32) {
        let policy = RetryPolicy { base_delay_ms: 100, max_delay_ms: 1_000, max_attempts };
        prop_assert_eq!(policy.should_retry(attempt), attempt < max_attempts);
    }

    /// Whatever sequence of failures a backend pool sees, `reset` always
    /// returns retry state to its fresh-start invariant.
    #[test]
    fn reset_always_clears_backoff_state(failures in 0u32..20) {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();
        for n in 0..failures {
            state.record_failure(&policy, (n as u64) * 1_000);
        }
        state.reset();
        prop_assert_eq!(state.attempts, 0);
        prop_assert!(!state.is_in_backoff(u64::MAX / 2));
    }

    /// The query catalog is monotonic in server version: a newer server
    /// never has fewer applicable queries than an older one, since version
    /// gates only add queries as thresholds are crossed (§4.A).
    #[test]
    fn catalog_applicability_is_monotonic_in_version(
        lower in 80_000i32..200_000,
        delta in 0i32..50_000,
    ) {
        let higher = lower + delta;
        let at_lower = get_applicable_queries(lower, 10_000).unwrap().len();
        let at_higher = get_applicable_queries(higher, 10_000).unwrap().len();
        prop_assert!(at_higher >= at_lower);
    }
}
