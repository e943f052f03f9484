//! Property-based tests using proptest.
//!
//! Backoff schedule, close-status classification and checkpoint identity.

use docsync_engine::{
    checkpoint_id, classify, CloseKind, CloseStatus, ErrorClass, ReplicatorConfig, RetryPolicy,
};
use proptest::prelude::*;
use std::time::Duration;
use uuid::Uuid;

fn config() -> ReplicatorConfig {
    ReplicatorConfig::new("wss://sync.example.com/db".parse().unwrap())
}

proptest! {
    /// Delays never shrink from one attempt to the next.
    #[test]
    fn backoff_is_monotonic(attempt in 0u32..200, cap_secs in 1u64..10_000) {
        let policy = RetryPolicy::unlimited().with_max_wait(Duration::from_secs(cap_secs));
        prop_assert!(policy.delay_for_attempt(attempt) <= policy.delay_for_attempt(attempt + 1));
    }

    /// Delays never exceed the configured cap.
    #[test]
    fn backoff_is_capped(attempt in any::<u32>(), cap_secs in 1u64..10_000) {
        let cap = Duration::from_secs(cap_secs);
        let policy = RetryPolicy::unlimited().with_max_wait(cap);
        prop_assert!(policy.delay_for_attempt(attempt) <= cap);
    }

    /// A budget of `n` allows exactly `n` retries.
    #[test]
    fn budget_allows_exactly_n(n in 0u32..100, retries in 0u32..200) {
        prop_assert_eq!(RetryPolicy::new(n).allows(retries), retries < n);
    }

    /// Client errors other than 408 and 429 are never retried.
    #[test]
    fn http_client_errors_are_permanent(status in 400u16..500) {
        prop_assume!(status != 408 && status != 429);
        let close = CloseStatus::new(CloseKind::Http(status), "rejected");
        prop_assert_eq!(classify(&close), ErrorClass::Permanent);
    }

    /// The checkpoint ID ignores the order channels and document IDs were given in.
    #[test]
    fn checkpoint_id_ignores_filter_order(
        channels in prop::collection::vec("[a-z]{1,6}", 0..5),
        doc_ids in prop::collection::vec("[a-z0-9]{1,6}", 0..5),
    ) {
        let local = Uuid::from_u128(42);
        let forward = config()
            .with_channels(channels.clone())
            .with_document_ids(doc_ids.clone());
        let reversed = config()
            .with_channels(channels.into_iter().rev())
            .with_document_ids(doc_ids.into_iter().rev());
        prop_assert_eq!(checkpoint_id(local, &forward), checkpoint_id(local, &reversed));
    }
}

#[test]
fn checkpoint_id_depends_on_direction() {
    let local = Uuid::from_u128(7);
    let push = config().with_type(docsync_engine::ReplicatorType::Push);
    let pull = config().with_type(docsync_engine::ReplicatorType::Pull);
    assert_ne!(checkpoint_id(local, &push), checkpoint_id(local, &pull));
}
