//! Property-Based Tests for Queue Ordering and Latency Statistics
//!
//! These tests check invariants that must hold for any input: delivery
//! order of the priority queues, stamp comparison and the statistics the
//! performance monitor relies on.

use databridge::core::PriorityQueue;
use databridge::core::clients::{population_std_dev, round3};
use databridge::core::types::{compare_stamps, is_current};
use proptest::prelude::*;
use std::cmp::Ordering;

fn priority_strategy() -> impl Strategy<Value = Option<i64>> {
    prop_oneof![Just(None), (0i64..5).prop_map(Some), (1000i64..1010).prop_map(Some)]
}

fn stamp_strategy() -> impl Strategy<Value = String> {
    (1_600_000_000i64..1_800_000_000, 0u32..1_000_000).prop_map(|(secs, micros)| {
        chrono::DateTime::from_timestamp(secs, micros * 1000)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string())
            .unwrap_or_default()
    })
}

proptest! {
    /// Property: entries pop in non-decreasing priority, ties in arrival order
    #[test]
    fn prop_queue_delivers_by_priority_then_arrival(
        priorities in prop::collection::vec(priority_strategy(), 0..64)
    ) {
        let queue = PriorityQueue::new("prop", 0);
        for (seq, priority) in priorities.iter().enumerate() {
            prop_assert!(queue.try_push(*priority, seq).is_ok());
        }

        let mut expected: Vec<(Option<i64>, usize)> =
            priorities.iter().copied().enumerate().map(|(seq, p)| (p, seq)).collect();
        expected.sort_by_key(|(priority, _)| *priority);

        let delivered = tokio_test::block_on(async {
            let mut delivered = Vec::new();
            for _ in 0..priorities.len() {
                delivered.push(queue.pop().await);
            }
            delivered
        });
        prop_assert!(queue.is_empty());
        prop_assert_eq!(delivered, expected);
    }

    /// Property: a bounded queue never holds more than its capacity
    #[test]
    fn prop_bounded_queue_rejects_overflow(
        capacity in 1i64..16,
        pushes in 0usize..32
    ) {
        let queue = PriorityQueue::new("bounded", capacity);
        let accepted = (0..pushes).filter(|i| queue.try_push(Some(0), *i).is_ok()).count();
        prop_assert_eq!(accepted, pushes.min(capacity as usize));
        prop_assert_eq!(queue.len(), accepted);
    }

    /// Property: standard deviation is non-negative and zero for constant samples
    #[test]
    fn prop_std_dev_non_negative(
        values in prop::collection::vec(0.0f64..10.0, 0..50),
        constant in 0.0f64..10.0,
        count in 1usize..20
    ) {
        prop_assert!(population_std_dev(&values) >= 0.0);
        prop_assert_eq!(population_std_dev(&vec![constant; count]), 0.0);
    }

    /// Property: rounding to milliseconds is idempotent
    #[test]
    fn prop_round3_idempotent(value in -1000.0f64..1000.0) {
        let once = round3(value);
        prop_assert_eq!(round3(once), once);
        prop_assert!((once - value).abs() <= 0.0005 + f64::EPSILON * 1000.0);
    }

    /// Property: stamp comparison is antisymmetric and a stamp covers itself
    #[test]
    fn prop_stamp_comparison_consistent(a in stamp_strategy(), b in stamp_strategy()) {
        prop_assert_eq!(compare_stamps(&a, &b), compare_stamps(&b, &a).reverse());
        prop_assert!(is_current(&a, &a));
        prop_assert_eq!(is_current(&a, &b), compare_stamps(&a, &b) != Ordering::Less);
    }
}
