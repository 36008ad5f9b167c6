//! Property-based tests using proptest.
//!
//! Task scheduling, in-order reassembly, backoff bounds and end-to-end
//! sync against randomly assembled peer sets.

use crate::generators::build_chain;
use crate::harness::{Behavior, TestNet};
use ec_network::{Block, PeerRegistryConfig};
use ec_sync::downloader::{ReorderBuffer, TaskQueue};
use ec_sync::{SyncMode, SyncTask};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Strategies
// ============================================================================

/// Inclusive range plus chunk size.
fn arb_range() -> impl Strategy<Value = (u64, u64, usize)> {
    (0u64..10_000, 0u64..500, 1usize..64).prop_map(|(start, len, chunk)| (start, start + len, chunk))
}

fn arb_misbehavior() -> impl Strategy<Value = Behavior> {
    prop_oneof![
        Just(Behavior::Honest),
        Just(Behavior::Slow(Duration::from_millis(5))),
        Just(Behavior::BrokenLinkage),
        Just(Behavior::ForgedTail),
        Just(Behavior::CorruptData),
        Just(Behavior::Empty),
    ]
}

// ============================================================================
// Task queue
// ============================================================================

proptest! {
    /// Tasks tile the range exactly and end on the range end.
    #[test]
    fn prop_queue_tiles_range((start, end, chunk) in arb_range()) {
        let mut queue = TaskQueue::new(start, end, chunk);
        let ends = queue.ends();
        prop_assert_eq!(ends.last().copied(), Some(end));

        let mut tasks = Vec::new();
        while let Some(task) = queue.reserve() {
            tasks.push(task);
        }
        prop_assert_eq!(tasks.first().map(|t| t.start), Some(start));
        for pair in tasks.windows(2) {
            prop_assert_eq!(pair[1].start, pair[0].end + 1);
        }
        for task in tasks.iter().skip(1) {
            prop_assert_eq!(task.len(), chunk);
        }
        prop_assert!(tasks.iter().all(|t| t.len() <= chunk));
        prop_assert_eq!(tasks.iter().map(|t| t.end).collect::<Vec<_>>(), ends);
    }

    /// In-flight tasks never overlap, whatever the completion order.
    #[test]
    fn prop_in_flight_disjoint(
        (start, end, chunk) in arb_range(),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 0..200),
    ) {
        let mut queue = TaskQueue::new(start, end, chunk);
        let mut reserved: Vec<SyncTask> = Vec::new();
        for pick in picks {
            if reserved.is_empty() || pick.index(3) > 0 {
                if let Some(task) = queue.reserve() {
                    reserved.push(task);
                }
            } else {
                let task = reserved.swap_remove(pick.index(reserved.len()));
                queue.complete(task);
            }

            let in_flight: Vec<&SyncTask> = queue.in_flight().collect();
            for (i, a) in in_flight.iter().enumerate() {
                for b in &in_flight[i + 1..] {
                    prop_assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
                }
            }
        }

        for task in reserved.drain(..) {
            queue.complete(task);
        }
        while let Some(task) = queue.reserve() {
            queue.complete(task);
        }
        prop_assert!(queue.is_done());
        prop_assert_eq!(queue.stats().completed, end - start + 1);
    }

    /// Out-of-order results come out ascending with no gaps or repeats.
    #[test]
    fn prop_reorder_buffer_in_order((start, end, chunk) in arb_range(), seed in any::<u64>()) {
        let mut queue = TaskQueue::new(start, end, chunk);
        let mut tasks = Vec::new();
        while let Some(task) = queue.reserve() {
            tasks.push(task);
        }
        tasks.shuffle(&mut StdRng::seed_from_u64(seed));

        let mut buffer = ReorderBuffer::new(start);
        let mut released = Vec::new();
        for task in tasks {
            buffer.insert(task, task.start);
            while let Some((task, first)) = buffer.pop() {
                prop_assert_eq!(first, task.start);
                released.extend(task.start..=task.end);
            }
        }

        prop_assert!(buffer.is_empty());
        prop_assert_eq!(buffer.next(), end + 1);
        prop_assert_eq!(released, (start..=end).collect::<Vec<_>>());
    }

    /// Backoff grows monotonically and never exceeds its cap.
    #[test]
    fn prop_backoff_bounded(base in 1u64..1_000, extra in 0u64..100_000, failures in 1u32..64) {
        let config = PeerRegistryConfig {
            backoff_base_ms: base,
            backoff_max_ms: base + extra,
            ..Default::default()
        };
        let cap = Duration::from_millis(base + extra);
        let now = config.backoff_delay(failures);
        let next = config.backoff_delay(failures + 1);
        prop_assert!(now <= next);
        prop_assert!(next <= cap);
        prop_assert!(config.backoff_delay(1) >= Duration::from_millis(base).min(cap));
    }
}

// ============================================================================
// End to end
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// One honest target plus any mix of other peers always yields the
    /// target's exact chain.
    #[test]
    fn prop_sync_with_mixed_peers(
        height in 20u64..90,
        local in 0u64..15,
        others in prop::collection::vec(arb_misbehavior(), 0..4),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let chain = Arc::new(build_chain(height, 7));
        let net = TestNet::new(&chain, local);
        net.add_peer(1, &chain, height, Behavior::Honest);
        for (i, behavior) in others.iter().enumerate() {
            net.add_peer(2 + i as u8, &chain, height, *behavior);
        }

        let report = runtime
            .block_on(net.downloader(SyncMode::Full).synchronise())
            .unwrap()
            .unwrap();

        prop_assert_eq!(report.ancestor, local);
        let expected: Vec<_> = chain.blocks.iter().map(Block::hash).collect();
        prop_assert_eq!(net.chain.canonical_hashes(), expected);
        prop_assert!(net.registry.busy_peers().is_empty());
    }
}
