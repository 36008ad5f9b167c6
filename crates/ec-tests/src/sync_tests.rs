//! Chain download tests.
//!
//! Full, fast and light sync against scripted peers, fork handling,
//! misbehaving peers, cancellation and state sync resumption.

use crate::generators::{build_chain, extend_chain, TestChain};
use crate::harness::{test_config, Behavior, TestNet};
use ec_network::{Block, Hash, Penalties, Request};
use ec_sync::{ChainStore, StateSyncCheckpoint, SyncError, SyncMode, SyncStage};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn hashes(chain: &TestChain, height: u64) -> Vec<Hash> {
    chain.blocks[..=height as usize].iter().map(Block::hash).collect()
}

fn penalized_or_banned(net: &TestNet, peer: &ec_network::PeerId) -> bool {
    net.registry.is_banned(peer)
        || net
            .registry
            .get_peer(peer)
            .map_or(false, |p| p.score.current_penalty() > 0)
}

// ============================================================================
// Full sync
// ============================================================================

#[tokio::test]
async fn test_full_sync_from_genesis() {
    let chain = Arc::new(build_chain(150, 1));
    let net = TestNet::new(&chain, 0);
    let target = net.add_peer(1, &chain, 150, Behavior::Honest);
    net.add_peer(2, &chain, 150, Behavior::Honest);
    net.add_peer(3, &chain, 120, Behavior::Honest);
    let downloader = net.downloader(SyncMode::Full);

    let report = downloader.synchronise().await.unwrap().unwrap();

    assert_eq!(report.peer, target);
    assert_eq!(report.ancestor, 0);
    assert_eq!(report.head, 150);
    assert_eq!(report.committed, 150);
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 150));
    assert!(net.chain.has_block(&chain.blocks[150].hash()).await);
    assert_eq!(downloader.stage(), SyncStage::Idle);
    assert_eq!(downloader.progress().current_block, 150);
    assert!(net.seen.contains(&chain.blocks[100].hash()));
    assert!(net.registry.busy_peers().is_empty());
}

#[tokio::test]
async fn test_headers_spread_across_peers() {
    let chain = Arc::new(build_chain(64, 1));
    let net = TestNet::new(&chain, 0);
    let delay = Behavior::Slow(Duration::from_millis(20));
    let peers: Vec<_> = (1..=3).map(|n| net.add_peer(n, &chain, 64, delay)).collect();

    net.downloader(SyncMode::Full).synchronise().await.unwrap();

    for peer in &peers {
        assert!(
            !net.network.requests_to(peer).is_empty(),
            "peer {} got no work",
            peer
        );
    }
    assert_eq!(net.chain.height(), 64);
}

#[tokio::test]
async fn test_no_taller_peer_is_noop() {
    let chain = Arc::new(build_chain(50, 1));
    let net = TestNet::new(&chain, 50);
    net.add_peer(1, &chain, 50, Behavior::Honest);
    net.add_peer(2, &chain, 30, Behavior::Honest);

    let result = net.downloader(SyncMode::Full).synchronise().await.unwrap();

    assert!(result.is_none());
    assert!(net.network.requests().is_empty());
}

#[tokio::test]
async fn test_concurrent_cycle_is_busy() {
    let chain = Arc::new(build_chain(40, 1));
    let net = TestNet::new(&chain, 0);
    net.add_peer(1, &chain, 40, Behavior::Slow(Duration::from_millis(20)));
    let downloader = net.downloader(SyncMode::Full);

    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        downloader.synchronise().await
    };
    let (first, second) = tokio::join!(downloader.synchronise(), second);

    assert!(first.unwrap().is_some());
    assert_eq!(second.unwrap_err(), SyncError::Busy);
    assert!(!downloader.is_running());
}

// ============================================================================
// Common ancestor
// ============================================================================

#[tokio::test]
async fn test_fork_found_by_search() {
    let base = build_chain(90, 1);
    let fork = Arc::new(extend_chain(&base, 60, 120, 2));
    let net = TestNet::new(&base, 90);
    net.add_peer(1, &fork, 120, Behavior::Honest);

    let report = net
        .downloader(SyncMode::Full)
        .synchronise()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.ancestor, 60);
    assert_eq!(report.committed, 60);
    assert_eq!(net.chain.canonical_hashes(), hashes(&fork, 120));
}

#[tokio::test]
async fn test_extension_without_fork() {
    let chain = Arc::new(build_chain(130, 1));
    let net = TestNet::new(&chain, 90);
    net.add_peer(1, &chain, 130, Behavior::Honest);

    let report = net
        .downloader(SyncMode::Full)
        .synchronise()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.ancestor, 90);
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 130));
}

#[tokio::test]
async fn test_ancestor_from_local_index() {
    let base = build_chain(90, 1);
    let fork = Arc::new(extend_chain(&base, 60, 120, 2));
    let net = TestNet::new(&base, 90);
    net.chain.set_known_ancestor(Some(60));
    net.add_peer(1, &fork, 120, Behavior::Honest);

    let report = net
        .downloader(SyncMode::Full)
        .synchronise()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.ancestor, 60);
    assert_eq!(net.chain.canonical_hashes(), hashes(&fork, 120));
    // No single-header bisection probes were needed.
    let probes = net
        .network
        .requests()
        .into_iter()
        .filter(|(_, r)| matches!(r, Request::Headers { amount: 1, .. }))
        .count();
    assert_eq!(probes, 0);
}

#[tokio::test]
async fn test_fork_below_floor_rejected() {
    let base = build_chain(90, 1);
    let fork = Arc::new(extend_chain(&base, 60, 120, 2));
    let mut config = test_config();
    config.downloader.max_fork_ancestry = 10;
    let net = TestNet::with_config(&base, 90, config);
    net.add_peer(1, &fork, 120, Behavior::Honest);

    let err = net
        .downloader(SyncMode::Full)
        .synchronise()
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::InconsistentData(_)));
    assert_eq!(net.chain.height(), 90);
    assert_eq!(net.chain.canonical_hashes(), hashes(&base, 90));
}

// ============================================================================
// Misbehaving peers
// ============================================================================

#[tokio::test]
async fn test_broken_linkage_peer_penalized() {
    let chain = Arc::new(build_chain(100, 1));
    let net = TestNet::new(&chain, 0);
    net.add_peer(1, &chain, 100, Behavior::Slow(Duration::from_millis(10)));
    let liar = net.add_peer(2, &chain, 100, Behavior::BrokenLinkage);

    net.downloader(SyncMode::Full).synchronise().await.unwrap();

    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 100));
    assert!(!net.network.requests_to(&liar).is_empty());
    assert!(penalized_or_banned(&net, &liar));
}

#[tokio::test]
async fn test_forged_range_tail_blamed_on_server() {
    let chain = Arc::new(build_chain(100, 1));
    let net = TestNet::new(&chain, 0);
    let honest = net.add_peer(1, &chain, 100, Behavior::Slow(Duration::from_millis(10)));
    let liar = net.add_peer(2, &chain, 100, Behavior::ForgedTail);

    net.downloader(SyncMode::Full).synchronise().await.unwrap();

    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 100));
    assert!(!net.network.requests_to(&liar).is_empty());
    assert!(penalized_or_banned(&net, &liar));
    let honest_penalty = net
        .registry
        .get_peer(&honest)
        .map(|p| p.score.current_penalty());
    assert_eq!(honest_penalty, Some(0));
}

#[tokio::test]
async fn test_corrupt_bodies_refetched() {
    let chain = Arc::new(build_chain(60, 1));
    let net = TestNet::new(&chain, 0);
    net.add_peer(1, &chain, 60, Behavior::Slow(Duration::from_millis(10)));
    let corrupt = net.add_peer(2, &chain, 60, Behavior::CorruptData);

    net.downloader(SyncMode::Full).synchronise().await.unwrap();

    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 60));
    assert!(net
        .network
        .requests_to(&corrupt)
        .iter()
        .any(|r| matches!(r, Request::Bodies(_))));
    assert!(penalized_or_banned(&net, &corrupt));
}

#[tokio::test]
async fn test_forged_skeleton_blamed_on_target() {
    let chain = Arc::new(build_chain(100, 1));
    let net = TestNet::new(&chain, 0);
    let forger = net.add_peer(1, &chain, 100, Behavior::ForgedSkeleton);
    let fillers = [
        net.add_peer(2, &chain, 100, Behavior::Honest),
        net.add_peer(3, &chain, 100, Behavior::Honest),
    ];
    let downloader = net.downloader(SyncMode::Full);

    let err = downloader.synchronise().await.unwrap_err();
    assert!(matches!(err, SyncError::PeerFault { ref peer, .. } if *peer == forger));
    assert_eq!(net.chain.height(), 0);
    let penalty = |id| net.registry.get_peer(id).map(|p| p.score.current_penalty());
    assert_eq!(penalty(&forger), Some(Penalties::BROKEN_CHAIN));
    for filler in &fillers {
        assert_eq!(penalty(filler), Some(0));
    }

    // The next cycle picks another target.
    let report = downloader.synchronise().await.unwrap().unwrap();
    assert_ne!(report.peer, forger);
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 100));
    assert!(net.registry.busy_peers().is_empty());
}

#[tokio::test]
async fn test_insertion_failure_then_recovery() {
    let chain = Arc::new(build_chain(40, 1));
    let net = TestNet::new(&chain, 0);
    net.add_peer(1, &chain, 40, Behavior::Honest);
    let downloader = net.downloader(SyncMode::Full);

    net.chain.fail_next_block_inserts(1);
    let err = downloader.synchronise().await.unwrap_err();
    assert!(matches!(err, SyncError::InsertionFailure(_)));
    assert_eq!(net.chain.height(), 0);

    downloader.synchronise().await.unwrap();
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 40));
}

// ============================================================================
// Fast and light sync
// ============================================================================

#[tokio::test]
async fn test_fast_sync_receipts_and_state() {
    let chain = Arc::new(build_chain(100, 1));
    let net = TestNet::new(&chain, 0);
    net.add_peer(1, &chain, 100, Behavior::Honest);
    net.add_peer(2, &chain, 100, Behavior::Honest);

    let report = net
        .downloader(SyncMode::Fast)
        .synchronise()
        .await
        .unwrap()
        .unwrap();

    let pivot = 100 - net.config.downloader.pivot_depth;
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 100));
    for block in &chain.blocks[1..] {
        assert_eq!(
            net.chain.has_receipts(&block.hash()),
            block.number() <= pivot,
            "receipts of block {}",
            block.number()
        );
    }
    assert_eq!(net.chain.state_nodes(), chain.state.len());
    assert_eq!(report.state_nodes, chain.state.len() as u64);
}

#[tokio::test]
async fn test_fast_sync_skips_stored_state() {
    let chain = Arc::new(build_chain(40, 1));
    let net = TestNet::new(&chain, 0);
    net.add_peer(1, &chain, 40, Behavior::Honest);
    // Everything below the root is already here.
    net.chain.preload_state(
        chain
            .state
            .nodes
            .iter()
            .filter(|(h, _)| **h != chain.state.root)
            .map(|(h, b)| (*h, b.clone())),
    );

    net.downloader(SyncMode::Fast).synchronise().await.unwrap();

    assert_eq!(net.network.requested_nodes(), vec![chain.state.root]);
    assert_eq!(net.chain.state_nodes(), chain.state.len());
}

#[tokio::test]
async fn test_light_sync_headers_only() {
    let chain = Arc::new(build_chain(80, 1));
    let net = TestNet::new(&chain, 0);
    net.add_peer(1, &chain, 80, Behavior::Honest);

    let report = net
        .downloader(SyncMode::Light)
        .synchronise()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.head, 80);
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 80));
    assert!(!net.chain.has_block(&chain.blocks[80].hash()).await);
    assert!(net
        .network
        .requests()
        .iter()
        .all(|(_, r)| matches!(r, Request::Headers { .. })));
}

// ============================================================================
// Cancellation and resumption
// ============================================================================

#[tokio::test]
async fn test_cancel_leaves_chain_consistent() {
    let chain = Arc::new(build_chain(200, 1));
    let net = TestNet::new(&chain, 0);
    let delay = Behavior::Slow(Duration::from_millis(15));
    net.add_peer(1, &chain, 200, delay);
    net.add_peer(2, &chain, 200, delay);
    let downloader = net.downloader(SyncMode::Full);

    let canceller = async {
        while net.chain.height() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        downloader.cancel();
    };
    let (result, ()) = tokio::join!(downloader.synchronise(), canceller);

    assert_eq!(result.unwrap_err(), SyncError::Canceled);
    let height = net.chain.height();
    assert!(height < 200);
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, height));
    assert!(net.registry.busy_peers().is_empty());
    assert!(!downloader.is_running());

    // A fresh cycle picks up where the last one stopped.
    let report = downloader.synchronise().await.unwrap().unwrap();
    assert_eq!(report.ancestor, height);
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 200));
}

#[tokio::test]
async fn test_peer_dropped_mid_sync_work_requeued() {
    let chain = Arc::new(build_chain(150, 1));
    let net = TestNet::new(&chain, 0);
    let delay = Behavior::Slow(Duration::from_millis(15));
    net.add_peer(1, &chain, 150, delay);
    let dropped = net.add_peer(2, &chain, 150, delay);
    let downloader = net.downloader(SyncMode::Full);

    let dropper = async {
        while net.chain.height() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        net.registry.unregister(&dropped);
    };
    let (result, ()) = tokio::join!(downloader.synchronise(), dropper);

    result.unwrap().unwrap();
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 150));
    assert!(!net.registry.contains(&dropped));
    assert!(net.registry.busy_peers().is_empty());
}

#[tokio::test]
async fn test_state_sync_resumes_from_checkpoint_file() {
    let chain = Arc::new(build_chain(40, 1));
    let net = TestNet::new(&chain, 0);
    net.add_peer(1, &chain, 40, Behavior::Slow(Duration::from_millis(40)));
    let first = net.downloader(SyncMode::Fast);

    let canceller = async {
        while net.chain.state_nodes() < 10 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        first.cancel();
    };
    let (result, ()) = tokio::join!(first.synchronise(), canceller);
    assert_eq!(result.unwrap_err(), SyncError::Canceled);

    let checkpoint = first.state_checkpoint().expect("checkpoint kept");
    assert_eq!(checkpoint.root, chain.state.root);
    assert!(!checkpoint.pending.is_empty());
    let mut stored = HashSet::new();
    for hash in chain.state.nodes.keys() {
        if net.chain.has_state_node(hash).await {
            stored.insert(*hash);
        }
    }
    assert!(stored.len() < chain.state.len());
    assert!(checkpoint.pending.iter().all(|h| !stored.contains(h)));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state-sync.json");
    checkpoint.save(&path).unwrap();
    let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["number"], serde_json::json!(checkpoint.number));

    let before = net.network.requested_nodes().len();
    let second = net.downloader(SyncMode::Fast);
    second.restore_state_checkpoint(StateSyncCheckpoint::load(&path).unwrap());
    second.synchronise().await.unwrap();

    let requested: Vec<Hash> = net.network.requested_nodes().split_off(before);
    assert!(!requested.is_empty());
    assert!(requested.iter().all(|h| !stored.contains(h)));
    assert_eq!(net.chain.state_nodes(), chain.state.len());
    assert!(second.state_checkpoint().is_none());
}

#[tokio::test]
async fn test_run_loop_follows_new_peers() {
    let chain = Arc::new(build_chain(30, 1));
    let net = TestNet::new(&chain, 0);
    let downloader = net.downloader(SyncMode::Full);

    let driver = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(downloader.stage(), SyncStage::WaitingForPeers);

        net.add_peer(1, &chain, 30, Behavior::Honest);
        let synced = tokio::time::timeout(Duration::from_secs(5), async {
            while net.chain.height() < 30 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        downloader.shutdown();
        synced
    };
    let ((), synced) = tokio::join!(downloader.run(), driver);

    synced.expect("run loop did not sync after a peer joined");
    assert_eq!(downloader.stage(), SyncStage::Idle);
    assert_eq!(net.chain.canonical_hashes(), hashes(&chain, 30));
}
