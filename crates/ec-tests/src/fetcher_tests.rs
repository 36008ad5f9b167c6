//! Block fetcher tests.
//!
//! Announcement handling, rate limits, broadcast validation and import of
//! propagated blocks with missing parents.

use crate::generators::build_chain;
use crate::harness::{test_config, Behavior, TestNet};
use ec_network::{Block, Meter, Penalties, Timer};
use ec_sync::{AnnounceOutcome, ChainStore};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Announcements
// ============================================================================

#[tokio::test]
async fn test_announced_blocks_fetched_and_imported() {
    let chain = Arc::new(build_chain(22, 1));
    let net = TestNet::new(&chain, 20);
    let peer = net.add_peer(1, &chain, 22, Behavior::Honest);
    let fetcher = net.fetcher();

    for number in [21, 22] {
        let outcome = fetcher
            .announce(&peer, chain.blocks[number].hash(), number as u64)
            .await;
        assert_eq!(outcome, AnnounceOutcome::Queued);
    }
    assert_eq!(fetcher.pending_announcements(), 2);

    let summary = fetcher.fetch_pending().await.unwrap();

    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.imported, 2);
    assert_eq!(summary.discarded, 0);
    assert_eq!(net.chain.height(), 22);
    assert_eq!(fetcher.pending_announcements(), 0);
    assert_eq!(fetcher.queued_blocks(), 0);

    assert_eq!(net.metrics.get(Meter::AnnounceIn), 2);
    assert_eq!(net.metrics.get(Meter::HeaderFetch), 2);
    assert_eq!(net.metrics.get(Meter::FilterHeadersOut), 2);
    // Block 21 has no transactions, so only block 22 needs a body.
    assert_eq!(net.metrics.get(Meter::BodyFetch), 1);
    assert_eq!(net.metrics.samples(Timer::AnnounceOut), 2);
}

#[tokio::test]
async fn test_duplicate_announcements_dropped() {
    let chain = Arc::new(build_chain(21, 1));
    let net = TestNet::new(&chain, 20);
    let a = net.add_peer(1, &chain, 21, Behavior::Honest);
    let b = net.add_peer(2, &chain, 21, Behavior::Honest);
    let fetcher = net.fetcher();
    let hash = chain.blocks[21].hash();

    assert_eq!(fetcher.announce(&a, hash, 21).await, AnnounceOutcome::Queued);
    assert_eq!(fetcher.announce(&b, hash, 21).await, AnnounceOutcome::Duplicate);
    // Already in the local chain.
    let known = chain.blocks[20].hash();
    assert_eq!(fetcher.announce(&a, known, 20).await, AnnounceOutcome::Duplicate);

    fetcher.fetch_pending().await.unwrap();
    assert_eq!(fetcher.announce(&b, hash, 21).await, AnnounceOutcome::Duplicate);
    assert_eq!(net.network.requests_to(&b).len(), 0);
    assert_eq!(net.metrics.get(Meter::AnnounceDrop), 3);
}

#[tokio::test]
async fn test_announce_flood_limited_per_peer() {
    let chain = Arc::new(build_chain(40, 1));
    let net = TestNet::new(&chain, 20);
    let flooder = net.add_peer(1, &chain, 40, Behavior::Honest);
    let other = net.add_peer(2, &chain, 40, Behavior::Honest);
    let fetcher = net.fetcher();

    let mut outcomes = Vec::new();
    for number in 21..=32u64 {
        let hash = chain.blocks[number as usize].hash();
        outcomes.push(fetcher.announce(&flooder, hash, number).await);
    }

    let queued = outcomes.iter().filter(|o| **o == AnnounceOutcome::Queued).count();
    let limited = outcomes
        .iter()
        .filter(|o| **o == AnnounceOutcome::RateLimited)
        .count();
    assert_eq!(queued, 8);
    assert_eq!(limited, 4);
    assert_eq!(net.metrics.get(Meter::AnnounceDos), 4);

    let hash = chain.blocks[33].hash();
    assert_eq!(
        fetcher.announce(&other, hash, 33).await,
        AnnounceOutcome::Queued
    );

    // Charged once per window, however far over budget.
    let penalty = |id| net.registry.get_peer(id).map(|p| p.score.current_penalty());
    assert_eq!(penalty(&flooder), Some(Penalties::ANNOUNCEMENT_FLOOD));
    assert_eq!(penalty(&other), Some(0));
}

#[tokio::test]
async fn test_announcement_distance_bounds() {
    let chain = Arc::new(build_chain(60, 1));
    let net = TestNet::new(&chain, 30);
    let peer = net.add_peer(1, &chain, 60, Behavior::Honest);
    let fetcher = net.fetcher();
    let max_dist = net.config.fetcher.max_queue_dist;

    let far = 30 + max_dist + 1;
    let outcome = fetcher
        .announce(&peer, chain.blocks[far as usize].hash(), far)
        .await;
    assert_eq!(outcome, AnnounceOutcome::OutOfRange);

    let stale = ec_network::Hash::digest(b"old uncle");
    let outcome = fetcher
        .announce(&peer, stale, 30 - net.config.fetcher.max_uncle_dist - 1)
        .await;
    assert_eq!(outcome, AnnounceOutcome::OutOfRange);
    assert_eq!(fetcher.pending_announcements(), 0);
}

#[tokio::test]
async fn test_stale_announcements_expire() {
    let chain = Arc::new(build_chain(21, 1));
    let mut config = test_config();
    config.fetcher.announce_ttl_ms = 30;
    let net = TestNet::with_config(&chain, 20, config);
    let peer = net.add_peer(1, &chain, 21, Behavior::Honest);
    let fetcher = net.fetcher();

    fetcher.announce(&peer, chain.blocks[21].hash(), 21).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(fetcher.expire(), 1);
    assert_eq!(fetcher.pending_announcements(), 0);
    assert!(net.network.requests().is_empty());
}

#[tokio::test]
async fn test_unavailable_announced_block_discarded() {
    let chain = Arc::new(build_chain(21, 1));
    let net = TestNet::new(&chain, 20);
    // Announces a block it cannot serve.
    let peer = net.add_peer(1, &chain, 20, Behavior::Honest);
    let fetcher = net.fetcher();

    fetcher.announce(&peer, chain.blocks[21].hash(), 21).await;
    let summary = fetcher.fetch_pending().await.unwrap();

    assert_eq!(summary.fetched, 0);
    assert_eq!(summary.discarded, 1);
    assert_eq!(net.chain.height(), 20);
    let penalty = net.registry.get_peer(&peer).unwrap().score.current_penalty();
    assert_eq!(penalty, 0);
}

#[tokio::test]
async fn test_forget_peer_drops_its_announcements() {
    let chain = Arc::new(build_chain(24, 1));
    let net = TestNet::new(&chain, 20);
    let a = net.add_peer(1, &chain, 24, Behavior::Honest);
    let b = net.add_peer(2, &chain, 24, Behavior::Honest);
    let fetcher = net.fetcher();

    fetcher.announce(&a, chain.blocks[21].hash(), 21).await;
    fetcher.announce(&a, chain.blocks[22].hash(), 22).await;
    fetcher.announce(&b, chain.blocks[23].hash(), 23).await;

    fetcher.forget_peer(&a);
    assert_eq!(fetcher.pending_announcements(), 1);
}

// ============================================================================
// Broadcasts
// ============================================================================

#[tokio::test]
async fn test_broadcast_imported_directly() {
    let chain = Arc::new(build_chain(21, 1));
    let net = TestNet::new(&chain, 20);
    let peer = net.add_peer(1, &chain, 21, Behavior::Honest);
    let fetcher = net.fetcher();
    let block = chain.blocks[21].clone();

    assert_eq!(
        fetcher.announce(&peer, block.hash(), 21).await,
        AnnounceOutcome::Queued
    );
    assert_eq!(fetcher.broadcast(&peer, block).await, AnnounceOutcome::Queued);
    // The broadcast supersedes the announcement.
    assert_eq!(fetcher.pending_announcements(), 0);

    let summary = fetcher.fetch_pending().await.unwrap();

    assert_eq!(summary.imported, 1);
    assert!(net.network.requests().is_empty());
    assert_eq!(net.metrics.get(Meter::BroadcastIn), 1);
    assert_eq!(net.metrics.samples(Timer::BroadcastOut), 1);
    assert!(net.seen.contains(&chain.blocks[21].hash()));
}

#[tokio::test]
async fn test_invalid_broadcast_penalized() {
    let chain = Arc::new(build_chain(21, 1));
    let net = TestNet::new(&chain, 20);
    let peer = net.add_peer(1, &chain, 21, Behavior::Honest);
    let fetcher = net.fetcher();

    let mut block: Block = chain.blocks[21].clone();
    block.body.transactions.push(b"smuggled".to_vec());

    assert_eq!(fetcher.broadcast(&peer, block).await, AnnounceOutcome::Invalid);
    assert_eq!(fetcher.queued_blocks(), 0);
    let penalty = net.registry.get_peer(&peer).unwrap().score.current_penalty();
    assert_eq!(penalty, Penalties::INVALID_BLOCK);
    assert_eq!(net.metrics.get(Meter::BroadcastDrop), 1);
}

#[tokio::test]
async fn test_broadcast_flood_limited() {
    let chain = Arc::new(build_chain(30, 1));
    let net = TestNet::new(&chain, 20);
    let peer = net.add_peer(1, &chain, 30, Behavior::Honest);
    let fetcher = net.fetcher();
    let limit = net.config.fetcher.broadcast_limit;

    let mut limited = 0;
    for number in 21..=26 {
        let outcome = fetcher.broadcast(&peer, chain.blocks[number].clone()).await;
        if outcome == AnnounceOutcome::RateLimited {
            limited += 1;
        }
    }

    assert_eq!(limited, 6 - limit);
    assert_eq!(fetcher.queued_blocks(), limit);
    assert_eq!(net.metrics.get(Meter::BroadcastDos), (6 - limit) as u64);
    let penalty = net.registry.get_peer(&peer).map(|p| p.score.current_penalty());
    assert_eq!(penalty, Some(Penalties::ANNOUNCEMENT_FLOOD));
}

#[tokio::test]
async fn test_missing_parents_fetched_from_origin() {
    let chain = Arc::new(build_chain(24, 1));
    let net = TestNet::new(&chain, 20);
    let peer = net.add_peer(1, &chain, 24, Behavior::Honest);
    let fetcher = net.fetcher();

    let outcome = fetcher.broadcast(&peer, chain.blocks[24].clone()).await;
    assert_eq!(outcome, AnnounceOutcome::Queued);
    let summary = fetcher.fetch_pending().await.unwrap();

    assert_eq!(summary.imported, 4);
    assert_eq!(net.chain.height(), 24);
    assert!(net.chain.has_block(&chain.blocks[22].hash()).await);
    for block in &chain.blocks[21..=24] {
        assert!(net.seen.contains(&block.hash()));
    }
}

#[tokio::test]
async fn test_orphan_beyond_parent_depth_discarded() {
    let chain = Arc::new(build_chain(33, 1));
    let net = TestNet::new(&chain, 20);
    let peer = net.add_peer(1, &chain, 33, Behavior::Honest);
    let fetcher = net.fetcher();
    let depth = net.config.fetcher.max_parent_depth;

    fetcher.broadcast(&peer, chain.blocks[33].clone()).await;
    let summary = fetcher.fetch_pending().await.unwrap();

    assert_eq!(summary.imported, 0);
    assert_eq!(summary.discarded, 1);
    assert_eq!(net.chain.height(), 20);
    let header_requests = net
        .network
        .requests_to(&peer)
        .iter()
        .filter(|r| matches!(r, ec_network::Request::Headers { .. }))
        .count();
    assert_eq!(header_requests, depth);
}
