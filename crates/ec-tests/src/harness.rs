//! Test harness for integration tests.
//!
//! Provides an in-memory chain store, a scripted peer network and a
//! [`TestNet`] fixture wiring them to the sync core with short timeouts.

use crate::generators::{peer_id, peer_info, TestChain};
use async_trait::async_trait;
use ec_network::{
    Block, CountingMetrics, Hash, Head, Header, HeaderOrigin, NetworkError, NetworkResult,
    PeerId, PeerRegistry, PeerTransport, Receipt, Request, Response, receipts_root,
};
use ec_sync::{
    ChainStore, Downloader, Fetcher, RequestDistributor, RetrieveManager, SeenBlocks, SyncConfig,
    SyncError, SyncMode, SyncResult,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::trace;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Sync configuration with small batches and short deadlines.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.peers.backoff_base_ms = 20;
    config.peers.backoff_max_ms = 200;
    config.distributor.request_timeout_ms = 300;
    config.distributor.peer_wait_ms = 500;
    config.distributor.max_attempts = 6;
    config.downloader.max_header_fetch = 16;
    config.downloader.max_body_fetch = 16;
    config.downloader.max_receipt_fetch = 16;
    config.downloader.max_state_fetch = 8;
    config.downloader.segment_size = 64;
    config.downloader.pivot_depth = 8;
    config.fetcher.announce_limit = 8;
    config.fetcher.broadcast_limit = 4;
    config.fetcher.max_queue_dist = 16;
    config
}

// ============================================================================
// In-memory chain
// ============================================================================

#[derive(Default)]
struct ChainInner {
    /// Canonical headers by number.
    canonical: Vec<Header>,
    /// Canonical blocks with bodies.
    blocks: HashSet<Hash>,
    /// Receipts stored by block hash.
    receipts: HashMap<Hash, Vec<Receipt>>,
    /// State nodes by hash.
    state: HashMap<Hash, Vec<u8>>,
}

impl ChainInner {
    fn truncate(&mut self, len: usize) {
        for header in self.canonical.drain(len.min(self.canonical.len())..) {
            let hash = header.hash();
            self.blocks.remove(&hash);
            self.receipts.remove(&hash);
        }
    }

    fn check_link(&self, first: &Header) -> SyncResult<()> {
        let parent = (first.number as usize)
            .checked_sub(1)
            .and_then(|i| self.canonical.get(i))
            .map(Header::hash);
        if parent != Some(first.parent_hash) {
            return Err(SyncError::InsertionFailure(format!(
                "block {} does not extend the canonical chain",
                first.number
            )));
        }
        Ok(())
    }
}

fn check_linked(headers: &[&Header]) -> SyncResult<()> {
    for pair in headers.windows(2) {
        if pair[1].parent_hash != pair[0].hash() || pair[1].number != pair[0].number + 1 {
            return Err(SyncError::InsertionFailure(format!(
                "block {} does not link to {}",
                pair[1].number, pair[0].number
            )));
        }
    }
    Ok(())
}

/// Chain store kept in memory.
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
    known_ancestor: Mutex<Option<u64>>,
    fail_block_inserts: AtomicUsize,
    insert_calls: AtomicUsize,
    rollbacks: Mutex<Vec<u64>>,
}

impl MemoryChain {
    /// Local chain holding `chain` up to `height`.
    pub fn new(chain: &TestChain, height: u64) -> Self {
        let mut inner = ChainInner::default();
        for (block, receipts) in chain.blocks.iter().zip(&chain.receipts).take(height as usize + 1)
        {
            inner.blocks.insert(block.hash());
            inner.receipts.insert(block.hash(), receipts.clone());
            inner.canonical.push(block.header.clone());
        }
        Self {
            inner: RwLock::new(inner),
            known_ancestor: Mutex::new(None),
            fail_block_inserts: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            rollbacks: Mutex::new(Vec::new()),
        }
    }

    /// Make `common_ancestor` answer `number` without a network search.
    pub fn set_known_ancestor(&self, number: Option<u64>) {
        *self.known_ancestor.lock() = number;
    }

    /// Reject the next `count` block inserts.
    pub fn fail_next_block_inserts(&self, count: usize) {
        self.fail_block_inserts.store(count, Ordering::Release);
    }

    /// Head number.
    pub fn height(&self) -> u64 {
        self.inner.read().canonical.len() as u64 - 1
    }

    /// Canonical hashes from genesis.
    pub fn canonical_hashes(&self) -> Vec<Hash> {
        self.inner.read().canonical.iter().map(Header::hash).collect()
    }

    /// Whether receipts were stored for `hash`.
    pub fn has_receipts(&self, hash: &Hash) -> bool {
        self.inner.read().receipts.contains_key(hash)
    }

    /// Stored state node count.
    pub fn state_nodes(&self) -> usize {
        self.inner.read().state.len()
    }

    /// Store state nodes directly.
    pub fn preload_state(&self, nodes: impl IntoIterator<Item = (Hash, Vec<u8>)>) {
        self.inner.write().state.extend(nodes);
    }

    /// Number of insert calls that changed the chain.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::Acquire)
    }

    /// Rollback targets, oldest first.
    pub fn rollbacks(&self) -> Vec<u64> {
        self.rollbacks.lock().clone()
    }
}

#[async_trait]
impl ChainStore for MemoryChain {
    async fn head(&self) -> Head {
        let inner = self.inner.read();
        let td = inner.canonical.iter().map(|h| h.difficulty).sum();
        inner
            .canonical
            .last()
            .map(|h| h.to_head(td))
            .unwrap_or_default()
    }

    async fn header_hash(&self, number: u64) -> Option<Hash> {
        self.inner
            .read()
            .canonical
            .get(number as usize)
            .map(Header::hash)
    }

    async fn has_header(&self, hash: &Hash) -> bool {
        self.inner.read().canonical.iter().any(|h| h.hash() == *hash)
    }

    async fn has_block(&self, hash: &Hash) -> bool {
        self.inner.read().blocks.contains(hash)
    }

    async fn has_state_node(&self, hash: &Hash) -> bool {
        self.inner.read().state.contains_key(hash)
    }

    async fn common_ancestor(&self, remote: &Head) -> Option<u64> {
        let inner = self.inner.read();
        if let Some(i) = inner.canonical.iter().position(|h| h.hash() == remote.hash) {
            return Some(i as u64);
        }
        *self.known_ancestor.lock()
    }

    async fn insert_headers(&self, headers: &[Header]) -> SyncResult<()> {
        let Some(first) = headers.first() else {
            return Ok(());
        };
        check_linked(&headers.iter().collect::<Vec<_>>())?;
        let mut inner = self.inner.write();
        inner.check_link(first)?;
        inner.truncate(first.number as usize);
        inner.canonical.extend(headers.iter().cloned());
        self.insert_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn insert_blocks(
        &self,
        blocks: &[Block],
        receipts: Option<&[Vec<Receipt>]>,
    ) -> SyncResult<()> {
        let Some(first) = blocks.first() else {
            return Ok(());
        };
        if self
            .fail_block_inserts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::InsertionFailure("injected failure".into()));
        }
        check_linked(&blocks.iter().map(|b| &b.header).collect::<Vec<_>>())?;
        if let Some(bad) = blocks.iter().find(|b| !b.verify_body()) {
            return Err(SyncError::InsertionFailure(format!(
                "block {} body mismatch",
                bad.number()
            )));
        }
        if let Some(receipts) = receipts {
            if receipts.len() != blocks.len()
                || blocks
                    .iter()
                    .zip(receipts)
                    .any(|(b, r)| receipts_root(r) != b.header.receipt_root)
            {
                return Err(SyncError::InsertionFailure("receipts mismatch".into()));
            }
        }

        let mut inner = self.inner.write();
        inner.check_link(&first.header)?;
        if !inner.blocks.contains(&first.header.parent_hash) {
            return Err(SyncError::InsertionFailure(format!(
                "parent of block {} has no body",
                first.number()
            )));
        }
        inner.truncate(first.number() as usize);
        for (i, block) in blocks.iter().enumerate() {
            let hash = block.hash();
            inner.blocks.insert(hash);
            if let Some(receipts) = receipts {
                inner.receipts.insert(hash, receipts[i].clone());
            }
            inner.canonical.push(block.header.clone());
        }
        self.insert_calls.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn insert_state_nodes(&self, nodes: &[(Hash, Vec<u8>)]) -> SyncResult<()> {
        if let Some((hash, _)) = nodes.iter().find(|(h, blob)| Hash::digest(blob) != *h) {
            return Err(SyncError::InsertionFailure(format!(
                "state node {} hash mismatch",
                hash.short()
            )));
        }
        self.inner.write().state.extend(nodes.iter().cloned());
        Ok(())
    }

    async fn rollback(&self, number: u64) -> SyncResult<()> {
        self.inner.write().truncate(number as usize + 1);
        self.rollbacks.lock().push(number);
        Ok(())
    }
}

// ============================================================================
// Scripted peer network
// ============================================================================

/// How a mock peer answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Serves correct data.
    Honest,
    /// Breaks parent linkage inside multi-header ranges.
    BrokenLinkage,
    /// Serves ranges whose last header is forged.
    ForgedTail,
    /// Forges the first header of strided header responses.
    ForgedSkeleton,
    /// Serves bodies, receipts and blobs that do not match their keys.
    CorruptData,
    /// Answers correctly after a delay.
    Slow(Duration),
    /// Never answers.
    Hang,
    /// Fails every request with a closed connection.
    Disconnect,
    /// Answers with empty lists.
    Empty,
}

struct MockPeer {
    chain: Arc<TestChain>,
    height: u64,
    behavior: Behavior,
}

/// In-process peer network.
#[derive(Default)]
pub struct MockNetwork {
    peers: RwLock<HashMap<PeerId, MockPeer>>,
    log: Mutex<Vec<(PeerId, Request)>>,
}

impl MockNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a peer serving `chain` up to `height`.
    pub fn add_peer(&self, id: PeerId, chain: Arc<TestChain>, height: u64, behavior: Behavior) {
        self.peers.write().insert(
            id,
            MockPeer {
                chain,
                height,
                behavior,
            },
        );
    }

    /// Change how a peer answers.
    pub fn set_behavior(&self, id: &PeerId, behavior: Behavior) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.behavior = behavior;
        }
    }

    /// Extend what a peer serves.
    pub fn set_height(&self, id: &PeerId, chain: Arc<TestChain>, height: u64) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.chain = chain;
            peer.height = height;
        }
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<(PeerId, Request)> {
        self.log.lock().clone()
    }

    /// Requests sent to `id`.
    pub fn requests_to(&self, id: &PeerId) -> Vec<Request> {
        self.log
            .lock()
            .iter()
            .filter(|(p, _)| p == id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Hashes asked for in node data requests, in order.
    pub fn requested_nodes(&self) -> Vec<Hash> {
        self.log
            .lock()
            .iter()
            .filter_map(|(_, r)| match r {
                Request::NodeData(hashes) => Some(hashes.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

fn serve(chain: &TestChain, height: u64, request: &Request) -> Response {
    let visible = |b: &&Block| b.number() <= height;
    match request {
        Request::Headers {
            origin,
            amount,
            skip,
            reverse,
        } => {
            let start = match origin {
                HeaderOrigin::Number(n) => Some(*n),
                HeaderOrigin::Hash(h) => chain.block_by_hash(h).filter(visible).map(Block::number),
            };
            let mut headers = Vec::new();
            if let Some(start) = start {
                let step = skip + 1;
                for i in 0..*amount as u64 {
                    let number = if *reverse {
                        match start.checked_sub(i * step) {
                            Some(n) => n,
                            None => break,
                        }
                    } else {
                        start + i * step
                    };
                    match chain.block(number).filter(visible) {
                        Some(block) => headers.push(block.header.clone()),
                        None => break,
                    }
                }
            }
            Response::Headers(headers)
        }
        Request::Bodies(hashes) => Response::Bodies(
            hashes
                .iter()
                .filter_map(|h| chain.block_by_hash(h).filter(visible))
                .map(|b| b.body.clone())
                .collect(),
        ),
        Request::Receipts(hashes) => Response::Receipts(
            hashes
                .iter()
                .filter(|h| chain.block_by_hash(h).filter(visible).is_some())
                .filter_map(|h| chain.receipts_by_hash(h).cloned())
                .collect(),
        ),
        Request::NodeData(hashes) => Response::NodeData(
            hashes
                .iter()
                .filter_map(|h| chain.state.nodes.get(h).cloned())
                .collect(),
        ),
        Request::Code(hashes) => Response::Code(
            hashes
                .iter()
                .filter_map(|h| chain.state.nodes.get(h).cloned())
                .collect(),
        ),
    }
}

fn corrupt(request: &Request, response: Response, behavior: Behavior) -> Response {
    let is_range = matches!(request, Request::Headers { skip: 0, amount, .. } if *amount > 1);
    match (behavior, response) {
        (Behavior::BrokenLinkage, Response::Headers(mut headers)) if is_range => {
            if let Some(h) = headers.get_mut(1) {
                h.parent_hash = Hash::digest(b"broken");
            }
            Response::Headers(headers)
        }
        (Behavior::ForgedTail, Response::Headers(mut headers)) if is_range => {
            if let Some(h) = headers.last_mut() {
                h.extra = b"forged".to_vec();
            }
            Response::Headers(headers)
        }
        (Behavior::ForgedSkeleton, Response::Headers(mut headers))
            if matches!(request, Request::Headers { skip, .. } if *skip > 0) =>
        {
            if let Some(h) = headers.first_mut() {
                h.extra = b"forged".to_vec();
            }
            Response::Headers(headers)
        }
        (Behavior::CorruptData, Response::Bodies(mut bodies)) => {
            for body in &mut bodies {
                body.transactions.push(b"injected".to_vec());
            }
            Response::Bodies(bodies)
        }
        (Behavior::CorruptData, Response::Receipts(mut receipts)) => {
            for r in &mut receipts {
                r.push(Receipt {
                    data: b"injected".to_vec(),
                });
            }
            Response::Receipts(receipts)
        }
        (Behavior::CorruptData, Response::NodeData(blobs)) => Response::NodeData(
            blobs
                .into_iter()
                .map(|mut b| {
                    b.extend_from_slice(b"junk");
                    b
                })
                .collect(),
        ),
        (Behavior::CorruptData, Response::Code(blobs)) => {
            Response::Code(blobs.into_iter().map(|_| b"junk".to_vec()).collect())
        }
        (Behavior::Empty, r) => match r {
            Response::Headers(_) => Response::Headers(vec![]),
            Response::Bodies(_) => Response::Bodies(vec![]),
            Response::Receipts(_) => Response::Receipts(vec![]),
            Response::NodeData(_) => Response::NodeData(vec![]),
            Response::Code(_) => Response::Code(vec![]),
        },
        (_, r) => r,
    }
}

#[async_trait]
impl PeerTransport for MockNetwork {
    async fn send_request(&self, peer: &PeerId, request: Request) -> NetworkResult<Response> {
        trace!(peer = %peer, kind = %request.kind(), items = request.items(), "Mock request");
        self.log.lock().push((peer.clone(), request.clone()));
        let (chain, height, behavior) = {
            let peers = self.peers.read();
            let p = peers
                .get(peer)
                .ok_or_else(|| NetworkError::PeerNotFound(peer.to_string()))?;
            (Arc::clone(&p.chain), p.height, p.behavior)
        };

        match behavior {
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Disconnect => return Err(NetworkError::ConnectionClosed),
            Behavior::Slow(delay) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let response = serve(&chain, height, &request);
        Ok(corrupt(&request, response, behavior))
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// Registry, network, local chain and metrics wired together.
pub struct TestNet {
    /// Sync configuration used by every component built here.
    pub config: SyncConfig,
    /// Peer registry.
    pub registry: Arc<PeerRegistry>,
    /// Scripted peers.
    pub network: Arc<MockNetwork>,
    /// Local chain.
    pub chain: Arc<MemoryChain>,
    /// Recorded metrics.
    pub metrics: Arc<CountingMetrics>,
    /// Shared seen-block cache.
    pub seen: Arc<SeenBlocks>,
}

impl TestNet {
    /// Local chain holding `local` up to `height`, default test config.
    pub fn new(local: &TestChain, height: u64) -> Self {
        Self::with_config(local, height, test_config())
    }

    /// Same as [`TestNet::new`] with an explicit config.
    pub fn with_config(local: &TestChain, height: u64, config: SyncConfig) -> Self {
        init_tracing();
        let seen = Arc::new(SeenBlocks::new(
            config.fetcher.seen_capacity,
            config.fetcher.seen_ttl(),
        ));
        Self {
            registry: Arc::new(PeerRegistry::new(config.peers.clone())),
            network: Arc::new(MockNetwork::new()),
            chain: Arc::new(MemoryChain::new(local, height)),
            metrics: Arc::new(CountingMetrics::new()),
            seen,
            config,
        }
    }

    /// Add a full-node peer serving `chain` up to `height` and register it.
    pub fn add_peer(&self, n: u8, chain: &Arc<TestChain>, height: u64, behavior: Behavior) -> PeerId {
        let id = peer_id(n);
        self.network
            .add_peer(id.clone(), Arc::clone(chain), height, behavior);
        self.registry
            .register(peer_info(n, chain, height))
            .unwrap_or_else(|e| panic!("register {}: {}", id, e));
        id
    }

    /// Distributor over this network.
    pub fn distributor(&self) -> RequestDistributor {
        RequestDistributor::new(
            Arc::clone(&self.registry),
            self.network.clone(),
            self.metrics.clone(),
            self.config.distributor.clone(),
        )
    }

    /// Downloader in `mode`.
    pub fn downloader(&self, mode: SyncMode) -> Downloader {
        let mut config = self.config.downloader.clone();
        config.mode = mode;
        Downloader::new(
            config,
            self.distributor(),
            self.chain.clone(),
            Arc::clone(&self.seen),
        )
    }

    /// Fetcher sharing this net's seen cache.
    pub fn fetcher(&self) -> Fetcher {
        Fetcher::new(
            self.config.fetcher.clone(),
            self.distributor(),
            self.chain.clone(),
            Arc::clone(&self.seen),
        )
    }

    /// Retrieval manager.
    pub fn retriever(&self) -> RetrieveManager {
        RetrieveManager::new(self.config.retrieve.clone(), self.distributor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::build_chain;

    #[tokio::test]
    async fn test_memory_chain_rejects_unlinked_blocks() {
        let chain = build_chain(10, 1);
        let store = MemoryChain::new(&chain, 5);
        let err = store
            .insert_blocks(&chain.blocks[7..9], None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InsertionFailure(_)));

        store.insert_blocks(&chain.blocks[6..9], None).await.unwrap();
        assert_eq!(store.height(), 8);
    }

    #[tokio::test]
    async fn test_mock_peer_serves_skeleton() {
        let chain = Arc::new(build_chain(50, 1));
        let network = MockNetwork::new();
        let id = peer_id(1);
        network.add_peer(id.clone(), Arc::clone(&chain), 40, Behavior::Honest);

        let request = Request::Headers {
            origin: HeaderOrigin::Number(10),
            amount: 5,
            skip: 9,
            reverse: false,
        };
        let Response::Headers(headers) = network.send_request(&id, request).await.unwrap() else {
            panic!("expected headers");
        };
        let numbers: Vec<u64> = headers.iter().map(|h| h.number).collect();
        assert_eq!(numbers, vec![10, 20, 30, 40]);
    }
}
