//! Announcement-driven block fetching.
//!
//! Peers announce new blocks by hash or push them whole. The fetcher keeps
//! a short queue of announcements, fetches whatever is missing from the
//! announcing peer and imports through the same chain path the downloader
//! uses. Each peer has a budget of announcements and broadcasts per rate
//! window; anything over budget is dropped and counted, without touching
//! other peers' budgets.

use crate::chain::ChainStore;
use crate::config::FetcherConfig;
use crate::distributor::{DistRequest, Fault, RequestDistributor};
use crate::seen::SeenBlocks;
use crate::{SyncError, SyncResult};
use ec_network::{
    Block, BlockBody, Capabilities, Hash, Header, Meter, Metrics, PeerId, PenaltyReason, Request,
    Response, Timer,
};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A block hash announced by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Block hash.
    pub hash: Hash,
    /// Announced number.
    pub number: u64,
    /// Announcing peer.
    pub origin: PeerId,
    /// Arrival time.
    pub time: Instant,
}

/// What happened to an announcement or broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Queued for fetching or import.
    Queued,
    /// Already seen, queued or stored.
    Duplicate,
    /// Peer is over its budget for the current window.
    RateLimited,
    /// Too far above or below the local head.
    OutOfRange,
    /// Payload failed its own consistency checks.
    Invalid,
}

/// Result of one fetch round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Blocks fetched from announcers.
    pub fetched: usize,
    /// Blocks imported into the chain.
    pub imported: usize,
    /// Blocks or announcements given up on.
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Announce,
    Broadcast,
}

#[derive(Debug)]
struct QueuedBlock {
    block: Block,
    origin: PeerId,
    source: Source,
    arrived: Instant,
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    announces: usize,
    broadcasts: usize,
    /// Whether the peer was already penalized this window.
    flagged: bool,
}

/// Result of counting a message against a peer's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Charge {
    Accepted,
    /// Over budget; `first` is set for the first excess message of the window.
    Over { first: bool },
}

#[derive(Default)]
struct FetcherState {
    /// Announcements waiting to be fetched, one per hash.
    announced: HashMap<Hash, Announcement>,
    /// Complete blocks waiting for import, by number.
    queued: BTreeMap<u64, Vec<QueuedBlock>>,
    /// Per-peer budgets.
    rates: HashMap<PeerId, RateWindow>,
}

impl FetcherState {
    fn is_queued(&self, hash: &Hash) -> bool {
        self.announced.contains_key(hash)
            || self
                .queued
                .values()
                .flatten()
                .any(|q| q.block.hash() == *hash)
    }
}

/// Block fetcher.
pub struct Fetcher {
    config: FetcherConfig,
    distributor: RequestDistributor,
    chain: Arc<dyn ChainStore>,
    seen: Arc<SeenBlocks>,
    state: Mutex<FetcherState>,
    shutdown: CancellationToken,
}

impl Fetcher {
    /// Create a fetcher.
    pub fn new(
        config: FetcherConfig,
        distributor: RequestDistributor,
        chain: Arc<dyn ChainStore>,
        seen: Arc<SeenBlocks>,
    ) -> Self {
        Self {
            config,
            distributor,
            chain,
            seen,
            state: Mutex::new(FetcherState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    fn metrics(&self) -> &Arc<dyn Metrics> {
        self.distributor.metrics()
    }

    /// Stop in-flight fetches.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Announcements waiting to be fetched.
    pub fn pending_announcements(&self) -> usize {
        self.state.lock().announced.len()
    }

    /// Blocks waiting for import.
    pub fn queued_blocks(&self) -> usize {
        self.state.lock().queued.values().map(Vec::len).sum()
    }

    /// Count a message against `peer`'s budget.
    fn charge(&self, peer: &PeerId, source: Source) -> Charge {
        let window = self.config.rate_window();
        let mut state = self.state.lock();
        let rate = state.rates.entry(peer.clone()).or_insert_with(|| RateWindow {
            started: Instant::now(),
            announces: 0,
            broadcasts: 0,
            flagged: false,
        });
        if rate.started.elapsed() >= window {
            rate.started = Instant::now();
            rate.announces = 0;
            rate.broadcasts = 0;
            rate.flagged = false;
        }
        let (used, limit) = match source {
            Source::Announce => (&mut rate.announces, self.config.announce_limit),
            Source::Broadcast => (&mut rate.broadcasts, self.config.broadcast_limit),
        };
        if *used >= limit {
            let first = !rate.flagged;
            rate.flagged = true;
            return Charge::Over { first };
        }
        *used += 1;
        Charge::Accepted
    }

    /// Drop a message over budget, penalizing the peer once per window.
    fn over_budget(&self, peer: &PeerId, first: bool, meter: Meter) {
        self.metrics().mark(meter, 1);
        if first {
            warn!(peer = %peer, "Peer exceeded its announcement budget");
            self.distributor
                .registry()
                .penalize(peer, PenaltyReason::AnnouncementFlood);
        }
    }

    async fn in_range(&self, number: u64) -> bool {
        let local = self.chain.head().await.number;
        number <= local.saturating_add(self.config.max_queue_dist)
            && number.saturating_add(self.config.max_uncle_dist) >= local
    }

    async fn is_known(&self, hash: &Hash) -> bool {
        self.seen.contains(hash) || self.chain.has_block(hash).await
    }

    /// Handle a block hash announcement.
    pub async fn announce(&self, peer: &PeerId, hash: Hash, number: u64) -> AnnounceOutcome {
        if let Charge::Over { first } = self.charge(peer, Source::Announce) {
            self.over_budget(peer, first, Meter::AnnounceDos);
            debug!(peer = %peer, hash = %hash.short(), "Announcement over peer budget");
            return AnnounceOutcome::RateLimited;
        }
        if self.is_known(&hash).await {
            self.metrics().mark(Meter::AnnounceDrop, 1);
            return AnnounceOutcome::Duplicate;
        }
        if !self.in_range(number).await {
            self.metrics().mark(Meter::AnnounceDrop, 1);
            debug!(peer = %peer, number, "Announcement out of range");
            return AnnounceOutcome::OutOfRange;
        }

        let mut state = self.state.lock();
        if state.is_queued(&hash) {
            drop(state);
            self.metrics().mark(Meter::AnnounceDrop, 1);
            return AnnounceOutcome::Duplicate;
        }
        state.announced.insert(
            hash,
            Announcement {
                hash,
                number,
                origin: peer.clone(),
                time: Instant::now(),
            },
        );
        drop(state);
        self.metrics().mark(Meter::AnnounceIn, 1);
        debug!(peer = %peer, hash = %hash.short(), number, "Queued announcement");
        AnnounceOutcome::Queued
    }

    /// Handle a full block pushed by a peer.
    pub async fn broadcast(&self, peer: &PeerId, block: Block) -> AnnounceOutcome {
        if let Charge::Over { first } = self.charge(peer, Source::Broadcast) {
            self.over_budget(peer, first, Meter::BroadcastDos);
            debug!(peer = %peer, number = block.number(), "Broadcast over peer budget");
            return AnnounceOutcome::RateLimited;
        }
        let hash = block.hash();
        if self.is_known(&hash).await {
            self.metrics().mark(Meter::BroadcastDrop, 1);
            return AnnounceOutcome::Duplicate;
        }
        if !self.in_range(block.number()).await {
            self.metrics().mark(Meter::BroadcastDrop, 1);
            return AnnounceOutcome::OutOfRange;
        }
        if !block.verify_body() {
            self.metrics().mark(Meter::BroadcastDrop, 1);
            warn!(peer = %peer, number = block.number(), "Broadcast block body does not match header");
            self.distributor
                .registry()
                .penalize(peer, PenaltyReason::InvalidBlock);
            return AnnounceOutcome::Invalid;
        }

        let mut state = self.state.lock();
        if state.queued.values().flatten().any(|q| q.block.hash() == hash) {
            drop(state);
            self.metrics().mark(Meter::BroadcastDrop, 1);
            return AnnounceOutcome::Duplicate;
        }
        // The block is here already; no need to fetch it.
        state.announced.remove(&hash);
        state.queued.entry(block.number()).or_default().push(QueuedBlock {
            block,
            origin: peer.clone(),
            source: Source::Broadcast,
            arrived: Instant::now(),
        });
        drop(state);
        self.metrics().mark(Meter::BroadcastIn, 1);
        AnnounceOutcome::Queued
    }

    /// Drop announcements that waited longer than their time-to-live.
    pub fn expire(&self) -> usize {
        let ttl = self.config.announce_ttl();
        let mut state = self.state.lock();
        let before = state.announced.len();
        state.announced.retain(|_, a| a.time.elapsed() < ttl);
        let expired = before - state.announced.len();
        drop(state);
        if expired > 0 {
            self.metrics().mark(Meter::AnnounceDrop, expired as u64);
            debug!(expired, "Expired stale announcements");
        }
        expired
    }

    /// Forget everything a peer sent us.
    pub fn forget_peer(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        state.announced.retain(|_, a| a.origin != *peer);
        for blocks in state.queued.values_mut() {
            blocks.retain(|q| q.origin != *peer);
        }
        state.queued.retain(|_, blocks| !blocks.is_empty());
        state.rates.remove(peer);
    }

    /// Fetch queued announcements and import everything importable.
    pub async fn fetch_pending(&self) -> SyncResult<FetchSummary> {
        let mut summary = FetchSummary {
            discarded: self.expire(),
            ..Default::default()
        };

        let announcements: Vec<Announcement> = {
            let mut state = self.state.lock();
            state.announced.drain().map(|(_, a)| a).collect()
        };

        let mut inflight: FuturesUnordered<_> = announcements
            .into_iter()
            .map(|a| async move {
                let result = self.fetch_block(&a.origin, a.hash, Some(a.number)).await;
                (a, result)
            })
            .collect();

        while let Some((announcement, result)) = inflight.next().await {
            match result {
                Ok(block) => {
                    summary.fetched += 1;
                    self.state
                        .lock()
                        .queued
                        .entry(block.number())
                        .or_default()
                        .push(QueuedBlock {
                            block,
                            origin: announcement.origin,
                            source: Source::Announce,
                            arrived: announcement.time,
                        });
                }
                Err(SyncError::Canceled) => return Err(SyncError::Canceled),
                Err(e) => {
                    summary.discarded += 1;
                    self.metrics().mark(Meter::AnnounceDrop, 1);
                    debug!(
                        peer = %announcement.origin,
                        hash = %announcement.hash.short(),
                        error = %e,
                        "Announced block fetch failed"
                    );
                }
            }
        }
        drop(inflight);

        let (imported, discarded) = self.import_queued().await?;
        summary.imported += imported;
        summary.discarded += discarded;
        Ok(summary)
    }

    /// Import queued blocks in ascending order.
    async fn import_queued(&self) -> SyncResult<(usize, usize)> {
        let queued: Vec<QueuedBlock> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.queued)
                .into_values()
                .flatten()
                .collect()
        };

        let (mut imported, mut discarded) = (0, 0);
        for item in queued {
            let hash = item.block.hash();
            if self.is_known(&hash).await {
                continue;
            }

            let mut chain = match self.connect(&item).await {
                Ok(ancestors) => ancestors,
                Err(SyncError::Canceled) => return Err(SyncError::Canceled),
                Err(e) => {
                    discarded += 1;
                    self.mark_drop(item.source);
                    debug!(peer = %item.origin, number = item.block.number(), error = %e, "Discarding unreachable block");
                    continue;
                }
            };
            chain.push(item.block);

            match self.chain.insert_blocks(&chain, None).await {
                Ok(()) => {
                    for block in &chain {
                        self.seen.insert(block.hash());
                    }
                    imported += chain.len();
                    let timer = match item.source {
                        Source::Announce => Timer::AnnounceOut,
                        Source::Broadcast => Timer::BroadcastOut,
                    };
                    self.metrics().observe(timer, item.arrived.elapsed());
                    info!(
                        peer = %item.origin,
                        number = chain.last().map_or(0, Block::number),
                        count = chain.len(),
                        "Imported propagated block"
                    );
                }
                Err(e) => {
                    discarded += 1;
                    self.mark_drop(item.source);
                    warn!(peer = %item.origin, hash = %hash.short(), error = %e, "Propagated block import failed");
                    self.distributor
                        .registry()
                        .penalize(&item.origin, PenaltyReason::InvalidBlock);
                }
            }
        }
        Ok((imported, discarded))
    }

    fn mark_drop(&self, source: Source) {
        let meter = match source {
            Source::Announce => Meter::AnnounceDrop,
            Source::Broadcast => Meter::BroadcastDrop,
        };
        self.metrics().mark(meter, 1);
    }

    /// Missing ancestors of a queued block, oldest first.
    ///
    /// Fetches parents from the block's origin until one is stored locally,
    /// giving up after `max_parent_depth` blocks.
    async fn connect(&self, item: &QueuedBlock) -> SyncResult<Vec<Block>> {
        let mut missing = Vec::new();
        let mut parent = item.block.header.parent_hash;
        while !self.chain.has_block(&parent).await {
            if missing.len() >= self.config.max_parent_depth {
                return Err(SyncError::InconsistentData(format!(
                    "no known ancestor within {} blocks",
                    self.config.max_parent_depth
                )));
            }
            let block = self.fetch_block(&item.origin, parent, None).await?;
            parent = block.header.parent_hash;
            missing.push(block);
        }
        missing.reverse();
        Ok(missing)
    }

    /// Fetch header and body of `hash` from `peer`.
    async fn fetch_block(&self, peer: &PeerId, hash: Hash, number: Option<u64>) -> SyncResult<Block> {
        self.metrics().mark(Meter::HeaderFetch, 1);
        let req = DistRequest::new(Request::header_by_hash(hash), Capabilities::HEADERS)
            .pinned(peer.clone())
            .max_attempts(1);
        let metrics = Arc::clone(self.metrics());
        let header = self
            .distributor
            .distribute(req, &self.shutdown, move |_peer, response| {
                let Response::Headers(mut headers) = response else {
                    return Err(Fault::penalty(PenaltyReason::UnrequestedData, "expected a header"));
                };
                metrics.mark(Meter::FilterHeadersIn, headers.len() as u64);
                let header: Header = match headers.pop() {
                    Some(h) if headers.is_empty() => h,
                    Some(_) => {
                        return Err(Fault::penalty(PenaltyReason::MalformedResponse, "more than one header"))
                    }
                    None => return Err(Fault::unavailable("header not found")),
                };
                if header.hash() != hash || number.map_or(false, |n| n != header.number) {
                    return Err(Fault::penalty(
                        PenaltyReason::UnrequestedData,
                        "header does not match announcement",
                    ));
                }
                metrics.mark(Meter::FilterHeadersOut, 1);
                Ok(header)
            })
            .await?
            .value;

        if header.is_empty_body() {
            return Ok(Block::new(header, BlockBody::default()));
        }

        self.metrics().mark(Meter::BodyFetch, 1);
        let req = DistRequest::new(Request::Bodies(vec![hash]), Capabilities::BODIES)
            .pinned(peer.clone())
            .max_attempts(1);
        let tx_root = header.tx_root;
        let metrics = Arc::clone(self.metrics());
        let body = self
            .distributor
            .distribute(req, &self.shutdown, move |_peer, response| {
                let Response::Bodies(mut bodies) = response else {
                    return Err(Fault::penalty(PenaltyReason::UnrequestedData, "expected a body"));
                };
                metrics.mark(Meter::FilterBodiesIn, bodies.len() as u64);
                let body = bodies.pop().ok_or_else(|| Fault::unavailable("body not found"))?;
                if !bodies.is_empty() || body.root() != tx_root {
                    return Err(Fault::penalty(
                        PenaltyReason::CommitmentMismatch,
                        "body does not match header",
                    ));
                }
                metrics.mark(Meter::FilterBodiesOut, 1);
                Ok(body)
            })
            .await?
            .value;

        Ok(Block::new(header, body))
    }
}
