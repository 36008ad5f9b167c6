//! Bulk chain download.
//!
//! One sync cycle walks `Idle -> FindAncestor -> FetchHeaders -> FetchBlocks
//! -> [FetchState] -> Committed -> Idle` against the tallest registered
//! peer. Work is cut into segments of `segment_size` headers; each segment
//! is fetched from as many peers as are available, reassembled in block
//! order and committed to the chain as a unit.

mod ancestor;
mod queue;
mod state_sync;

pub use queue::{QueueStats, ReorderBuffer, SyncTask, TaskQueue};
pub use state_sync::{StateSync, StateSyncCheckpoint};

use crate::chain::ChainStore;
use crate::config::{DownloaderConfig, SyncMode};
use crate::distributor::{Delivered, DistRequest, Fault, RequestDistributor};
use crate::seen::SeenBlocks;
use crate::{SyncError, SyncResult};
use ancestor::{verify_chain, AncestorSearch};
use ec_network::{
    receipts_root, Block, BlockBody, Capabilities, Hash, Head, Header, HeaderOrigin, MessageKind,
    PeerId, PeerInfo, PenaltyReason, Receipt, Request, Response,
};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait between cycles when no peer is taller than us.
const IDLE_WAIT: Duration = Duration::from_secs(5);

/// Wait before retrying a failed cycle.
const RETRY_WAIT: Duration = Duration::from_secs(1);

/// Distinct peers contradicting one skeleton header before the sync target
/// has to serve the range itself.
const SKELETON_DISPUTES: usize = 2;

/// Peers whose ranges contradicted a skeleton header, by header number.
type Disputes = Mutex<HashMap<u64, HashSet<PeerId>>>;

/// A header range with the hashes it must link to and end on.
#[derive(Clone, Copy)]
struct RangeCheck {
    task: SyncTask,
    /// Parent hash of the first header.
    link: Hash,
    /// Skeleton number `link` came from, `None` for the local ancestor.
    link_anchor: Option<u64>,
    /// Hash of the last header.
    end: Hash,
}

/// Outcome of a header range request.
enum RangeFill {
    /// Range matching its skeleton headers.
    Headers(Vec<Header>),
    /// Enough peers contradicted this skeleton header that the target must
    /// serve the range itself.
    Contested(u64),
    /// The target contradicted its own skeleton header.
    ForgedAnchor(u64),
}

/// Downloader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    /// Not syncing.
    Idle,
    /// No usable peer; suspended until one registers.
    WaitingForPeers,
    /// Searching for the fork point.
    FindAncestor,
    /// Downloading headers.
    FetchHeaders,
    /// Downloading bodies and receipts.
    FetchBlocks,
    /// Downloading state at the pivot.
    FetchState,
    /// Handing a segment to the chain.
    Committed,
}

/// Sync progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Local head when the cycle started.
    pub starting_block: u64,
    /// Highest committed block.
    pub current_block: u64,
    /// Target head.
    pub highest_block: u64,
    /// State nodes downloaded.
    pub pulled_states: u64,
    /// State nodes known to be needed.
    pub known_states: u64,
}

/// Summary of a finished cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Sync target.
    pub peer: PeerId,
    /// Mode used.
    pub mode: SyncMode,
    /// Fork point.
    pub ancestor: u64,
    /// New head number.
    pub head: u64,
    /// Headers committed.
    pub committed: u64,
    /// State nodes downloaded.
    pub state_nodes: u64,
}

/// Per-kind parameters for body and receipt downloads.
struct ItemFetch<T> {
    kind: MessageKind,
    capabilities: Capabilities,
    concurrency: usize,
    max_fetch: usize,
    needs: fn(&Header) -> bool,
    request: fn(Vec<Hash>) -> Request,
    extract: fn(Response) -> Option<Vec<T>>,
    matches: fn(&Header, &T) -> bool,
    empty: fn() -> T,
}

/// Chain downloader.
pub struct Downloader {
    config: DownloaderConfig,
    distributor: RequestDistributor,
    chain: Arc<dyn ChainStore>,
    seen: Arc<SeenBlocks>,
    stage: RwLock<SyncStage>,
    progress: RwLock<SyncProgress>,
    running: AtomicBool,
    /// Parent of every cycle token.
    shutdown: CancellationToken,
    /// Token of the current cycle.
    cancel: Mutex<CancellationToken>,
    /// Unfinished state download.
    checkpoint: Mutex<Option<StateSyncCheckpoint>>,
    /// Targets caught forging a skeleton, skipped by the next target pick.
    distrusted: Mutex<HashSet<PeerId>>,
}

struct RunGuard<'a>(&'a Downloader);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

impl Downloader {
    /// Create a downloader.
    pub fn new(
        config: DownloaderConfig,
        distributor: RequestDistributor,
        chain: Arc<dyn ChainStore>,
        seen: Arc<SeenBlocks>,
    ) -> Self {
        Self {
            config,
            distributor,
            chain,
            seen,
            stage: RwLock::new(SyncStage::Idle),
            progress: RwLock::new(SyncProgress::default()),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            cancel: Mutex::new(CancellationToken::new()),
            checkpoint: Mutex::new(None),
            distrusted: Mutex::new(HashSet::new()),
        }
    }

    /// Current stage.
    pub fn stage(&self) -> SyncStage {
        *self.stage.read()
    }

    /// Current progress.
    pub fn progress(&self) -> SyncProgress {
        self.progress.read().clone()
    }

    /// Whether a cycle is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Sync mode.
    pub fn mode(&self) -> SyncMode {
        self.config.mode
    }

    /// Abort the running cycle at its next safe point.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Abort the running cycle and stop [`Downloader::run`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Unfinished state download, if any.
    pub fn state_checkpoint(&self) -> Option<StateSyncCheckpoint> {
        self.checkpoint.lock().clone()
    }

    /// Resume a state download saved by an earlier process.
    pub fn restore_state_checkpoint(&self, checkpoint: StateSyncCheckpoint) {
        info!(
            root = %checkpoint.root.short(),
            pending = checkpoint.pending.len(),
            "Restored state sync checkpoint"
        );
        *self.checkpoint.lock() = Some(checkpoint);
    }

    fn set_stage(&self, stage: SyncStage) {
        let mut current = self.stage.write();
        if *current != stage {
            debug!(from = ?*current, to = ?stage, "Sync stage");
            *current = stage;
        }
    }

    /// Run one cycle against the best peer.
    ///
    /// Returns `Ok(None)` when no registered peer is ahead of us.
    pub async fn synchronise(&self) -> SyncResult<Option<SyncReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::Busy);
        }
        let _guard = RunGuard(self);

        let token = self.shutdown.child_token();
        *self.cancel.lock() = token.clone();

        let local = self.chain.head().await;
        let distrusted = std::mem::take(&mut *self.distrusted.lock());
        let target = match self.distributor.registry().best_peer_excluding(&distrusted) {
            Some(peer) if peer.head.number > local.number => peer,
            _ => {
                self.set_stage(SyncStage::Idle);
                return Ok(None);
            }
        };

        let result = self.sync_with(&target, local, &token).await;
        self.set_stage(SyncStage::Idle);
        match &result {
            Ok(report) => info!(
                peer = %report.peer,
                mode = %report.mode,
                ancestor = report.ancestor,
                head = report.head,
                "Chain sync complete"
            ),
            Err(SyncError::Canceled) => info!(peer = %target.id, "Chain sync canceled"),
            Err(e) => warn!(peer = %target.id, error = %e, "Chain sync failed"),
        }
        result.map(Some)
    }

    /// Keep syncing until shut down, suspending while no peer is ahead.
    pub async fn run(&self) {
        info!(mode = %self.config.mode, "Downloader started");
        let registry = Arc::clone(self.distributor.registry());
        loop {
            let notified = registry.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = match self.synchronise().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    self.set_stage(SyncStage::WaitingForPeers);
                    IDLE_WAIT
                }
                Err(SyncError::Canceled) if self.shutdown.is_cancelled() => break,
                Err(e) if e.is_peer_shortage() || e.is_transient() => {
                    info!(error = %e, "Sync suspended, waiting for peers");
                    self.set_stage(SyncStage::WaitingForPeers);
                    RETRY_WAIT
                }
                Err(_) => RETRY_WAIT,
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        self.set_stage(SyncStage::Idle);
        info!("Downloader stopped");
    }

    async fn sync_with(
        &self,
        target: &PeerInfo,
        local: Head,
        token: &CancellationToken,
    ) -> SyncResult<SyncReport> {
        let remote = target.head.number;
        info!(
            peer = %target.id,
            mode = %self.config.mode,
            local = local.number,
            remote,
            "Starting chain sync"
        );
        {
            let mut progress = self.progress.write();
            progress.starting_block = local.number;
            progress.current_block = local.number;
            progress.highest_block = remote;
        }

        self.set_stage(SyncStage::FindAncestor);
        let ancestor = AncestorSearch {
            distributor: &self.distributor,
            chain: self.chain.as_ref(),
            peer: target,
            max_fetch: self.config.max_header_fetch,
            max_fork_ancestry: self.config.max_fork_ancestry,
            cancel: token,
        }
        .run()
        .await?;

        let pivot = match self.config.mode {
            SyncMode::Fast => Some(remote.saturating_sub(self.config.pivot_depth))
                .filter(|pivot| *pivot > ancestor),
            _ => None,
        };
        if let Some(pivot) = pivot {
            info!(pivot, "Fast sync pivot selected");
        }

        let mut parent = self.chain.header_hash(ancestor).await.ok_or_else(|| {
            SyncError::Internal(format!("ancestor {} missing from local chain", ancestor))
        })?;
        let mut from = ancestor + 1;
        let mut committed = 0u64;
        let mut state_nodes = 0u64;

        while from <= remote {
            if token.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            let to = from
                .saturating_add(self.config.segment_size as u64 - 1)
                .min(remote);

            self.set_stage(SyncStage::FetchHeaders);
            let headers = self.fetch_headers(from, to, parent, target, token).await?;
            let last = headers
                .last()
                .map(Header::hash)
                .ok_or_else(|| SyncError::Internal("empty header segment".into()))?;

            state_nodes += self.commit_segment(headers, pivot, token).await?;

            committed += to - from + 1;
            self.progress.write().current_block = to;
            parent = last;
            from = to + 1;
        }

        Ok(SyncReport {
            peer: target.id.clone(),
            mode: self.config.mode,
            ancestor,
            head: remote,
            committed,
            state_nodes,
        })
    }

    /// Download headers `from..=to` whose first entry links to `parent`.
    ///
    /// The sync target first supplies a skeleton: the last header of every
    /// range. Ranges are then filled from any peer and must link to the
    /// previous skeleton header and end exactly on their own. A filler that
    /// breaks linkage inside its range is penalized at once; one that only
    /// contradicts the skeleton is penalized once the skeleton header is
    /// confirmed, and a target whose own ranges contradict its skeleton is
    /// penalized and skipped by the next cycle.
    async fn fetch_headers(
        &self,
        from: u64,
        to: u64,
        parent: Hash,
        target: &PeerInfo,
        token: &CancellationToken,
    ) -> SyncResult<Vec<Header>> {
        let mut queue = TaskQueue::new(from, to, self.config.max_header_fetch);
        let ends = queue.ends();
        let skeleton = self.fetch_skeleton(&ends, target, token).await?;

        let mut anchors = HashMap::with_capacity(ends.len());
        let mut prev = parent;
        for header in &skeleton {
            let hash = header.hash();
            anchors.insert(header.number, (prev, hash));
            prev = hash;
        }

        let disputes = Disputes::default();
        let mut buffer: ReorderBuffer<Vec<Header>> = ReorderBuffer::new(from);
        let mut headers = Vec::with_capacity((to - from + 1) as usize);
        let mut inflight = FuturesUnordered::new();

        loop {
            while inflight.len() < self.config.header_concurrency {
                let Some(task) = queue.reserve() else {
                    break;
                };
                let (link, end) = anchors
                    .get(&task.end)
                    .copied()
                    .ok_or_else(|| SyncError::Internal(format!("no anchor for {}", task.end)))?;
                inflight.push(self.fetch_header_task(
                    RangeCheck {
                        task,
                        link,
                        link_anchor: (task.start > from).then(|| task.start - 1),
                        end,
                    },
                    &disputes,
                    target,
                    false,
                    token,
                ));
            }

            let Some((check, result)) = inflight.next().await else {
                break;
            };
            let task = check.task;
            let Delivered { peer, value } = result?;
            let range = match value {
                RangeFill::Headers(range) => range,
                RangeFill::Contested(number) => {
                    debug!(
                        peer = %target.id,
                        number,
                        start = task.start,
                        "Skeleton header contested, asking the target"
                    );
                    inflight.push(self.fetch_header_task(check, &disputes, target, true, token));
                    continue;
                }
                RangeFill::ForgedAnchor(number) => {
                    warn!(peer = %target.id, number, "Sync target contradicted its own skeleton");
                    self.distributor
                        .registry()
                        .penalize(&target.id, PenaltyReason::BrokenChain);
                    self.distrusted.lock().insert(target.id.clone());
                    return Err(SyncError::PeerFault {
                        peer: target.id.clone(),
                        reason: format!("forged skeleton header {}", number),
                    });
                }
            };
            debug!(
                peer = %peer,
                start = task.start,
                end = task.end,
                "Header range delivered"
            );

            // The anchors this range matched are confirmed, so whoever
            // contradicted them lied.
            let confirmed = [Some(task.end), check.link_anchor];
            let liars: Vec<PeerId> = {
                let mut disputes = disputes.lock();
                confirmed
                    .into_iter()
                    .flatten()
                    .filter_map(|number| disputes.remove(&number))
                    .flatten()
                    .filter(|id| *id != peer)
                    .collect()
            };
            for liar in liars {
                debug!(peer = %liar, start = task.start, "Range contradicted a confirmed skeleton");
                self.distributor
                    .registry()
                    .penalize(&liar, PenaltyReason::BrokenChain);
            }

            queue.complete(task);
            buffer.insert(task, range);
            while let Some((_, range)) = buffer.pop() {
                headers.extend(range);
            }
        }

        if !queue.is_done() || headers.len() as u64 != to - from + 1 {
            return Err(SyncError::Internal(format!(
                "assembled {} headers for range {}..={}",
                headers.len(),
                from,
                to
            )));
        }
        debug!(from, to, ranges = ends.len(), "Header segment assembled");
        Ok(headers)
    }

    /// Headers at `ends` from the sync target.
    async fn fetch_skeleton(
        &self,
        ends: &[u64],
        target: &PeerInfo,
        token: &CancellationToken,
    ) -> SyncResult<Vec<Header>> {
        let (Some(&first), Some(&last)) = (ends.first(), ends.last()) else {
            return Ok(Vec::new());
        };
        let skip = ends.get(1).map_or(0, |second| second - first - 1);
        let req = DistRequest::new(
            Request::Headers {
                origin: HeaderOrigin::Number(first),
                amount: ends.len(),
                skip,
                reverse: false,
            },
            Capabilities::HEADERS,
        )
        .pinned(target.id.clone())
        .min_height(last);

        let expected = ends.to_vec();
        let head = target.head;
        let delivered = self
            .distributor
            .distribute(req, token, move |_peer, response| {
                let Response::Headers(headers) = response else {
                    return Err(Fault::penalty(PenaltyReason::UnrequestedData, "expected headers"));
                };
                let numbers: Vec<u64> = headers.iter().map(|h| h.number).collect();
                if numbers != expected {
                    return Err(Fault::penalty(
                        PenaltyReason::MalformedResponse,
                        format!("skeleton covers {:?}", numbers),
                    ));
                }
                if let Some(top) = headers.iter().find(|h| h.number == head.number) {
                    if top.hash() != head.hash {
                        return Err(Fault::penalty(
                            PenaltyReason::BrokenChain,
                            "skeleton does not reach the advertised head",
                        ));
                    }
                }
                Ok(headers)
            })
            .await?;
        Ok(delivered.value)
    }

    /// Fetch one range and check it against its skeleton headers.
    ///
    /// A range contradicting only skeleton headers is not penalized: the
    /// disagreement is recorded in `disputes` and the range is retried
    /// elsewhere. Once the header is contested the target serves the range
    /// itself (`from_target`), which either confirms the skeleton or proves
    /// it forged.
    async fn fetch_header_task(
        &self,
        check: RangeCheck,
        disputes: &Disputes,
        target: &PeerInfo,
        from_target: bool,
        token: &CancellationToken,
    ) -> (RangeCheck, SyncResult<Delivered<RangeFill>>) {
        let RangeCheck {
            task,
            link,
            link_anchor,
            end,
        } = check;
        let mut req = DistRequest::new(
            Request::header_range(task.start, task.len()),
            Capabilities::HEADERS,
        )
        .min_height(task.end);
        if from_target {
            req = req.pinned(target.id.clone());
        }
        let target_id = &target.id;

        let result = self
            .distributor
            .distribute(req, token, move |peer, response| {
                let Response::Headers(headers) = response else {
                    return Err(Fault::penalty(PenaltyReason::UnrequestedData, "expected headers"));
                };
                if headers.is_empty() {
                    return Err(Fault::unavailable("empty header response"));
                }
                if headers.len() != task.len() {
                    return Err(Fault::penalty(
                        PenaltyReason::MalformedResponse,
                        format!("asked {} headers, got {}", task.len(), headers.len()),
                    ));
                }
                verify_chain(task.start, &headers)?;

                let mut contradicted = Vec::with_capacity(2);
                if headers[0].parent_hash != link {
                    match link_anchor {
                        Some(number) => contradicted.push(number),
                        None => {
                            return Err(Fault::penalty(
                                PenaltyReason::BrokenChain,
                                "range does not link to the local chain",
                            ))
                        }
                    }
                }
                if headers.last().map(Header::hash) != Some(end) {
                    contradicted.push(task.end);
                }
                let Some(&first) = contradicted.first() else {
                    return Ok(RangeFill::Headers(headers));
                };
                if peer == target_id {
                    return Ok(RangeFill::ForgedAnchor(first));
                }

                let mut disputes = disputes.lock();
                for number in contradicted.iter().copied() {
                    let peers = disputes.entry(number).or_default();
                    peers.insert(peer.clone());
                    if peers.len() >= SKELETON_DISPUTES {
                        return Ok(RangeFill::Contested(number));
                    }
                }
                Err(Fault::unavailable(format!(
                    "range contradicts skeleton at {:?}",
                    contradicted
                )))
            })
            .await;
        (check, result)
    }

    /// Fetch the rest of a header segment and hand it to the chain.
    async fn commit_segment(
        &self,
        headers: Vec<Header>,
        pivot: Option<u64>,
        token: &CancellationToken,
    ) -> SyncResult<u64> {
        let start = headers.first().map_or(0, |h| h.number);

        if self.config.mode == SyncMode::Light {
            if token.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            self.set_stage(SyncStage::Committed);
            self.chain
                .insert_headers(&headers)
                .await
                .map_err(insertion_failure)?;
            debug!(start, count = headers.len(), "Committed header segment");
            return Ok(0);
        }

        self.set_stage(SyncStage::FetchBlocks);
        let split = pivot.map_or(0, |p| headers.partition_point(|h| h.number <= p));
        let (bodies, receipts) = tokio::try_join!(
            self.fetch_items(&headers, bodies_fetch(&self.config), token),
            async {
                if split == 0 {
                    Ok(Vec::new())
                } else {
                    self.fetch_items(&headers[..split], receipts_fetch(&self.config), token)
                        .await
                }
            }
        )?;

        // Last safe point before the chain is touched.
        if token.is_cancelled() {
            return Err(SyncError::Canceled);
        }

        let blocks: Vec<Block> = headers
            .into_iter()
            .zip(bodies)
            .map(|(header, body)| Block::new(header, body))
            .collect();
        let (pre, post) = blocks.split_at(split);

        self.set_stage(SyncStage::Committed);
        if !pre.is_empty() {
            self.chain
                .insert_blocks(pre, Some(receipts.as_slice()))
                .await
                .map_err(insertion_failure)?;
        }

        let mut state_nodes = 0;
        if let (Some(p), Some(last)) = (pivot, pre.last()) {
            if last.number() == p {
                self.set_stage(SyncStage::FetchState);
                match self.sync_state(last.header.state_root, p, token).await {
                    Ok(n) => state_nodes = n,
                    Err(e) => {
                        self.rollback(start).await;
                        return Err(e);
                    }
                }
                self.set_stage(SyncStage::Committed);
            }
        }

        if !post.is_empty() {
            if let Err(e) = self.chain.insert_blocks(post, None).await {
                if !pre.is_empty() {
                    self.rollback(start).await;
                }
                return Err(insertion_failure(e));
            }
        }

        for block in &blocks {
            self.seen.insert(block.hash());
        }
        debug!(start, count = blocks.len(), "Committed block segment");
        Ok(state_nodes)
    }

    async fn rollback(&self, segment_start: u64) {
        let to = segment_start.saturating_sub(1);
        warn!(to, "Rolling back partially committed segment");
        if let Err(e) = self.chain.rollback(to).await {
            warn!(to, error = %e, "Rollback failed");
        }
    }

    /// Download one item per header, in header order.
    async fn fetch_items<T: Send>(
        &self,
        headers: &[Header],
        spec: ItemFetch<T>,
        token: &CancellationToken,
    ) -> SyncResult<Vec<T>> {
        let mut results: Vec<Option<T>> = headers
            .iter()
            .map(|h| if (spec.needs)(h) { None } else { Some((spec.empty)()) })
            .collect();
        let mut pending: VecDeque<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(i, _)| i)
            .collect();
        if !pending.is_empty() {
            debug!(kind = %spec.kind, count = pending.len(), "Fetching block data");
        }

        let mut inflight = FuturesUnordered::new();
        loop {
            while inflight.len() < spec.concurrency && !pending.is_empty() {
                let cap = self
                    .distributor
                    .registry()
                    .median_capacity(spec.max_fetch)
                    .min(pending.len());
                let batch: Vec<usize> = pending.drain(..cap).collect();
                let expected: Vec<Header> = batch.iter().map(|&i| headers[i].clone()).collect();
                let hashes = expected.iter().map(Header::hash).collect();
                let min_height = expected.last().map_or(0, |h| h.number);
                let req = DistRequest::new((spec.request)(hashes), spec.capabilities)
                    .min_height(min_height);
                let (extract, matches) = (spec.extract, spec.matches);
                let distributor = &self.distributor;

                inflight.push(async move {
                    let result = distributor
                        .distribute(req, token, move |_peer, response| {
                            let items = extract(response).ok_or_else(|| {
                                Fault::penalty(PenaltyReason::UnrequestedData, "unexpected response kind")
                            })?;
                            if items.is_empty() {
                                return Err(Fault::unavailable("empty delivery"));
                            }
                            if items.len() > expected.len() {
                                return Err(Fault::penalty(
                                    PenaltyReason::MalformedResponse,
                                    format!("asked {} items, got {}", expected.len(), items.len()),
                                ));
                            }
                            for (header, item) in expected.iter().zip(&items) {
                                if !matches(header, item) {
                                    return Err(Fault::penalty(
                                        PenaltyReason::CommitmentMismatch,
                                        format!("block {} commitment mismatch", header.number),
                                    ));
                                }
                            }
                            Ok(items)
                        })
                        .await;
                    (batch, result)
                });
            }

            let Some((batch, result)) = inflight.next().await else {
                break;
            };
            let items = result?.value;
            let delivered = items.len();
            for (&idx, item) in batch.iter().zip(items) {
                results[idx] = Some(item);
            }
            if delivered < batch.len() {
                debug!(kind = %spec.kind, delivered, asked = batch.len(), "Partial delivery, requeueing rest");
                for &idx in batch[delivered..].iter().rev() {
                    pending.push_front(idx);
                }
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.ok_or_else(|| SyncError::Internal(format!("missing {} for index {}", spec.kind, i)))
            })
            .collect()
    }

    /// Download the state trie under `root`, resuming a matching checkpoint.
    async fn sync_state(&self, root: Hash, number: u64, token: &CancellationToken) -> SyncResult<u64> {
        let mut sched = match self.checkpoint.lock().take() {
            Some(cp) if cp.root == root => {
                info!(root = %root.short(), pending = cp.pending.len(), "Resuming state sync");
                StateSync::resume(cp)
            }
            _ => StateSync::new(root, number),
        };
        let before = sched.confirmed();

        match self.drive_state(&mut sched, token).await {
            Ok(()) => {
                info!(root = %root.short(), nodes = sched.confirmed(), "State sync complete");
                Ok(sched.confirmed() - before)
            }
            Err(e) => {
                let checkpoint = sched.checkpoint();
                info!(
                    root = %root.short(),
                    pending = checkpoint.pending.len(),
                    confirmed = checkpoint.confirmed,
                    "State sync interrupted, checkpoint kept"
                );
                *self.checkpoint.lock() = Some(checkpoint);
                Err(e)
            }
        }
    }

    async fn drive_state(&self, sched: &mut StateSync, token: &CancellationToken) -> SyncResult<()> {
        let mut inflight = FuturesUnordered::new();
        loop {
            if token.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            while inflight.len() < self.config.state_concurrency {
                let cap = self
                    .distributor
                    .registry()
                    .median_capacity(self.config.max_state_fetch);
                let batch = sched.next_batch(cap);
                if batch.is_empty() {
                    break;
                }
                inflight.push(self.fetch_state_batch(batch, token));
            }
            {
                let mut progress = self.progress.write();
                progress.pulled_states = sched.confirmed();
                progress.known_states = sched.confirmed() + sched.outstanding() as u64;
            }

            let Some((batch, result)) = inflight.next().await else {
                break;
            };
            let nodes = match result {
                Ok(delivered) => delivered.value,
                Err(e) => {
                    sched.retry(&batch);
                    return Err(e);
                }
            };
            if let Err(e) = self.chain.insert_state_nodes(&nodes).await {
                sched.retry(&batch);
                return Err(insertion_failure(e));
            }
            for child in sched.confirm(&batch, &nodes) {
                if !self.chain.has_state_node(&child).await {
                    sched.schedule(child);
                }
            }
        }
        Ok(())
    }

    async fn fetch_state_batch(
        &self,
        batch: Vec<Hash>,
        token: &CancellationToken,
    ) -> (Vec<Hash>, SyncResult<Delivered<Vec<(Hash, Vec<u8>)>>>) {
        let requested = batch.clone();
        let req = DistRequest::new(Request::NodeData(batch.clone()), Capabilities::STATE);
        let result = self
            .distributor
            .distribute(req, token, move |_peer, response| {
                let Response::NodeData(blobs) = response else {
                    return Err(Fault::penalty(PenaltyReason::UnrequestedData, "expected node data"));
                };
                if blobs.is_empty() {
                    return Err(Fault::unavailable("no state nodes delivered"));
                }
                StateSync::match_delivery(&requested, blobs).map_err(|hash| {
                    Fault::penalty(
                        PenaltyReason::ContentMismatch,
                        format!("unrequested node {}", hash.short()),
                    )
                })
            })
            .await;
        (batch, result)
    }
}

fn insertion_failure(e: SyncError) -> SyncError {
    match e {
        SyncError::InsertionFailure(_) => e,
        other => SyncError::InsertionFailure(other.to_string()),
    }
}

fn bodies_fetch(config: &DownloaderConfig) -> ItemFetch<BlockBody> {
    ItemFetch {
        kind: MessageKind::Bodies,
        capabilities: Capabilities::BODIES,
        concurrency: config.body_concurrency,
        max_fetch: config.max_body_fetch,
        needs: |h| !h.is_empty_body(),
        request: Request::Bodies,
        extract: |r| match r {
            Response::Bodies(v) => Some(v),
            _ => None,
        },
        matches: |h, body| body.root() == h.tx_root,
        empty: BlockBody::default,
    }
}

fn receipts_fetch(config: &DownloaderConfig) -> ItemFetch<Vec<Receipt>> {
    ItemFetch {
        kind: MessageKind::Receipts,
        capabilities: Capabilities::RECEIPTS,
        concurrency: config.receipt_concurrency,
        max_fetch: config.max_receipt_fetch,
        needs: |h| !h.is_empty_receipts(),
        request: Request::Receipts,
        extract: |r| match r {
            Response::Receipts(v) => Some(v),
            _ => None,
        },
        matches: |h, receipts| receipts_root(receipts) == h.receipt_root,
        empty: Vec::new,
    }
}
