//! Request distribution.
//!
//! Picks a peer for a typed request, dispatches it with a deadline and
//! retries elsewhere on failure. A single request is only ever in flight on
//! one peer at a time: attempts run strictly one after another.

use crate::config::DistributorConfig;
use crate::{SyncError, SyncResult};
use ec_network::{
    Capabilities, Meter, Metrics, NetworkError, PeerId, PeerInfo, PeerRegistry, PeerSlot,
    PeerTransport, PenaltyReason, Request, Response, Timer,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on a single wait for a peer to become eligible.
const WAIT_TICK: Duration = Duration::from_millis(50);

/// A request plus the rules for who may serve it.
#[derive(Debug, Clone)]
pub struct DistRequest {
    /// The request to send.
    pub request: Request,
    /// Data the serving peer must offer.
    pub capabilities: Capabilities,
    /// Minimum advertised head of the serving peer.
    pub min_height: u64,
    /// Only this peer may serve the request.
    pub pinned: Option<PeerId>,
    /// Overrides the configured attempt budget.
    pub max_attempts: Option<u32>,
}

impl DistRequest {
    /// Request servable by any peer with `capabilities`.
    pub fn new(request: Request, capabilities: Capabilities) -> Self {
        Self {
            request,
            capabilities,
            min_height: 0,
            pinned: None,
            max_attempts: None,
        }
    }

    /// Require the peer to advertise at least `height`.
    pub fn min_height(mut self, height: u64) -> Self {
        self.min_height = height;
        self
    }

    /// Send only to `peer`.
    pub fn pinned(mut self, peer: PeerId) -> Self {
        self.pinned = Some(peer);
        self
    }

    /// Override the attempt budget.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Whether `peer` may serve this request.
    pub fn accepts(&self, peer: &PeerInfo) -> bool {
        peer.serves(self.capabilities)
            && peer.head.number >= self.min_height
            && self.pinned.as_ref().map_or(true, |id| *id == peer.id)
    }
}

/// Why a response was rejected by the caller's check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Penalty for the serving peer, `None` when it simply lacked the data.
    pub reason: Option<PenaltyReason>,
    /// Human readable detail.
    pub detail: String,
}

impl Fault {
    /// Bad data: penalize the peer.
    pub fn penalty(reason: PenaltyReason, detail: impl Into<String>) -> Self {
        Self {
            reason: Some(reason),
            detail: detail.into(),
        }
    }

    /// The peer does not have the data.
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            reason: None,
            detail: detail.into(),
        }
    }
}

/// A verified response and the peer that served it.
#[derive(Debug, Clone)]
pub struct Delivered<T> {
    /// Serving peer.
    pub peer: PeerId,
    /// Verified value.
    pub value: T,
}

/// Outcome of a single attempt.
enum Attempt<T> {
    Done(Delivered<T>),
    Failed { timeout: bool },
}

/// Dispatches requests to the best available peer.
#[derive(Clone)]
pub struct RequestDistributor {
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    metrics: Arc<dyn Metrics>,
    config: DistributorConfig,
}

impl RequestDistributor {
    /// Create a distributor.
    pub fn new(
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
        metrics: Arc<dyn Metrics>,
        config: DistributorConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            metrics,
            config,
        }
    }

    /// Peer registry.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    /// Configuration.
    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Send `req` to a suitable peer and check the answer with `verify`.
    ///
    /// Retries on timeouts, transport errors and rejected responses, each
    /// time on the next best peer, until the attempt budget runs out.
    pub async fn distribute<T, F>(
        &self,
        req: DistRequest,
        cancel: &CancellationToken,
        mut verify: F,
    ) -> SyncResult<Delivered<T>>
    where
        F: FnMut(&PeerId, Response) -> Result<T, Fault> + Send,
        T: Send,
    {
        let max_attempts = req.max_attempts.unwrap_or(self.config.max_attempts).max(1);
        let mut exclude = HashSet::new();
        let mut attempts = 0;
        let mut last_timeout = false;

        while attempts < max_attempts {
            let slot = self.acquire(&req, &mut exclude, cancel, attempts).await?;
            attempts += 1;
            match self.attempt(&req, slot, cancel, &mut verify).await? {
                Attempt::Done(delivered) => return Ok(delivered),
                Attempt::Failed { timeout } => last_timeout = timeout,
            }
        }

        debug!(
            kind = %req.request.kind(),
            attempts,
            last_timeout,
            "Request failed on every attempt"
        );
        if last_timeout {
            Err(SyncError::RequestTimeout { attempts })
        } else {
            Err(SyncError::NoPeersAvailable { attempts })
        }
    }

    async fn attempt<T, F>(
        &self,
        req: &DistRequest,
        slot: PeerSlot,
        cancel: &CancellationToken,
        verify: &mut F,
    ) -> SyncResult<Attempt<T>>
    where
        F: FnMut(&PeerId, Response) -> Result<T, Fault> + Send,
        T: Send,
    {
        let peer = slot.peer().clone();
        let kind = req.request.kind();
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            _ = slot.dropped().cancelled() => Err(NetworkError::PeerDropped(peer.to_string())),
            res = tokio::time::timeout(
                self.config.request_timeout(),
                self.transport.send_request(&peer, req.request.clone()),
            ) => res.unwrap_or_else(|_| Err(NetworkError::Timeout(peer.to_string()))),
        };
        let elapsed = started.elapsed();
        drop(slot);

        match outcome {
            Ok(response) => {
                self.metrics.observe(Timer::Request(kind), elapsed);
                let items = response.items();
                match verify(&peer, response) {
                    Ok(value) => {
                        self.metrics.mark(Meter::In(kind), items as u64);
                        self.registry.record_delivery(&peer, items, elapsed);
                        self.registry.clear_backoff(&peer);
                        Ok(Attempt::Done(Delivered { peer, value }))
                    }
                    Err(fault) => {
                        self.metrics.mark(Meter::Drop(kind), 1);
                        self.registry.record_failure(&peer);
                        let banned = match fault.reason {
                            Some(reason) => {
                                warn!(peer = %peer, %kind, %reason, detail = %fault.detail, "Rejected response");
                                self.registry.penalize(&peer, reason)
                            }
                            None => {
                                debug!(peer = %peer, %kind, detail = %fault.detail, "Peer lacks requested data");
                                false
                            }
                        };
                        if !banned {
                            self.registry.backoff(&peer);
                        }
                        Ok(Attempt::Failed { timeout: false })
                    }
                }
            }
            Err(NetworkError::Timeout(_)) => {
                self.metrics.mark(Meter::Timeout(kind), 1);
                warn!(peer = %peer, %kind, elapsed_ms = elapsed.as_millis() as u64, "Request timed out");
                self.registry.record_failure(&peer);
                self.registry.backoff(&peer);
                Ok(Attempt::Failed { timeout: true })
            }
            Err(e) => {
                debug!(peer = %peer, %kind, error = %e, "Request failed");
                self.registry.record_failure(&peer);
                self.registry.backoff(&peer);
                Ok(Attempt::Failed { timeout: false })
            }
        }
    }

    /// Wait for an eligible idle peer and reserve it.
    async fn acquire(
        &self,
        req: &DistRequest,
        exclude: &mut HashSet<PeerId>,
        cancel: &CancellationToken,
        attempts: u32,
    ) -> SyncResult<PeerSlot> {
        let filter = |p: &PeerInfo| req.accepts(p);
        let mut no_candidate_since: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }

            let notified = self.registry.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.registry.reserve_best(filter, exclude) {
                exclude.insert(slot.peer().clone());
                return Ok(slot);
            }

            let wait = if self.registry.has_candidate(filter, exclude) {
                no_candidate_since = None;
                self.registry
                    .next_backoff_expiry(filter, exclude)
                    .map_or(WAIT_TICK, |d| d.min(WAIT_TICK))
            } else if !exclude.is_empty() && self.registry.has_candidate(filter, &HashSet::new()) {
                // Every candidate already failed this request once.
                debug!(kind = %req.request.kind(), excluded = exclude.len(), "Clearing failed peers for request");
                exclude.clear();
                continue;
            } else {
                let since = *no_candidate_since.get_or_insert_with(Instant::now);
                let waited = since.elapsed();
                if waited >= self.config.peer_wait() {
                    debug!(kind = %req.request.kind(), attempts, "No eligible peer appeared");
                    return Err(SyncError::NoPeersAvailable { attempts });
                }
                (self.config.peer_wait() - waited).min(WAIT_TICK)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Canceled),
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
