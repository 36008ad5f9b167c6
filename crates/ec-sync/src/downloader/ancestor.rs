//! Common ancestor search against a remote peer.

use crate::chain::ChainStore;
use crate::distributor::{DistRequest, Fault, RequestDistributor};
use crate::{SyncError, SyncResult};
use ec_network::{Capabilities, Hash, Header, PeerInfo, PenaltyReason, Request, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Locates the highest block shared by the local chain and `peer`.
pub(crate) struct AncestorSearch<'a> {
    pub distributor: &'a RequestDistributor,
    pub chain: &'a dyn ChainStore,
    pub peer: &'a PeerInfo,
    pub max_fetch: usize,
    pub max_fork_ancestry: u64,
    pub cancel: &'a CancellationToken,
}

impl AncestorSearch<'_> {
    /// Run the search.
    ///
    /// Asks the chain first, then scans the headers just below the shared
    /// height, then binary searches down to the fork floor.
    pub async fn run(&self) -> SyncResult<u64> {
        let local = self.chain.head().await.number;
        let remote = self.peer.head.number;
        let top = local.min(remote);

        if let Some(ancestor) = self.chain.common_ancestor(&self.peer.head).await {
            let ancestor = ancestor.min(top);
            debug!(peer = %self.peer.id, ancestor, "Ancestor known locally");
            return Ok(ancestor);
        }

        let floor = local.saturating_sub(self.max_fork_ancestry);
        if top < floor {
            return Err(SyncError::InconsistentData(format!(
                "peer {} is below the fork floor {}",
                self.peer.id, floor
            )));
        }
        let count = ((top - floor + 1) as usize).min(self.max_fetch.max(1));
        let scan_from = top + 1 - count as u64;

        let headers = self.fetch_range(scan_from, count).await?;
        for header in headers.iter().rev() {
            if self.is_common(header.number, header.hash()).await {
                info!(peer = %self.peer.id, ancestor = header.number, local, remote, "Found common ancestor");
                return Ok(header.number);
            }
        }

        if scan_from <= floor {
            return Err(SyncError::InconsistentData(format!(
                "no common ancestor with {} above {}",
                self.peer.id, floor
            )));
        }

        let floor_header = self.fetch_one(floor).await?;
        if !self.is_common(floor, floor_header.hash()).await {
            return Err(SyncError::InconsistentData(format!(
                "fork with {} is deeper than {}",
                self.peer.id, floor
            )));
        }

        // `lo` is common, `hi` is not.
        let (mut lo, mut hi) = (floor, scan_from);
        while lo + 1 < hi {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }
            let mid = lo + (hi - lo) / 2;
            let header = self.fetch_one(mid).await?;
            if self.is_common(mid, header.hash()).await {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        info!(peer = %self.peer.id, ancestor = lo, local, remote, "Found common ancestor by bisection");
        Ok(lo)
    }

    async fn is_common(&self, number: u64, hash: Hash) -> bool {
        self.chain.header_hash(number).await == Some(hash)
    }

    async fn fetch_one(&self, number: u64) -> SyncResult<Header> {
        let mut headers = self.fetch_range(number, 1).await?;
        headers
            .pop()
            .ok_or_else(|| SyncError::Internal("empty ancestor response".into()))
    }

    /// Fetch exactly `count` linked headers from the sync peer.
    async fn fetch_range(&self, from: u64, count: usize) -> SyncResult<Vec<Header>> {
        let req = DistRequest::new(Request::header_range(from, count), Capabilities::HEADERS)
            .pinned(self.peer.id.clone());

        let delivered = self
            .distributor
            .distribute(req, self.cancel, move |_peer, response| {
                let Response::Headers(headers) = response else {
                    return Err(Fault::penalty(PenaltyReason::UnrequestedData, "expected headers"));
                };
                if headers.len() != count {
                    return Err(Fault::penalty(
                        PenaltyReason::MalformedResponse,
                        format!("asked {} headers, got {}", count, headers.len()),
                    ));
                }
                verify_chain(from, &headers)?;
                Ok(headers)
            })
            .await?;
        Ok(delivered.value)
    }
}

/// Check that `headers` start at `from`, ascend by one and link by parent hash.
pub(crate) fn verify_chain(from: u64, headers: &[Header]) -> Result<(), Fault> {
    for (i, header) in headers.iter().enumerate() {
        let expected = from + i as u64;
        if header.number != expected {
            return Err(Fault::penalty(
                PenaltyReason::BrokenChain,
                format!("header {} where {} was expected", header.number, expected),
            ));
        }
        if i > 0 && header.parent_hash != headers[i - 1].hash() {
            return Err(Fault::penalty(
                PenaltyReason::BrokenChain,
                format!("header {} does not link to its parent", header.number),
            ));
        }
    }
    Ok(())
}
