//! On-demand retrieval of single, self-verifying items.
//!
//! A light client trusts no single peer: every answer is checked against
//! the key it was asked for, and a bad answer costs the peer a penalty and
//! moves the request to someone else.

use crate::config::RetrieveConfig;
use crate::distributor::{DistRequest, Fault, RequestDistributor};
use crate::{SyncError, SyncResult};
use ec_network::{
    receipts_root, BlockBody, Capabilities, Hash, Header, PenaltyReason, Receipt, Request,
    Response,
};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An item wanted by key, with enough context to check the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalRequest {
    /// Header with this hash.
    HeaderByHash(Hash),
    /// Body of a block whose header commits to `tx_root`.
    Body { block_hash: Hash, tx_root: Hash },
    /// Receipts of a block whose header commits to `receipt_root`.
    Receipts { block_hash: Hash, receipt_root: Hash },
    /// State trie node by hash.
    StateNode(Hash),
    /// Contract code by hash.
    Code(Hash),
    /// Canonical hash trie node by hash.
    ChtNode(Hash),
    /// Bloom trie node by hash.
    BloomTrieNode(Hash),
}

impl RetrievalRequest {
    /// What a peer must offer to answer.
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::HeaderByHash(_) => Capabilities::HEADERS,
            Self::Body { .. } => Capabilities::BODIES,
            Self::Receipts { .. } => Capabilities::RECEIPTS,
            Self::StateNode(_) | Self::Code(_) => Capabilities::STATE,
            Self::ChtNode(_) => Capabilities::CHT,
            Self::BloomTrieNode(_) => Capabilities::BLOOM_TRIE,
        }
    }

    /// Wire request for this item.
    pub fn request(&self) -> Request {
        match *self {
            Self::HeaderByHash(hash) => Request::header_by_hash(hash),
            Self::Body { block_hash, .. } => Request::Bodies(vec![block_hash]),
            Self::Receipts { block_hash, .. } => Request::Receipts(vec![block_hash]),
            Self::StateNode(hash) | Self::ChtNode(hash) | Self::BloomTrieNode(hash) => {
                Request::NodeData(vec![hash])
            }
            Self::Code(hash) => Request::Code(vec![hash]),
        }
    }

    /// Check a response against the key.
    pub fn verify(&self, response: Response) -> Result<Retrieved, Fault> {
        match (*self, response) {
            (Self::HeaderByHash(hash), Response::Headers(headers)) => {
                let header = single(headers)?;
                if header.hash() != hash {
                    return Err(mismatch("header hash"));
                }
                Ok(Retrieved::Header(header))
            }
            (Self::Body { tx_root, .. }, Response::Bodies(bodies)) => {
                let body = single(bodies)?;
                if body.root() != tx_root {
                    return Err(mismatch("body root"));
                }
                Ok(Retrieved::Body(body))
            }
            (Self::Receipts { receipt_root, .. }, Response::Receipts(receipts)) => {
                let receipts = single(receipts)?;
                if receipts_root(&receipts) != receipt_root {
                    return Err(mismatch("receipts root"));
                }
                Ok(Retrieved::Receipts(receipts))
            }
            (
                Self::StateNode(hash) | Self::ChtNode(hash) | Self::BloomTrieNode(hash),
                Response::NodeData(blobs),
            )
            | (Self::Code(hash), Response::Code(blobs)) => {
                let blob = single(blobs)?;
                if Hash::digest(&blob) != hash {
                    return Err(mismatch("content hash"));
                }
                Ok(Retrieved::Blob(blob))
            }
            (_, other) => Err(Fault::penalty(
                PenaltyReason::UnrequestedData,
                format!("unexpected {} response", other.kind()),
            )),
        }
    }
}

impl fmt::Display for RetrievalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderByHash(h) => write!(f, "header {}", h.short()),
            Self::Body { block_hash, .. } => write!(f, "body {}", block_hash.short()),
            Self::Receipts { block_hash, .. } => write!(f, "receipts {}", block_hash.short()),
            Self::StateNode(h) => write!(f, "state node {}", h.short()),
            Self::Code(h) => write!(f, "code {}", h.short()),
            Self::ChtNode(h) => write!(f, "cht node {}", h.short()),
            Self::BloomTrieNode(h) => write!(f, "bloom trie node {}", h.short()),
        }
    }
}

fn single<T>(mut items: Vec<T>) -> Result<T, Fault> {
    match items.len() {
        0 => Err(Fault::unavailable("item not served")),
        1 => Ok(items.remove(0)),
        n => Err(Fault::penalty(
            PenaltyReason::MalformedResponse,
            format!("asked for one item, got {}", n),
        )),
    }
}

fn mismatch(what: &str) -> Fault {
    Fault::penalty(PenaltyReason::ContentMismatch, format!("{} mismatch", what))
}

/// A verified item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retrieved {
    /// Header.
    Header(Header),
    /// Block body.
    Body(BlockBody),
    /// Block receipts.
    Receipts(Vec<Receipt>),
    /// Trie node or code blob.
    Blob(Vec<u8>),
}

/// Serves single-item requests through the distributor.
pub struct RetrieveManager {
    config: RetrieveConfig,
    distributor: RequestDistributor,
    shutdown: CancellationToken,
    in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RetrieveManager {
    /// Create a manager.
    pub fn new(config: RetrieveConfig, distributor: RequestDistributor) -> Self {
        Self {
            config,
            distributor,
            shutdown: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Retrievals currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Cancel every running retrieval.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Retrieve one item.
    pub async fn retrieve(&self, request: RetrievalRequest) -> SyncResult<Retrieved> {
        self.retrieve_with(request, &CancellationToken::new()).await
    }

    /// Retrieve one item, giving up when `cancel` fires.
    pub async fn retrieve_with(
        &self,
        request: RetrievalRequest,
        cancel: &CancellationToken,
    ) -> SyncResult<Retrieved> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlight(&self.in_flight);

        let attempts = self.config.max_attempts;
        let req = DistRequest::new(request.request(), request.capabilities()).max_attempts(attempts);
        let work = self
            .distributor
            .distribute(req, cancel, |_peer, response| request.verify(response));
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SyncError::Canceled),
            result = work => result,
        };

        match result {
            Ok(delivered) => {
                debug!(item = %request, peer = %delivered.peer, "Retrieved");
                Ok(delivered.value)
            }
            Err(SyncError::NoPeersAvailable { attempts })
            | Err(SyncError::RequestTimeout { attempts }) => {
                warn!(item = %request, attempts, "Retrieval exhausted");
                Err(SyncError::RetrievalExhausted { attempts })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_network::{StateNode, EMPTY_ROOT};

    #[test]
    fn test_trie_nodes_need_matching_capability() {
        let h = Hash::digest(b"n");
        assert_eq!(RetrievalRequest::ChtNode(h).capabilities(), Capabilities::CHT);
        assert_eq!(
            RetrievalRequest::BloomTrieNode(h).request(),
            Request::NodeData(vec![h])
        );
        assert_eq!(RetrievalRequest::Code(h).request(), Request::Code(vec![h]));
    }

    #[test]
    fn test_state_node_verified_by_hash() {
        let node = StateNode {
            children: vec![],
            value: b"v".to_vec(),
        };
        let req = RetrievalRequest::StateNode(node.hash());
        assert_eq!(
            req.verify(Response::NodeData(vec![node.encode()])),
            Ok(Retrieved::Blob(node.encode()))
        );

        let fault = req.verify(Response::NodeData(vec![b"junk".to_vec()])).unwrap_err();
        assert_eq!(fault.reason, Some(PenaltyReason::ContentMismatch));
    }

    #[test]
    fn test_empty_answer_is_not_a_fault() {
        let req = RetrievalRequest::Body {
            block_hash: Hash::digest(b"b"),
            tx_root: *EMPTY_ROOT,
        };
        let fault = req.verify(Response::Bodies(vec![])).unwrap_err();
        assert_eq!(fault.reason, None);
    }

    #[test]
    fn test_wrong_kind_is_unrequested() {
        let req = RetrievalRequest::HeaderByHash(Hash::digest(b"h"));
        let fault = req.verify(Response::Code(vec![])).unwrap_err();
        assert_eq!(fault.reason, Some(PenaltyReason::UnrequestedData));
    }
}
