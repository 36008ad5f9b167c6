//! Chain insertion collaborator.

use crate::SyncResult;
use async_trait::async_trait;
use ec_network::{Block, Hash, Head, Header, Receipt};

/// Local chain as seen by the sync core.
///
/// Every method that changes the chain must be all-or-nothing: a failed
/// insert leaves the chain as it was before the call. The sync core relies
/// on this to roll back whole segments.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Current local head.
    async fn head(&self) -> Head;

    /// Canonical header hash at `number`.
    async fn header_hash(&self, number: u64) -> Option<Hash>;

    /// Whether a header with this hash is known.
    async fn has_header(&self, hash: &Hash) -> bool;

    /// Whether a full block with this hash is known.
    async fn has_block(&self, hash: &Hash) -> bool;

    /// Whether a state node or code blob is stored.
    async fn has_state_node(&self, hash: &Hash) -> bool;

    /// Highest local block shared with `remote`, when the store can tell
    /// without asking the network.
    async fn common_ancestor(&self, remote: &Head) -> Option<u64>;

    /// Insert a contiguous ascending run of headers.
    async fn insert_headers(&self, headers: &[Header]) -> SyncResult<()>;

    /// Insert a contiguous ascending run of blocks.
    ///
    /// With `receipts` the blocks are stored as-is without execution.
    async fn insert_blocks(&self, blocks: &[Block], receipts: Option<&[Vec<Receipt>]>)
        -> SyncResult<()>;

    /// Store verified state nodes, keyed by hash.
    async fn insert_state_nodes(&self, nodes: &[(Hash, Vec<u8>)]) -> SyncResult<()>;

    /// Rewind the canonical chain so that `number` is the head.
    async fn rollback(&self, number: u64) -> SyncResult<()>;
}
