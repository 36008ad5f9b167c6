//! Chain data types and typed peer requests.
//!
//! Everything here is content-addressed with blake2b-256: a header is
//! identified by the hash of its canonical encoding, a body and a receipt
//! list by the commitment roots carried in the header, and a state node by
//! the hash of its encoding.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// Maximum number of children a state node may reference.
pub const MAX_NODE_CHILDREN: usize = 16;

/// Commitment root of an empty item list.
pub static EMPTY_ROOT: Lazy<Hash> = Lazy::new(|| list_root::<Vec<u8>>(&[]));

/// 32-byte content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The all-zero hash (parent of genesis).
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}..)", self.short())
    }
}

/// Commitment over an ordered list of byte items.
pub fn list_root<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    let mut hasher = Blake2b256::new();
    hasher.update((items.len() as u64).to_be_bytes());
    for item in items {
        hasher.update(Hash::digest(item.as_ref()).0);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash(out)
}

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Block number.
    pub number: u64,
    /// Parent block hash.
    pub parent_hash: Hash,
    /// Block difficulty.
    pub difficulty: u128,
    /// State trie root after this block.
    pub state_root: Hash,
    /// Transactions commitment.
    pub tx_root: Hash,
    /// Receipts commitment.
    pub receipt_root: Hash,
    /// Opaque extra data.
    pub extra: Vec<u8>,
}

impl Header {
    /// Canonical encoding used for hashing.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.number.to_be_bytes());
        buf.extend_from_slice(&self.parent_hash.0);
        buf.extend_from_slice(&self.difficulty.to_be_bytes());
        buf.extend_from_slice(&self.state_root.0);
        buf.extend_from_slice(&self.tx_root.0);
        buf.extend_from_slice(&self.receipt_root.0);
        buf.extend_from_slice(&self.extra);
        buf
    }

    /// Length of the canonical encoding.
    pub fn encoded_len(&self) -> usize {
        8 + 32 + 16 + 32 * 3 + self.extra.len()
    }

    /// Header hash.
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.encode())
    }

    /// True when the block carries no transactions.
    pub fn is_empty_body(&self) -> bool {
        self.tx_root == *EMPTY_ROOT
    }

    /// True when the block produced no receipts.
    pub fn is_empty_receipts(&self) -> bool {
        self.receipt_root == *EMPTY_ROOT
    }

    /// The advertised head this header represents.
    pub fn to_head(&self, total_difficulty: u128) -> Head {
        Head {
            hash: self.hash(),
            number: self.number,
            difficulty: total_difficulty,
        }
    }
}

/// Block body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    /// Opaque transactions.
    pub transactions: Vec<Vec<u8>>,
}

impl BlockBody {
    /// Transactions commitment.
    pub fn root(&self) -> Hash {
        list_root(&self.transactions)
    }

    /// Approximate payload size.
    pub fn size(&self) -> usize {
        self.transactions.iter().map(Vec::len).sum()
    }
}

/// Transaction receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Opaque receipt payload.
    pub data: Vec<u8>,
}

/// Receipts commitment.
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    let items: Vec<&[u8]> = receipts.iter().map(|r| r.data.as_slice()).collect();
    list_root(&items)
}

/// Full block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Header.
    pub header: Header,
    /// Body.
    pub body: BlockBody,
}

impl Block {
    /// Create a block from its parts.
    pub fn new(header: Header, body: BlockBody) -> Self {
        Self { header, body }
    }

    /// Block hash.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Block number.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Check the body against the header's transactions commitment.
    pub fn verify_body(&self) -> bool {
        self.body.root() == self.header.tx_root
    }
}

/// Content-addressed state trie node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNode {
    /// Hashes of child nodes.
    pub children: Vec<Hash>,
    /// Leaf value, if any.
    pub value: Vec<u8>,
}

impl StateNode {
    /// Encode as `count | children | value`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.children.len() * 32 + self.value.len());
        buf.push(self.children.len() as u8);
        for child in &self.children {
            buf.extend_from_slice(&child.0);
        }
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Decode a node, rejecting truncated or oversized input.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&count, rest) = data.split_first()?;
        let count = count as usize;
        if count > MAX_NODE_CHILDREN || rest.len() < count * 32 {
            return None;
        }
        let (child_bytes, value) = rest.split_at(count * 32);
        let children = child_bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut h = [0u8; 32];
                h.copy_from_slice(chunk);
                Hash(h)
            })
            .collect();
        Some(Self {
            children,
            value: value.to_vec(),
        })
    }

    /// Node hash.
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.encode())
    }
}

/// Chain head advertised by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Head {
    /// Head block hash.
    pub hash: Hash,
    /// Head block number.
    pub number: u64,
    /// Total difficulty at the head.
    pub difficulty: u128,
}

impl Head {
    /// Create a head.
    pub fn new(hash: Hash, number: u64, difficulty: u128) -> Self {
        Self {
            hash,
            number,
            difficulty,
        }
    }
}

/// Message kinds, used for metering and capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Block headers.
    Headers,
    /// Block bodies.
    Bodies,
    /// Block receipts.
    Receipts,
    /// State trie nodes.
    NodeData,
    /// Contract code.
    Code,
    /// New block hash announcement.
    Announce,
    /// Full new block propagation.
    Broadcast,
}

impl MessageKind {
    /// Short name used in metric keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headers => "headers",
            Self::Bodies => "bodies",
            Self::Receipts => "receipts",
            Self::NodeData => "states",
            Self::Code => "code",
            Self::Announce => "announces",
            Self::Broadcast => "broadcasts",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a header request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOrigin {
    /// By block number.
    Number(u64),
    /// By block hash.
    Hash(Hash),
}

/// Typed request sent to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `amount` headers starting at `origin`, every `skip + 1`th block.
    Headers {
        origin: HeaderOrigin,
        amount: usize,
        skip: u64,
        reverse: bool,
    },
    /// Bodies by block hash.
    Bodies(Vec<Hash>),
    /// Receipts by block hash.
    Receipts(Vec<Hash>),
    /// Trie nodes by node hash.
    NodeData(Vec<Hash>),
    /// Contract code by code hash.
    Code(Vec<Hash>),
}

impl Request {
    /// Contiguous header range request.
    pub fn header_range(from: u64, amount: usize) -> Self {
        Self::Headers {
            origin: HeaderOrigin::Number(from),
            amount,
            skip: 0,
            reverse: false,
        }
    }

    /// Single header by hash.
    pub fn header_by_hash(hash: Hash) -> Self {
        Self::Headers {
            origin: HeaderOrigin::Hash(hash),
            amount: 1,
            skip: 0,
            reverse: false,
        }
    }

    /// Data kind of this request.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Headers { .. } => MessageKind::Headers,
            Self::Bodies(_) => MessageKind::Bodies,
            Self::Receipts(_) => MessageKind::Receipts,
            Self::NodeData(_) => MessageKind::NodeData,
            Self::Code(_) => MessageKind::Code,
        }
    }

    /// Number of items asked for.
    pub fn items(&self) -> usize {
        match self {
            Self::Headers { amount, .. } => *amount,
            Self::Bodies(h) | Self::Receipts(h) | Self::NodeData(h) | Self::Code(h) => h.len(),
        }
    }

    /// Approximate encoded size.
    pub fn size_hint(&self) -> usize {
        match self {
            Self::Headers { .. } => 48,
            Self::Bodies(h) | Self::Receipts(h) | Self::NodeData(h) | Self::Code(h) => {
                8 + h.len() * 32
            }
        }
    }
}

/// Typed response from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Headers.
    Headers(Vec<Header>),
    /// Bodies in request order.
    Bodies(Vec<BlockBody>),
    /// Receipts per block in request order.
    Receipts(Vec<Vec<Receipt>>),
    /// Raw trie nodes.
    NodeData(Vec<Vec<u8>>),
    /// Raw code blobs.
    Code(Vec<Vec<u8>>),
}

impl Response {
    /// Data kind of this response.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Headers(_) => MessageKind::Headers,
            Self::Bodies(_) => MessageKind::Bodies,
            Self::Receipts(_) => MessageKind::Receipts,
            Self::NodeData(_) => MessageKind::NodeData,
            Self::Code(_) => MessageKind::Code,
        }
    }

    /// Number of items delivered.
    pub fn items(&self) -> usize {
        match self {
            Self::Headers(v) => v.len(),
            Self::Bodies(v) => v.len(),
            Self::Receipts(v) => v.len(),
            Self::NodeData(v) | Self::Code(v) => v.len(),
        }
    }

    /// Approximate encoded size.
    pub fn size_hint(&self) -> usize {
        match self {
            Self::Headers(v) => v.iter().map(Header::encoded_len).sum(),
            Self::Bodies(v) => v.iter().map(BlockBody::size).sum(),
            Self::Receipts(v) => v
                .iter()
                .flat_map(|rs| rs.iter().map(|r| r.data.len()))
                .sum(),
            Self::NodeData(v) | Self::Code(v) => v.iter().map(Vec::len).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64, parent: Hash) -> Header {
        Header {
            number,
            parent_hash: parent,
            difficulty: 1,
            state_root: Hash::ZERO,
            tx_root: *EMPTY_ROOT,
            receipt_root: *EMPTY_ROOT,
            extra: vec![],
        }
    }

    #[test]
    fn test_header_hash_changes_with_content() {
        let a = header(1, Hash::ZERO);
        let mut b = a.clone();
        b.extra = vec![1];
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.clone().hash());
    }

    #[test]
    fn test_empty_body_detection() {
        let h = header(1, Hash::ZERO);
        assert!(h.is_empty_body());
        assert!(h.is_empty_receipts());
        assert_eq!(BlockBody::default().root(), *EMPTY_ROOT);
    }

    #[test]
    fn test_body_commitment() {
        let body = BlockBody {
            transactions: vec![vec![1, 2], vec![3]],
        };
        let mut h = header(5, Hash::ZERO);
        h.tx_root = body.root();
        let block = Block::new(h.clone(), body);
        assert!(block.verify_body());

        let tampered = Block::new(
            h,
            BlockBody {
                transactions: vec![vec![1, 2]],
            },
        );
        assert!(!tampered.verify_body());
    }

    #[test]
    fn test_state_node_decode_rejects_truncated() {
        let node = StateNode {
            children: vec![Hash::digest(b"a"), Hash::digest(b"b")],
            value: b"leaf".to_vec(),
        };
        let encoded = node.encode();
        assert_eq!(StateNode::decode(&encoded), Some(node));
        assert_eq!(StateNode::decode(&encoded[..40]), None);
        assert_eq!(StateNode::decode(&[]), None);
        assert_eq!(StateNode::decode(&[17]), None);
    }

    #[test]
    fn test_request_kind_and_items() {
        let req = Request::header_range(10, 64);
        assert_eq!(req.kind(), MessageKind::Headers);
        assert_eq!(req.items(), 64);
        let req = Request::NodeData(vec![Hash::ZERO; 3]);
        assert_eq!(req.kind(), MessageKind::NodeData);
        assert_eq!(req.items(), 3);
    }
}
