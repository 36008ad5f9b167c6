//! # ec-network
//!
//! Peer-facing layer of the chain sync core.
//!
//! This crate provides:
//! - Chain data types and typed peer requests
//! - Peer registry with scoring, backoff and bans
//! - Abstract request/response transport
//! - Metering hooks

mod error;
mod message;
pub mod metrics;
mod peer;
pub mod penalties;
mod scoring;
mod transport;

pub use error::{NetworkError, NetworkResult};
pub use message::{
    list_root, receipts_root, Block, BlockBody, Hash, Head, Header, HeaderOrigin, MessageKind,
    Receipt, Request, Response, StateNode, EMPTY_ROOT, MAX_NODE_CHILDREN,
};
pub use metrics::{CountingMetrics, Meter, Metrics, NoopMetrics, Timer};
pub use peer::{
    Capabilities, PeerId, PeerInfo, PeerRegistry, PeerRegistryConfig, PeerScoreStats, PeerSlot,
};
pub use penalties::{Penalties, PenaltyReason, Rewards};
pub use scoring::PeerScore;
pub use transport::{MeteredTransport, PeerTransport};

/// Protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 66;
