//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Peer is already registered.
    #[error("Duplicate peer: {0}")]
    DuplicatePeer(String),

    /// Peer not found.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Peer is serving a ban.
    #[error("Peer banned: {0}")]
    PeerBanned(String),

    /// Peer was removed while a request to it was outstanding.
    #[error("Peer dropped: {0}")]
    PeerDropped(String),

    /// Too many peers.
    #[error("Too many peers: {count}, max {max}")]
    TooManyPeers { count: usize, max: usize },

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid message.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Request could not be served by the remote side.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// Timeout.
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl NetworkError {
    /// Whether the error was caused by the remote peer going away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::PeerDropped(_) | Self::PeerNotFound(_) | Self::ConnectionClosed
        )
    }
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
