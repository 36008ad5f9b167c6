//! Sync error types.

use ec_network::{NetworkError, PeerId};
use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Peer delivered bad or invalid data.
    #[error("Peer {peer} fault: {reason}")]
    PeerFault { peer: PeerId, reason: String },

    /// Peer did not answer in time.
    #[error("Peer {peer} timed out")]
    Timeout { peer: PeerId },

    /// No eligible peer could serve the request.
    #[error("No peers available after {attempts} attempts")]
    NoPeersAvailable { attempts: u32 },

    /// Retry budget exhausted, last failure was a timeout.
    #[error("Request timed out after {attempts} attempts")]
    RequestTimeout { attempts: u32 },

    /// Response failed structural or hash validation.
    #[error("Inconsistent data: {0}")]
    InconsistentData(String),

    /// The chain collaborator rejected a committed segment.
    #[error("Insertion failed: {0}")]
    InsertionFailure(String),

    /// On-demand retrieval ran out of attempts.
    #[error("Retrieval exhausted after {attempts} attempts")]
    RetrievalExhausted { attempts: u32 },

    /// Cancelled by the caller.
    #[error("Canceled")]
    Canceled,

    /// A sync cycle is already running.
    #[error("Sync already in progress")]
    Busy,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the error is retried locally instead of surfaced.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::PeerFault { .. } | Self::Timeout { .. } | Self::InconsistentData(_) => true,
            Self::Network(e) => e.is_disconnect() || matches!(e, NetworkError::Timeout(_)),
            _ => false,
        }
    }

    /// Whether the error means no peer could be found.
    pub fn is_peer_shortage(&self) -> bool {
        matches!(
            self,
            Self::NoPeersAvailable { .. } | Self::RequestTimeout { .. }
        )
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let peer = PeerId::from_bytes(vec![1]);
        assert!(SyncError::Timeout { peer: peer.clone() }.is_transient());
        assert!(SyncError::PeerFault {
            peer,
            reason: "bad".into()
        }
        .is_transient());
        assert!(SyncError::Network(NetworkError::PeerDropped("x".into())).is_transient());
        assert!(!SyncError::InsertionFailure("x".into()).is_transient());
        assert!(!SyncError::Canceled.is_transient());
        assert!(SyncError::NoPeersAvailable { attempts: 3 }.is_peer_shortage());
    }
}
