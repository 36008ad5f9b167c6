//! Sync configuration.

use crate::{SyncError, SyncResult};
use ec_network::PeerRegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Peer registry limits.
    #[serde(default)]
    pub peers: PeerRegistryConfig,
    /// Request distribution.
    #[serde(default)]
    pub distributor: DistributorConfig,
    /// Bulk chain download.
    #[serde(default)]
    pub downloader: DownloaderConfig,
    /// Announcement-driven fetching.
    #[serde(default)]
    pub fetcher: FetcherConfig,
    /// On-demand retrieval.
    #[serde(default)]
    pub retrieve: RetrieveConfig,
}

/// Sync mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Download and insert every block with receipts.
    #[default]
    Full,
    /// Full blocks up to a pivot, state trie at the pivot.
    Fast,
    /// Headers only.
    Light,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::Fast => "fast",
            Self::Light => "light",
        })
    }
}

/// Request distribution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Deadline of a single peer request.
    pub request_timeout_ms: u64,
    /// Peers tried before a request fails.
    pub max_attempts: u32,
    /// How long to wait for any eligible peer to appear.
    pub peer_wait_ms: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_attempts: 5,
            peer_wait_ms: 10_000,
        }
    }
}

impl DistributorConfig {
    /// Request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Peer wait bound.
    pub fn peer_wait(&self) -> Duration {
        Duration::from_millis(self.peer_wait_ms)
    }
}

/// Downloader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Sync mode.
    pub mode: SyncMode,
    /// Concurrent header range requests.
    pub header_concurrency: usize,
    /// Concurrent body requests.
    pub body_concurrency: usize,
    /// Concurrent receipt requests.
    pub receipt_concurrency: usize,
    /// Concurrent state node requests.
    pub state_concurrency: usize,
    /// Headers per request.
    pub max_header_fetch: usize,
    /// Bodies per request.
    pub max_body_fetch: usize,
    /// Receipt lists per request.
    pub max_receipt_fetch: usize,
    /// State nodes per request.
    pub max_state_fetch: usize,
    /// Headers per committed segment.
    pub segment_size: usize,
    /// Distance of the fast sync pivot below the remote head.
    pub pivot_depth: u64,
    /// How far below the local head a fork point may lie.
    pub max_fork_ancestry: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Full,
            header_concurrency: 4,
            body_concurrency: 4,
            receipt_concurrency: 4,
            state_concurrency: 4,
            max_header_fetch: 192,
            max_body_fetch: 128,
            max_receipt_fetch: 256,
            max_state_fetch: 384,
            segment_size: 2048,
            pivot_depth: 64,
            max_fork_ancestry: 90_000,
        }
    }
}

/// Fetcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Announcements accepted per peer per window.
    pub announce_limit: usize,
    /// Block broadcasts accepted per peer per window.
    pub broadcast_limit: usize,
    /// Rate window length.
    pub rate_window_ms: u64,
    /// How long an announcement may wait in the queue.
    pub announce_ttl_ms: u64,
    /// Maximum distance above the local head.
    pub max_queue_dist: u64,
    /// Maximum distance below the local head.
    pub max_uncle_dist: u64,
    /// Ancestors fetched to connect an orphan block.
    pub max_parent_depth: usize,
    /// Seen-block cache capacity.
    pub seen_capacity: usize,
    /// Seen-block cache entry lifetime.
    pub seen_ttl_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            announce_limit: 256,
            broadcast_limit: 64,
            rate_window_ms: 60_000,
            announce_ttl_ms: 5_000,
            max_queue_dist: 32,
            max_uncle_dist: 7,
            max_parent_depth: 8,
            seen_capacity: 4096,
            seen_ttl_ms: 600_000,
        }
    }
}

impl FetcherConfig {
    /// Rate window.
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    /// Announcement lifetime.
    pub fn announce_ttl(&self) -> Duration {
        Duration::from_millis(self.announce_ttl_ms)
    }

    /// Seen entry lifetime.
    pub fn seen_ttl(&self) -> Duration {
        Duration::from_millis(self.seen_ttl_ms)
    }
}

/// On-demand retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    /// Peers tried before a retrieval fails.
    pub max_attempts: u32,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl SyncConfig {
    /// Parse from TOML.
    pub fn from_toml_str(content: &str) -> SyncResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> SyncResult<String> {
        toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        let nonzero = [
            ("peers.max_peers", self.peers.max_peers),
            ("peers.max_in_flight_per_peer", self.peers.max_in_flight_per_peer),
            ("downloader.header_concurrency", self.downloader.header_concurrency),
            ("downloader.body_concurrency", self.downloader.body_concurrency),
            ("downloader.receipt_concurrency", self.downloader.receipt_concurrency),
            ("downloader.state_concurrency", self.downloader.state_concurrency),
            ("downloader.max_header_fetch", self.downloader.max_header_fetch),
            ("downloader.max_body_fetch", self.downloader.max_body_fetch),
            ("downloader.max_receipt_fetch", self.downloader.max_receipt_fetch),
            ("downloader.max_state_fetch", self.downloader.max_state_fetch),
            ("downloader.segment_size", self.downloader.segment_size),
            ("fetcher.seen_capacity", self.fetcher.seen_capacity),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(SyncError::Config(format!("{} must be positive", name)));
        }
        if self.distributor.max_attempts == 0 || self.retrieve.max_attempts == 0 {
            return Err(SyncError::Config("max_attempts must be positive".into()));
        }
        if self.distributor.request_timeout_ms == 0 {
            return Err(SyncError::Config(
                "distributor.request_timeout_ms must be positive".into(),
            ));
        }
        if self.peers.backoff_base_ms > self.peers.backoff_max_ms {
            return Err(SyncError::Config(
                "peers.backoff_base_ms exceeds peers.backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            [downloader]
            mode = "fast"
            pivot_depth = 16

            [fetcher]
            announce_limit = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.downloader.mode, SyncMode::Fast);
        assert_eq!(config.downloader.pivot_depth, 16);
        assert_eq!(config.downloader.max_header_fetch, 192);
        assert_eq!(config.fetcher.announce_limit, 10);
        assert_eq!(config.peers.max_peers, 25);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SyncConfig::from_toml_str("[downloader]\nsegment_size = 0\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let err = SyncConfig::from_toml_str(
            "[peers]\nbackoff_base_ms = 10\nbackoff_max_ms = 5\n",
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        let mut config = SyncConfig::default();
        config.distributor.max_attempts = 9;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.distributor.max_attempts, 9);
    }
}
