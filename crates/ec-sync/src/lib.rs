//! # ec-sync
//!
//! Chain synchronization for the ecchain node.
//!
//! This crate provides:
//! - Request distribution with retry, backoff and peer balancing
//! - Full, fast and light chain download
//! - Resumable state download
//! - Announcement-driven block fetching with per-peer flood limits
//! - Self-verifying on-demand retrieval for light clients

mod chain;
mod config;
mod distributor;
pub mod downloader;
mod error;
mod fetcher;
mod retrieve;
mod seen;
mod service;

pub use chain::ChainStore;
pub use config::{
    DistributorConfig, DownloaderConfig, FetcherConfig, RetrieveConfig, SyncConfig, SyncMode,
};
pub use distributor::{Delivered, DistRequest, Fault, RequestDistributor};
pub use downloader::{
    Downloader, StateSyncCheckpoint, SyncProgress, SyncReport, SyncStage, SyncTask,
};
pub use error::{SyncError, SyncResult};
pub use fetcher::{AnnounceOutcome, Announcement, FetchSummary, Fetcher};
pub use retrieve::{RetrievalRequest, RetrieveManager, Retrieved};
pub use seen::SeenBlocks;
pub use service::{SyncEvent, SyncService, TICK_INTERVAL};
