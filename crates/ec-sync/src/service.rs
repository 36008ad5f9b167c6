//! Sync service: wires peer events to the registry, fetcher and downloader.

use crate::chain::ChainStore;
use crate::config::SyncConfig;
use crate::distributor::RequestDistributor;
use crate::downloader::Downloader;
use crate::fetcher::{AnnounceOutcome, Fetcher};
use crate::retrieve::RetrieveManager;
use crate::seen::SeenBlocks;
use crate::{SyncError, SyncResult};
use ec_network::{
    Block, Hash, Head, Metrics, NetworkError, PeerId, PeerInfo, PeerRegistry, PeerTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between housekeeping ticks in [`SyncService::run`].
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Events delivered by the peer transport layer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Handshake finished.
    PeerConnected { info: PeerInfo },
    /// Connection closed.
    PeerDisconnected { peer: PeerId },
    /// Peer announced new block hashes.
    NewBlockHashes {
        peer: PeerId,
        hashes: Vec<(Hash, u64)>,
    },
    /// Peer pushed a full block with its total difficulty.
    NewBlock {
        peer: PeerId,
        block: Block,
        td: u128,
    },
    /// Periodic housekeeping.
    Tick,
}

/// The synchronization core as one unit.
pub struct SyncService {
    registry: Arc<PeerRegistry>,
    distributor: RequestDistributor,
    downloader: Arc<Downloader>,
    fetcher: Arc<Fetcher>,
    retriever: Arc<RetrieveManager>,
    seen: Arc<SeenBlocks>,
    shutdown: CancellationToken,
}

impl SyncService {
    /// Build every component from `config`.
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn PeerTransport>,
        chain: Arc<dyn ChainStore>,
        metrics: Arc<dyn Metrics>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let registry = Arc::new(PeerRegistry::new(config.peers.clone()));
        let distributor = RequestDistributor::new(
            Arc::clone(&registry),
            transport,
            metrics,
            config.distributor.clone(),
        );
        let seen = Arc::new(SeenBlocks::new(
            config.fetcher.seen_capacity,
            config.fetcher.seen_ttl(),
        ));
        let downloader = Arc::new(Downloader::new(
            config.downloader.clone(),
            distributor.clone(),
            Arc::clone(&chain),
            Arc::clone(&seen),
        ));
        let fetcher = Arc::new(Fetcher::new(
            config.fetcher.clone(),
            distributor.clone(),
            chain,
            Arc::clone(&seen),
        ));
        let retriever = Arc::new(RetrieveManager::new(
            config.retrieve.clone(),
            distributor.clone(),
        ));

        info!(
            mode = %config.downloader.mode,
            max_peers = config.peers.max_peers,
            "Sync service created"
        );

        Ok(Self {
            registry,
            distributor,
            downloader,
            fetcher,
            retriever,
            seen,
            shutdown: CancellationToken::new(),
        })
    }

    /// Peer registry.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Request distributor.
    pub fn distributor(&self) -> &RequestDistributor {
        &self.distributor
    }

    /// Bulk downloader.
    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.downloader
    }

    /// Announcement fetcher.
    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    /// On-demand retrieval.
    pub fn retriever(&self) -> &Arc<RetrieveManager> {
        &self.retriever
    }

    /// Recently committed or imported blocks.
    pub fn seen(&self) -> &Arc<SeenBlocks> {
        &self.seen
    }

    /// Handle one event.
    pub async fn handle_event(&self, event: SyncEvent) -> SyncResult<()> {
        match event {
            SyncEvent::PeerConnected { info } => self.on_peer_connected(info),
            SyncEvent::PeerDisconnected { peer } => {
                self.on_peer_disconnected(&peer);
                Ok(())
            }
            SyncEvent::NewBlockHashes { peer, hashes } => self.on_block_hashes(&peer, hashes).await,
            SyncEvent::NewBlock { peer, block, td } => self.on_block(&peer, block, td).await,
            SyncEvent::Tick => self.on_tick().await,
        }
    }

    fn on_peer_connected(&self, info: PeerInfo) -> SyncResult<()> {
        let (id, number) = (info.id.clone(), info.head.number);
        self.registry.register(info)?;
        info!(peer = %id, head = number, "Peer connected");
        Ok(())
    }

    fn on_peer_disconnected(&self, peer: &PeerId) {
        if self.registry.unregister(peer).is_some() {
            info!(peer = %peer, "Peer disconnected");
        }
        self.fetcher.forget_peer(peer);
    }

    async fn on_block_hashes(&self, peer: &PeerId, hashes: Vec<(Hash, u64)>) -> SyncResult<()> {
        let Some(info) = self.registry.get_peer(peer) else {
            return Err(SyncError::Network(NetworkError::PeerNotFound(peer.to_string())));
        };

        if let Some(&(hash, number)) = hashes.iter().max_by_key(|(_, n)| *n) {
            if number > info.head.number {
                self.registry
                    .update_head(peer, Head::new(hash, number, info.head.difficulty));
            }
        }

        for (hash, number) in hashes {
            if self.fetcher.announce(peer, hash, number).await == AnnounceOutcome::RateLimited {
                debug!(peer = %peer, "Dropping rest of announcement batch");
                break;
            }
        }
        Ok(())
    }

    async fn on_block(&self, peer: &PeerId, block: Block, td: u128) -> SyncResult<()> {
        if !self.registry.contains(peer) {
            return Err(SyncError::Network(NetworkError::PeerNotFound(peer.to_string())));
        }
        self.registry.update_head(peer, block.header.to_head(td));
        if self.fetcher.broadcast(peer, block).await == AnnounceOutcome::Queued {
            let summary = self.fetcher.fetch_pending().await?;
            debug!(imported = summary.imported, "Processed broadcast block");
        }
        Ok(())
    }

    async fn on_tick(&self) -> SyncResult<()> {
        self.registry.cleanup_expired_bans();
        let summary = self.fetcher.fetch_pending().await?;
        if summary.fetched > 0 || summary.imported > 0 {
            debug!(
                fetched = summary.fetched,
                imported = summary.imported,
                discarded = summary.discarded,
                "Fetcher round"
            );
        }
        Ok(())
    }

    /// Drive the downloader and the event stream until shut down or the
    /// event sender goes away.
    pub async fn run(&self, mut events: mpsc::Receiver<SyncEvent>) {
        let events_loop = async {
            let mut tick = tokio::time::interval(TICK_INTERVAL);
            loop {
                let event = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tick.tick() => SyncEvent::Tick,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match self.handle_event(event).await {
                    Ok(()) => {}
                    Err(SyncError::Canceled) if self.shutdown.is_cancelled() => break,
                    Err(e) => warn!(error = %e, "Sync event failed"),
                }
            }
            self.stop();
        };

        tokio::join!(self.downloader.run(), events_loop);
        info!("Sync service stopped");
    }

    /// Stop the downloader, fetcher, retriever and [`SyncService::run`].
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.downloader.shutdown();
        self.fetcher.shutdown();
        self.retriever.shutdown();
    }
}
