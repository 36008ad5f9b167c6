//! Peer registry.
//!
//! The registry is the single source of truth for peer liveness, advertised
//! heads and busy/backoff state. Other components refer to peers by
//! [`PeerId`] only and go through the registry for every mutation, so a
//! peer removed mid-request can never be used after removal: its
//! cancellation token fires and every waiter pinned to it wakes up.

use crate::message::Head;
use crate::penalties::PenaltyReason;
use crate::scoring::PeerScore;
use crate::{NetworkError, NetworkResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Round trip a request should take at the peer's measured throughput.
const TARGET_RTT: Duration = Duration::from_millis(500);

/// Unique peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub Vec<u8>);

impl PeerId {
    /// Create from bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Data a peer is able to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    /// Block headers.
    pub const HEADERS: Self = Self(1);
    /// Block bodies.
    pub const BODIES: Self = Self(1 << 1);
    /// Receipts.
    pub const RECEIPTS: Self = Self(1 << 2);
    /// State trie nodes and code.
    pub const STATE: Self = Self(1 << 3);
    /// Canonical hash trie nodes.
    pub const CHT: Self = Self(1 << 4);
    /// Bloom trie nodes.
    pub const BLOOM_TRIE: Self = Self(1 << 5);
    /// Everything a full node serves.
    pub const FULL: Self = Self(0b0000_1111);
    /// Everything a light server serves.
    pub const LIGHT_SERVER: Self = Self(0b0011_1111);

    /// No capabilities.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether all of `other` is present.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Registered peer record.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Peer identifier.
    pub id: PeerId,
    /// Advertised chain head.
    pub head: Head,
    /// Protocol version.
    pub version: u32,
    /// Served data.
    pub capabilities: Capabilities,
    /// Score.
    pub score: PeerScore,
    /// Outstanding requests.
    pub in_flight: usize,
    /// Excluded from selection until this instant.
    pub backoff_until: Option<Instant>,
    /// Consecutive failures driving the backoff window.
    pub backoff_count: u32,
    /// Registration time.
    pub registered_at: Instant,
    /// Last head update.
    pub last_seen: Instant,
    /// Registration order, used for deterministic tie-breaks.
    seq: u64,
}

impl PeerInfo {
    /// New peer record.
    pub fn new(id: PeerId, head: Head, version: u32, capabilities: Capabilities) -> Self {
        let now = Instant::now();
        Self {
            id,
            head,
            version,
            capabilities,
            score: PeerScore::new(),
            in_flight: 0,
            backoff_until: None,
            backoff_count: 0,
            registered_at: now,
            last_seen: now,
            seq: 0,
        }
    }

    /// Registration sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Ranking value for otherwise equal peers.
    pub fn priority(&self) -> f64 {
        self.score.priority()
    }

    /// Whether the peer is excluded by a backoff window at `now`.
    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.backoff_until.map(|t| now < t).unwrap_or(false)
    }

    /// Whether the peer serves all of `caps`.
    pub fn serves(&self, caps: Capabilities) -> bool {
        self.capabilities.contains(caps)
    }
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerRegistryConfig {
    /// Maximum registered peers.
    pub max_peers: usize,
    /// Concurrent requests a single peer may carry.
    pub max_in_flight_per_peer: usize,
    /// First backoff window after a failure.
    pub backoff_base_ms: u64,
    /// Upper bound of the backoff window.
    pub backoff_max_ms: u64,
    /// Ban length after crossing the penalty threshold.
    pub ban_duration_secs: u64,
}

impl Default for PeerRegistryConfig {
    fn default() -> Self {
        Self {
            max_peers: 25,
            max_in_flight_per_peer: 1,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            ban_duration_secs: 3600,
        }
    }
}

impl PeerRegistryConfig {
    /// Backoff window after `failures` consecutive failures.
    ///
    /// Doubles per failure and saturates at `backoff_max_ms`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let base = Duration::from_millis(self.backoff_base_ms);
        base.saturating_mul(1u32 << exp)
            .min(Duration::from_millis(self.backoff_max_ms))
    }

    /// Ban length.
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }
}

struct PeerEntry {
    info: PeerInfo,
    /// Fires when the peer is removed.
    token: CancellationToken,
}

/// Busy slot on a peer, released when dropped.
pub struct PeerSlot {
    registry: Arc<PeerRegistry>,
    peer: PeerId,
    token: CancellationToken,
}

impl PeerSlot {
    /// The reserved peer.
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Token cancelled when the peer is unregistered.
    pub fn dropped(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PeerSlot {
    fn drop(&mut self) {
        self.registry.release(&self.peer);
    }
}

impl std::fmt::Debug for PeerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSlot").field("peer", &self.peer).finish()
    }
}

/// Thread-safe peer bookkeeping.
pub struct PeerRegistry {
    /// Configuration.
    config: PeerRegistryConfig,
    /// Registered peers.
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    /// Banned peers (id -> unban time).
    banned: DashMap<PeerId, Instant>,
    /// Next registration sequence number.
    next_seq: AtomicU64,
    /// Woken on every change that can make a peer selectable.
    changed: Notify,
}

impl PeerRegistry {
    /// Create a new registry.
    pub fn new(config: PeerRegistryConfig) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
            banned: DashMap::new(),
            next_seq: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    /// Registry configuration.
    pub fn config(&self) -> &PeerRegistryConfig {
        &self.config
    }

    /// Register a peer after handshake.
    pub fn register(&self, mut info: PeerInfo) -> NetworkResult<()> {
        if self.is_banned(&info.id) {
            return Err(NetworkError::PeerBanned(info.id.to_string()));
        }

        let mut peers = self.peers.write();
        if peers.contains_key(&info.id) {
            return Err(NetworkError::DuplicatePeer(info.id.to_string()));
        }
        if peers.len() >= self.config.max_peers {
            return Err(NetworkError::TooManyPeers {
                count: peers.len(),
                max: self.config.max_peers,
            });
        }

        info.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        info!(
            peer = %info.id,
            number = info.head.number,
            version = info.version,
            "Registered peer"
        );
        peers.insert(
            info.id.clone(),
            PeerEntry {
                info,
                token: CancellationToken::new(),
            },
        );
        drop(peers);

        self.changed.notify_waiters();
        Ok(())
    }

    /// Remove a peer, failing every request pinned to it.
    pub fn unregister(&self, id: &PeerId) -> Option<PeerInfo> {
        let entry = self.peers.write().remove(id)?;
        entry.token.cancel();
        info!(peer = %id, in_flight = entry.info.in_flight, "Unregistered peer");
        self.changed.notify_waiters();
        Some(entry.info)
    }

    /// Record a new advertised head. Returns `false` for unknown peers.
    pub fn update_head(&self, id: &PeerId, head: Head) -> bool {
        let updated = match self.peers.write().get_mut(id) {
            Some(entry) => {
                entry.info.head = head;
                entry.info.last_seen = Instant::now();
                true
            }
            None => false,
        };
        if updated {
            self.changed.notify_waiters();
        }
        updated
    }

    /// Peer with the highest advertised head, earliest registered on ties.
    pub fn best_peer(&self) -> Option<PeerInfo> {
        self.best_peer_excluding(&HashSet::new())
    }

    /// [`PeerRegistry::best_peer`] ignoring the peers in `exclude`.
    pub fn best_peer_excluding(&self, exclude: &HashSet<PeerId>) -> Option<PeerInfo> {
        self.peers
            .read()
            .values()
            .map(|e| &e.info)
            .filter(|p| !exclude.contains(&p.id))
            .max_by(|a, b| {
                a.head
                    .number
                    .cmp(&b.head.number)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .cloned()
    }

    /// Snapshot of a peer.
    pub fn get_peer(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get(id).map(|e| e.info.clone())
    }

    /// Whether a peer is registered.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Snapshot of all peers in registration order.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.peers.read().values().map(|e| e.info.clone()).collect();
        peers.sort_by_key(|p| p.seq);
        peers
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Peers currently carrying at least one request.
    pub fn busy_peers(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|e| e.info.in_flight > 0)
            .map(|e| e.info.id.clone())
            .collect()
    }

    /// Token cancelled when the peer goes away.
    pub fn peer_token(&self, id: &PeerId) -> Option<CancellationToken> {
        self.peers.read().get(id).map(|e| e.token.clone())
    }

    /// Future resolving on the next registry change.
    ///
    /// Create it before inspecting the registry so no change is missed.
    pub fn notified(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Reserve a busy slot on a specific peer.
    pub fn try_reserve(self: &Arc<Self>, id: &PeerId) -> Option<PeerSlot> {
        let now = Instant::now();
        let mut peers = self.peers.write();
        let entry = peers.get_mut(id)?;
        if entry.info.is_backing_off(now)
            || entry.info.in_flight >= self.config.max_in_flight_per_peer
        {
            return None;
        }
        entry.info.in_flight += 1;
        Some(PeerSlot {
            registry: Arc::clone(self),
            peer: id.clone(),
            token: entry.token.clone(),
        })
    }

    /// Pick and reserve the best idle peer accepted by `filter`.
    ///
    /// Least loaded first, then peers never asked before, then highest
    /// throughput, then best score, then earliest registered.
    pub fn reserve_best<F>(self: &Arc<Self>, filter: F, exclude: &HashSet<PeerId>) -> Option<PeerSlot>
    where
        F: Fn(&PeerInfo) -> bool,
    {
        let now = Instant::now();
        let mut peers = self.peers.write();
        let best = peers
            .values()
            .map(|e| &e.info)
            .filter(|p| !exclude.contains(&p.id))
            .filter(|p| !p.is_backing_off(now))
            .filter(|p| p.in_flight < self.config.max_in_flight_per_peer)
            .filter(|p| filter(p))
            .min_by(|a, b| {
                a.in_flight
                    .cmp(&b.in_flight)
                    .then_with(|| b.score.is_untried().cmp(&a.score.is_untried()))
                    .then_with(|| {
                        b.score
                            .throughput()
                            .partial_cmp(&a.score.throughput())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| {
                        b.priority()
                            .partial_cmp(&a.priority())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .map(|p| p.id.clone())?;

        let entry = peers.get_mut(&best)?;
        entry.info.in_flight += 1;
        Some(PeerSlot {
            registry: Arc::clone(self),
            peer: best,
            token: entry.token.clone(),
        })
    }

    /// Whether any registered peer outside `exclude` passes `filter`,
    /// busy or not.
    pub fn has_candidate<F>(&self, filter: F, exclude: &HashSet<PeerId>) -> bool
    where
        F: Fn(&PeerInfo) -> bool,
    {
        self.peers
            .read()
            .values()
            .any(|e| !exclude.contains(&e.info.id) && filter(&e.info))
    }

    /// Time until the earliest backoff window of a candidate expires.
    pub fn next_backoff_expiry<F>(&self, filter: F, exclude: &HashSet<PeerId>) -> Option<Duration>
    where
        F: Fn(&PeerInfo) -> bool,
    {
        let now = Instant::now();
        self.peers
            .read()
            .values()
            .filter(|e| !exclude.contains(&e.info.id) && filter(&e.info))
            .filter_map(|e| e.info.backoff_until)
            .filter(|t| *t > now)
            .map(|t| t - now)
            .min()
    }

    fn release(&self, id: &PeerId) {
        if let Some(entry) = self.peers.write().get_mut(id) {
            entry.info.in_flight = entry.info.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    /// Exclude a peer from selection for its next backoff window.
    pub fn backoff(&self, id: &PeerId) -> Option<Duration> {
        let mut peers = self.peers.write();
        let entry = peers.get_mut(id)?;
        entry.info.backoff_count = entry.info.backoff_count.saturating_add(1);
        let delay = self.config.backoff_delay(entry.info.backoff_count);
        entry.info.backoff_until = Some(Instant::now() + delay);
        debug!(
            peer = %id,
            failures = entry.info.backoff_count,
            delay_ms = delay.as_millis() as u64,
            "Peer backing off"
        );
        Some(delay)
    }

    /// Clear the backoff window after a good delivery.
    pub fn clear_backoff(&self, id: &PeerId) {
        if let Some(entry) = self.peers.write().get_mut(id) {
            entry.info.backoff_count = 0;
            entry.info.backoff_until = None;
        }
    }

    /// Apply a penalty. Returns `true` when the peer got banned and removed.
    pub fn penalize(&self, id: &PeerId, reason: PenaltyReason) -> bool {
        let mut peers = self.peers.write();
        let Some(entry) = peers.get_mut(id) else {
            return false;
        };

        if !entry.info.score.apply_penalty(reason) {
            debug!(
                peer = %id,
                reason = %reason,
                penalty = entry.info.score.current_penalty(),
                "Penalized peer"
            );
            return false;
        }

        warn!(
            peer = %id,
            reason = %reason,
            penalty = entry.info.score.current_penalty(),
            "Banning peer"
        );
        if let Some(entry) = peers.remove(id) {
            entry.token.cancel();
        }
        drop(peers);
        self.banned
            .insert(id.clone(), Instant::now() + self.config.ban_duration());
        self.changed.notify_waiters();
        true
    }

    /// Record a good delivery.
    pub fn record_delivery(&self, id: &PeerId, items: usize, elapsed: Duration) {
        if let Some(entry) = self.peers.write().get_mut(id) {
            entry.info.score.record_delivery(items, elapsed);
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self, id: &PeerId) {
        if let Some(entry) = self.peers.write().get_mut(id) {
            entry.info.score.record_failure();
        }
    }

    /// Request size suited to a peer's throughput, at most `max`.
    pub fn capacity(&self, id: &PeerId, max: usize) -> usize {
        self.peers
            .read()
            .get(id)
            .map(|e| capacity_for(&e.info, max))
            .unwrap_or(max)
    }

    /// Median request size across registered peers, at most `max`.
    pub fn median_capacity(&self, max: usize) -> usize {
        let mut caps: Vec<usize> = self
            .peers
            .read()
            .values()
            .map(|e| capacity_for(&e.info, max))
            .collect();
        if caps.is_empty() {
            return max;
        }
        caps.sort_unstable();
        caps[caps.len() / 2]
    }

    /// Whether a peer is serving a ban.
    pub fn is_banned(&self, id: &PeerId) -> bool {
        if let Some(unban_time) = self.banned.get(id) {
            if Instant::now() < *unban_time {
                return true;
            }
        }
        self.banned.remove(id);
        false
    }

    /// Lift a ban.
    pub fn unban(&self, id: &PeerId) {
        self.banned.remove(id);
        info!(peer = %id, "Unbanned peer");
    }

    /// Drop expired bans.
    pub fn cleanup_expired_bans(&self) {
        let now = Instant::now();
        self.banned.retain(|_, unban| *unban > now);
    }

    /// Aggregate score statistics.
    pub fn score_stats(&self) -> PeerScoreStats {
        let peers = self.peers();
        if peers.is_empty() {
            return PeerScoreStats {
                banned_count: self.banned.len(),
                ..Default::default()
            };
        }

        let penalties: Vec<u32> = peers.iter().map(|p| p.score.current_penalty()).collect();
        PeerScoreStats {
            peer_count: peers.len(),
            avg_penalty: penalties.iter().sum::<u32>() / penalties.len() as u32,
            max_penalty: penalties.iter().copied().max().unwrap_or(0),
            avg_priority: peers.iter().map(PeerInfo::priority).sum::<f64>() / peers.len() as f64,
            busy_count: peers.iter().filter(|p| p.in_flight > 0).count(),
            banned_count: self.banned.len(),
        }
    }
}

fn capacity_for(info: &PeerInfo, max: usize) -> usize {
    let throughput = info.score.throughput();
    if throughput <= 0.0 {
        return max;
    }
    let items = (throughput * TARGET_RTT.as_secs_f64()).ceil() as usize;
    items.clamp(1, max.max(1))
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(PeerRegistryConfig::default())
    }
}

/// Statistics about peer scores.
#[derive(Debug, Clone, Default)]
pub struct PeerScoreStats {
    /// Registered peers.
    pub peer_count: usize,
    /// Average penalty.
    pub avg_penalty: u32,
    /// Highest penalty.
    pub max_penalty: u32,
    /// Average priority.
    pub avg_priority: f64,
    /// Peers carrying requests.
    pub busy_count: usize,
    /// Banned peers.
    pub banned_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Hash;

    fn peer(id: u8, number: u64) -> PeerInfo {
        PeerInfo::new(
            PeerId::from_bytes(vec![id]),
            Head::new(Hash::digest(&[id]), number, number as u128),
            66,
            Capabilities::FULL,
        )
    }

    fn registry() -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry::default())
    }

    #[test]
    fn test_register_duplicate() {
        let reg = registry();
        reg.register(peer(1, 10)).unwrap();
        let err = reg.register(peer(1, 20)).unwrap_err();
        assert!(matches!(err, NetworkError::DuplicatePeer(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_limit() {
        let reg = Arc::new(PeerRegistry::new(PeerRegistryConfig {
            max_peers: 1,
            ..Default::default()
        }));
        reg.register(peer(1, 10)).unwrap();
        assert!(matches!(
            reg.register(peer(2, 10)),
            Err(NetworkError::TooManyPeers { count: 1, max: 1 })
        ));
    }

    #[test]
    fn test_best_peer_tie_break() {
        let reg = registry();
        reg.register(peer(3, 100)).unwrap();
        reg.register(peer(1, 150)).unwrap();
        reg.register(peer(2, 150)).unwrap();
        assert_eq!(reg.best_peer().unwrap().id, PeerId::from_bytes(vec![1]));

        reg.update_head(
            &PeerId::from_bytes(vec![3]),
            Head::new(Hash::ZERO, 151, 151),
        );
        assert_eq!(reg.best_peer().unwrap().id, PeerId::from_bytes(vec![3]));
    }

    #[test]
    fn test_unregister_cancels_token() {
        let reg = registry();
        reg.register(peer(1, 10)).unwrap();
        let id = PeerId::from_bytes(vec![1]);
        let slot = reg.try_reserve(&id).unwrap();
        assert!(!slot.dropped().is_cancelled());

        reg.unregister(&id).unwrap();
        assert!(slot.dropped().is_cancelled());
        drop(slot);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_slot_release_on_drop() {
        let reg = registry();
        reg.register(peer(1, 10)).unwrap();
        let id = PeerId::from_bytes(vec![1]);

        let slot = reg.try_reserve(&id).unwrap();
        assert!(reg.try_reserve(&id).is_none());
        assert_eq!(reg.busy_peers(), vec![id.clone()]);

        drop(slot);
        assert!(reg.busy_peers().is_empty());
        assert!(reg.try_reserve(&id).is_some());
    }

    #[test]
    fn test_backoff_is_bounded_exponential() {
        let config = PeerRegistryConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_excludes_from_selection() {
        let reg = registry();
        reg.register(peer(1, 10)).unwrap();
        reg.register(peer(2, 10)).unwrap();
        let one = PeerId::from_bytes(vec![1]);

        reg.backoff(&one);
        let slot = reg.reserve_best(|_| true, &HashSet::new()).unwrap();
        assert_eq!(slot.peer(), &PeerId::from_bytes(vec![2]));
        assert!(reg.next_backoff_expiry(|_| true, &HashSet::new()).is_some());

        reg.clear_backoff(&one);
        let slot2 = reg.reserve_best(|_| true, &HashSet::new()).unwrap();
        assert_eq!(slot2.peer(), &one);
    }

    #[test]
    fn test_reserve_best_prefers_idle_and_respects_filter() {
        let reg = Arc::new(PeerRegistry::new(PeerRegistryConfig {
            max_in_flight_per_peer: 2,
            ..Default::default()
        }));
        reg.register(peer(1, 10)).unwrap();
        reg.register(peer(2, 50)).unwrap();

        let first = reg.reserve_best(|_| true, &HashSet::new()).unwrap();
        assert_eq!(first.peer(), &PeerId::from_bytes(vec![1]));
        let second = reg.reserve_best(|_| true, &HashSet::new()).unwrap();
        assert_eq!(second.peer(), &PeerId::from_bytes(vec![2]));

        let tall = reg
            .reserve_best(|p| p.head.number >= 50, &HashSet::new())
            .unwrap();
        assert_eq!(tall.peer(), &PeerId::from_bytes(vec![2]));

        let mut exclude = HashSet::new();
        exclude.insert(PeerId::from_bytes(vec![2]));
        assert!(reg.reserve_best(|p| p.head.number >= 50, &exclude).is_none());
        assert!(!reg.has_candidate(|p| p.head.number >= 50, &exclude));
    }

    #[test]
    fn test_reserve_best_asks_untried_peer_first() {
        let reg = registry();
        reg.register(peer(1, 10)).unwrap();
        reg.register(peer(2, 10)).unwrap();
        let one = PeerId::from_bytes(vec![1]);
        let two = PeerId::from_bytes(vec![2]);

        reg.record_delivery(&one, 500, Duration::from_millis(10));
        let slot = reg.reserve_best(|_| true, &HashSet::new()).unwrap();
        assert_eq!(slot.peer(), &two);
        drop(slot);

        // Once both have answered, throughput decides.
        reg.record_delivery(&two, 1, Duration::from_secs(1));
        let slot = reg.reserve_best(|_| true, &HashSet::new()).unwrap();
        assert_eq!(slot.peer(), &one);
    }

    #[test]
    fn test_best_peer_excluding() {
        let reg = registry();
        reg.register(peer(1, 150)).unwrap();
        reg.register(peer(2, 120)).unwrap();
        let mut exclude = HashSet::new();
        exclude.insert(PeerId::from_bytes(vec![1]));

        let best = reg.best_peer_excluding(&exclude).unwrap();
        assert_eq!(best.id, PeerId::from_bytes(vec![2]));
        exclude.insert(PeerId::from_bytes(vec![2]));
        assert!(reg.best_peer_excluding(&exclude).is_none());
    }

    #[test]
    fn test_penalty_and_ban() {
        let reg = registry();
        reg.register(peer(1, 10)).unwrap();
        let id = PeerId::from_bytes(vec![1]);
        let token = reg.peer_token(&id).unwrap();

        assert!(!reg.penalize(&id, PenaltyReason::ContentMismatch));
        assert!(reg.contains(&id));

        assert!(reg.penalize(&id, PenaltyReason::MaliciousBehavior));
        assert!(!reg.contains(&id));
        assert!(token.is_cancelled());
        assert!(reg.is_banned(&id));
        assert!(matches!(
            reg.register(peer(1, 10)),
            Err(NetworkError::PeerBanned(_))
        ));

        reg.unban(&id);
        assert!(reg.register(peer(1, 10)).is_ok());
    }

    #[test]
    fn test_capacity_follows_throughput() {
        let reg = registry();
        reg.register(peer(1, 10)).unwrap();
        let id = PeerId::from_bytes(vec![1]);
        assert_eq!(reg.capacity(&id, 192), 192);

        reg.record_delivery(&id, 20, Duration::from_secs(1));
        assert_eq!(reg.capacity(&id, 192), 10);
        assert_eq!(reg.median_capacity(192), 10);
    }

    #[test]
    fn test_score_stats() {
        let reg = registry();
        for id in 1..=5 {
            reg.register(peer(id, 10)).unwrap();
        }
        let stats = reg.score_stats();
        assert_eq!(stats.peer_count, 5);
        assert_eq!(stats.avg_penalty, 0);
        assert_eq!(stats.busy_count, 0);
    }
}
