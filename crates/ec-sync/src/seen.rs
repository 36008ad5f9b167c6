//! Bounded, expiring set of block hashes already handled.
//!
//! Shared by the downloader and the fetcher so a block committed by one is
//! never fetched again by the other.

use ec_network::Hash;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// LRU set with per-entry time-to-live.
pub struct SeenBlocks {
    entries: Mutex<LruCache<Hash, Instant>>,
    ttl: Duration,
}

impl SeenBlocks {
    /// Create a set holding at most `capacity` hashes for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Record a hash. Returns `false` if it was already present and live.
    pub fn insert(&self, hash: Hash) -> bool {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let fresh = match entries.get(&hash) {
            Some(added) => now.duration_since(*added) >= self.ttl,
            None => true,
        };
        if fresh {
            entries.put(hash, now);
        }
        fresh
    }

    /// Whether a live entry exists.
    pub fn contains(&self, hash: &Hash) -> bool {
        let mut entries = self.entries.lock();
        match entries.peek(hash) {
            Some(added) if added.elapsed() < self.ttl => true,
            Some(_) => {
                entries.pop(hash);
                false
            }
            None => false,
        }
    }

    /// Forget a hash.
    pub fn remove(&self, hash: &Hash) {
        self.entries.lock().pop(hash);
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
