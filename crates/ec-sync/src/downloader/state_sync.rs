//! State trie download bookkeeping.
//!
//! State nodes are content addressed, so the download is just a set of
//! node hashes still to fetch. The set can be checkpointed at any time and
//! a resumed download only asks for what was never confirmed.

use crate::{SyncError, SyncResult};
use ec_network::{Hash, StateNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Resumable snapshot of an unfinished state download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSyncCheckpoint {
    /// State root being downloaded.
    pub root: Hash,
    /// Block number of the root.
    pub number: u64,
    /// Hashes not yet confirmed.
    pub pending: BTreeSet<Hash>,
    /// Nodes confirmed before the checkpoint.
    pub confirmed: u64,
}

impl StateSyncCheckpoint {
    /// Write as JSON.
    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| SyncError::Internal(format!("checkpoint encode: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| SyncError::Internal(format!("checkpoint write: {}", e)))
    }

    /// Read from JSON.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let data = std::fs::read(path)
            .map_err(|e| SyncError::Internal(format!("checkpoint read: {}", e)))?;
        serde_json::from_slice(&data)
            .map_err(|e| SyncError::Internal(format!("checkpoint decode: {}", e)))
    }
}

/// Pending/in-flight/confirmed node tracking for one state root.
#[derive(Debug)]
pub struct StateSync {
    root: Hash,
    number: u64,
    pending: BTreeSet<Hash>,
    in_flight: HashSet<Hash>,
    confirmed: u64,
}

impl StateSync {
    /// Start a fresh download of `root`.
    pub fn new(root: Hash, number: u64) -> Self {
        let mut pending = BTreeSet::new();
        pending.insert(root);
        Self {
            root,
            number,
            pending,
            in_flight: HashSet::new(),
            confirmed: 0,
        }
    }

    /// Continue from a checkpoint.
    pub fn resume(checkpoint: StateSyncCheckpoint) -> Self {
        Self {
            root: checkpoint.root,
            number: checkpoint.number,
            pending: checkpoint.pending,
            in_flight: HashSet::new(),
            confirmed: checkpoint.confirmed,
        }
    }

    /// Root being downloaded.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Take up to `max` hashes to request.
    pub fn next_batch(&mut self, max: usize) -> Vec<Hash> {
        let mut batch = Vec::with_capacity(max.min(self.pending.len()));
        while batch.len() < max {
            let Some(hash) = self.pending.pop_first() else {
                break;
            };
            self.in_flight.insert(hash);
            batch.push(hash);
        }
        batch
    }

    /// Match delivered blobs to the requested hashes.
    ///
    /// Returns the verified `(hash, blob)` pairs, or `Err` with the first
    /// blob that hashes to nothing requested.
    pub fn match_delivery(
        requested: &[Hash],
        blobs: Vec<Vec<u8>>,
    ) -> Result<Vec<(Hash, Vec<u8>)>, Hash> {
        let wanted: HashSet<&Hash> = requested.iter().collect();
        let mut out = Vec::with_capacity(blobs.len());
        let mut taken = HashSet::new();
        for blob in blobs {
            let hash = Hash::digest(&blob);
            if !wanted.contains(&hash) {
                return Err(hash);
            }
            if taken.insert(hash) {
                out.push((hash, blob));
            }
        }
        Ok(out)
    }

    /// Record verified nodes for a requested batch.
    ///
    /// Requested hashes without a node go back to pending. Returns the child
    /// hashes referenced by the delivered nodes; the caller feeds those it
    /// does not already store to [`StateSync::schedule`].
    pub fn confirm(&mut self, requested: &[Hash], nodes: &[(Hash, Vec<u8>)]) -> Vec<Hash> {
        let delivered: HashSet<Hash> = nodes.iter().map(|(h, _)| *h).collect();
        for hash in requested {
            if self.in_flight.remove(hash) && !delivered.contains(hash) {
                self.pending.insert(*hash);
            }
        }
        self.confirmed += delivered.len() as u64;

        nodes
            .iter()
            .filter_map(|(_, blob)| StateNode::decode(blob))
            .flat_map(|node| node.children)
            .collect()
    }

    /// Put a failed batch back.
    pub fn retry(&mut self, requested: &[Hash]) {
        for hash in requested {
            if self.in_flight.remove(hash) {
                self.pending.insert(*hash);
            }
        }
    }

    /// Queue a newly discovered node.
    pub fn schedule(&mut self, hash: Hash) {
        if !self.in_flight.contains(&hash) {
            self.pending.insert(hash);
        }
    }

    /// Whether every node has been confirmed.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Nodes confirmed so far.
    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    /// Nodes known but not yet confirmed.
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    /// Snapshot for resumption; in-flight hashes count as pending.
    pub fn checkpoint(&self) -> StateSyncCheckpoint {
        let mut pending = self.pending.clone();
        pending.extend(self.in_flight.iter().copied());
        StateSyncCheckpoint {
            root: self.root,
            number: self.number,
            pending,
            confirmed: self.confirmed,
        }
    }
}
