//! Range task scheduling and in-order result assembly.

use std::collections::{BTreeMap, BTreeSet};

/// A contiguous, inclusive block number range to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncTask {
    /// First block number.
    pub start: u64,
    /// Last block number.
    pub end: u64,
}

impl SyncTask {
    /// Create a task for `start..=end`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Number of blocks covered.
    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    /// Tasks are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether two tasks share a block.
    pub fn overlaps(&self, other: &SyncTask) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Queue of range tasks for one data kind.
///
/// Tasks handed out by [`TaskQueue::reserve`] never overlap each other or
/// anything still pending.
#[derive(Debug, Default)]
pub struct TaskQueue {
    /// Not yet dispatched, ordered by start.
    pending: BTreeSet<SyncTask>,
    /// Dispatched (start -> task).
    in_flight: BTreeMap<u64, SyncTask>,
    /// Completed block count.
    completed: u64,
}

impl TaskQueue {
    /// Cover `start..=end` with tasks of `chunk` blocks ending exactly at
    /// `end`; only the first task may be shorter.
    pub fn new(start: u64, end: u64, chunk: usize) -> Self {
        let mut queue = Self::default();
        if start > end {
            return queue;
        }
        let chunk = chunk.max(1) as u64;
        let mut to = end;
        loop {
            let from = to.saturating_sub(chunk - 1).max(start);
            queue.pending.insert(SyncTask::new(from, to));
            if from == start {
                break;
            }
            to = from - 1;
        }
        queue
    }

    /// Last block number of every task, ascending.
    pub fn ends(&self) -> Vec<u64> {
        self.pending
            .iter()
            .chain(self.in_flight.values())
            .map(|t| t.end)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Take the lowest pending task.
    pub fn reserve(&mut self) -> Option<SyncTask> {
        let task = self.pending.pop_first()?;
        self.in_flight.insert(task.start, task);
        Some(task)
    }

    /// Mark a dispatched task as delivered.
    pub fn complete(&mut self, task: SyncTask) {
        if self.in_flight.remove(&task.start).is_some() {
            self.completed += task.len() as u64;
        }
    }

    /// Whether nothing is pending or in flight.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Dispatched tasks.
    pub fn in_flight(&self) -> impl Iterator<Item = &SyncTask> {
        self.in_flight.values()
    }

    /// Queue statistics.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            completed: self.completed,
        }
    }
}

/// Task queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Pending tasks.
    pub pending: usize,
    /// In-flight tasks.
    pub in_flight: usize,
    /// Completed blocks.
    pub completed: u64,
}

/// Holds out-of-order range results until the next expected one arrives.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    ready: BTreeMap<u64, (SyncTask, T)>,
}

impl<T> ReorderBuffer<T> {
    /// Buffer whose first released task starts at `next`.
    pub fn new(next: u64) -> Self {
        Self {
            next,
            ready: BTreeMap::new(),
        }
    }

    /// Next block number to be released.
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Store a result.
    pub fn insert(&mut self, task: SyncTask, value: T) {
        self.ready.insert(task.start, (task, value));
    }

    /// Release the result starting at the next expected number, if present.
    pub fn pop(&mut self) -> Option<(SyncTask, T)> {
        let (task, value) = self.ready.remove(&self.next)?;
        self.next = task.end + 1;
        Some((task, value))
    }

    /// Buffered results.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}
