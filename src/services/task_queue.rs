//! Priority queue of task ids with lazy-deletion cancellation.
//!
//! Entries are ordered by `(priority, created_at)` with an insertion
//! sequence as the final tie-break, so equal-priority tasks leave in
//! creation order. Removing a queued task only drops its live marker; the
//! stale heap entry is skipped when it surfaces, which keeps removal
//! O(log n) amortized instead of a scan and re-heapify.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::domain::models::PriorityLevel;

/// Heap entry.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Primary key, highest first.
    pub priority: PriorityLevel,
    /// Tie break, oldest first.
    pub created_at: DateTime<Utc>,
    /// Final tie break in push order.
    pub seq: u64,
    /// Queued task.
    pub task_id: String,
}

impl QueueEntry {
    fn key(&self) -> (PriorityLevel, DateTime<Utc>, u64) {
        (self.priority, self.created_at, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; the smallest key must come out first
        other.key().cmp(&self.key())
    }
}

/// Priority queue keyed by task id.
///
/// # Examples
///
/// ```
/// use autolab::domain::models::PriorityLevel;
/// use autolab::services::task_queue::TaskQueue;
/// use chrono::Utc;
///
/// let mut queue = TaskQueue::new();
/// let now = Utc::now();
/// queue.push("low", PriorityLevel::Low, now);
/// queue.push("critical", PriorityLevel::Critical, now);
/// queue.remove("low");
///
/// assert_eq!(queue.pop().map(|e| e.task_id), Some("critical".to_string()));
/// assert!(queue.pop().is_none());
/// ```
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueEntry>,
    /// task id -> sequence number of its live entry
    live: HashMap<String, u64>,
    next_seq: u64,
}

impl TaskQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task. Returns false if it is already queued.
    pub fn push(&mut self, task_id: impl Into<String>, priority: PriorityLevel, created_at: DateTime<Utc>) -> bool {
        let task_id = task_id.into();
        if self.live.contains_key(&task_id) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(task_id.clone(), seq);
        self.heap.push(QueueEntry {
            priority,
            created_at,
            seq,
            task_id,
        });
        self.maybe_compact();
        true
    }

    /// Remove and return the highest-priority live entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        while let Some(entry) = self.heap.pop() {
            if self.is_live(&entry) {
                self.live.remove(&entry.task_id);
                return Some(entry);
            }
        }
        None
    }

    /// Highest-priority live entry without removing it.
    pub fn peek(&mut self) -> Option<&QueueEntry> {
        while let Some(top) = self.heap.peek() {
            if self.live.get(&top.task_id) == Some(&top.seq) {
                break;
            }
            self.heap.pop();
        }
        self.heap.peek()
    }

    /// Tombstone a queued task. Returns false if it was not queued.
    pub fn remove(&mut self, task_id: &str) -> bool {
        let removed = self.live.remove(task_id).is_some();
        if removed {
            self.maybe_compact();
        }
        removed
    }

    /// Whether the task is queued.
    pub fn contains(&self, task_id: &str) -> bool {
        self.live.contains_key(task_id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// No live entries.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of stale entries still physically in the heap.
    pub fn stale_entries(&self) -> usize {
        self.heap.len() - self.live.len()
    }

    fn is_live(&self, entry: &QueueEntry) -> bool {
        self.live.get(&entry.task_id) == Some(&entry.seq)
    }

    fn maybe_compact(&mut self) {
        if self.stale_entries() > 64 && self.stale_entries() > self.live.len() {
            let live = &self.live;
            self.heap.retain(|e| live.get(&e.task_id) == Some(&e.seq));
        }
    }
}
