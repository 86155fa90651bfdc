use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Priority given to runs found by the periodic scan.
pub const DISCOVERY_PRIORITY: i32 = 10;
/// Priority of the stop sentinel; lower values are dequeued first.
pub const SENTINEL_PRIORITY: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub priority: i32,
    /// `None` is the sentinel that stops the consumer.
    pub run_id: Option<String>,
}

impl QueueItem {
    pub fn is_sentinel(&self) -> bool {
        self.run_id.is_none()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: i32,
    seq: u64,
    run_id: Option<String>,
}

// BinaryHeap is a max-heap: invert so the lowest priority, then the oldest
// entry, comes out first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// Blocking priority queue of pending run ids.
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push_entry(&self, priority: i32, run_id: Option<String>) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry {
            priority,
            seq,
            run_id,
        });
        drop(inner);
        self.ready.notify_one();
    }

    pub fn push(&self, priority: i32, run_id: impl Into<String>) {
        self.push_entry(priority, Some(run_id.into()));
    }

    pub fn push_sentinel(&self) {
        self.push_entry(SENTINEL_PRIORITY, None);
    }

    /// Block until an item is available.
    pub fn pop(&self) -> QueueItem {
        let mut inner = self.lock();
        loop {
            if let Some(entry) = inner.heap.pop() {
                return QueueItem {
                    priority: entry.priority,
                    run_id: entry.run_id,
                };
            }
            inner = match self.ready.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
