//! Priority queue of pending units.
//!
//! Ordering key: `(priority_rank desc, enqueued_at asc, seq asc)`. `seq` is a
//! per-process monotonic counter, so ties on rank and timestamp resolve in
//! insertion order and dequeue order is fully deterministic.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::ingestion::model::{Priority, QueueEntry};

/// Heap adapter: the greatest `Ranked` is the next entry to serve.
#[derive(Debug, Clone)]
struct Ranked(QueueEntry);

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority_rank
            .cmp(&other.0.priority_rank)
            .then_with(|| other.0.enqueued_at.cmp(&self.0.enqueued_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
            .then_with(|| other.0.unit_id.cmp(&self.0.unit_id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Queue depth by priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub total: usize,
}

/// Pure ordering structure; no locking, no persistence.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Ranked>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, entry: QueueEntry) {
        self.heap.push(Ranked(entry));
    }

    /// Removes and returns the highest-ranked entry.
    pub fn dequeue_next(&mut self) -> Option<QueueEntry> {
        self.heap.pop().map(|r| r.0)
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.peek().map(|r| &r.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn depth(&self) -> QueueDepth {
        let mut d = QueueDepth::default();
        for Ranked(e) in self.heap.iter() {
            match e.priority_rank {
                r if r >= Priority::High.rank() => d.high += 1,
                r if r == Priority::Medium.rank() => d.medium += 1,
                _ => d.low += 1,
            }
        }
        d.total = self.heap.len();
        d
    }
}

/// Process-wide queue shared by intake and the scheduler.
///
/// Enqueue and dequeue are serialized by one mutex, so no entry is handed
/// out twice. Enqueue also raises the wake signal; `Notify` keeps a permit
/// when nobody is waiting, so a wake sent while the scheduler is busy is
/// observed on its next idle wait.
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<PriorityQueue>,
    wake: Notify,
    next_seq: AtomicU64,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next enqueue sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::SeqCst)
    }

    pub fn enqueue_all(&self, entries: impl IntoIterator<Item = QueueEntry>) {
        let mut added = 0usize;
        {
            let mut q = self.inner.lock();
            for e in entries {
                q.enqueue(e);
                added += 1;
            }
        }
        if added > 0 {
            self.wake.notify_one();
        }
    }

    pub fn dequeue_next(&self) -> Option<QueueEntry> {
        self.inner.lock().dequeue_next()
    }

    /// Reloads persisted entries and moves the sequence counter past them.
    pub fn restore(&self, entries: Vec<QueueEntry>) {
        if let Some(max_seq) = entries.iter().map(|e| e.seq).max() {
            self.next_seq
                .fetch_max(max_seq.saturating_add(1), AtomicOrdering::SeqCst);
        }
        self.enqueue_all(entries);
    }

    /// Resolves once work has been enqueued since the last wake was consumed.
    pub async fn wait_for_work(&self) {
        self.wake.notified().await;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn depth(&self) -> QueueDepth {
        self.inner.lock().depth()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]
        #[test]
        fn test_dequeue_order_invariants(
            // (rank, millisecond offset) pairs in arbitrary arrival order
            items in prop::collection::vec((1u8..=3, 0i64..50), 1..100)
        ) {
            let t0 = Utc::now();
            let mut q = PriorityQueue::new();
            for (seq, (rank, offset)) in items.iter().enumerate() {
                q.enqueue(QueueEntry {
                    unit_id: Uuid::new_v4(),
                    request_id: Uuid::new_v4(),
                    priority_rank: *rank,
                    enqueued_at: t0 + Duration::milliseconds(*offset),
                    seq: seq as u64,
                });
            }

            let drained: Vec<QueueEntry> = std::iter::from_fn(|| q.dequeue_next()).collect();
            prop_assert_eq!(drained.len(), items.len());

            for pair in drained.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                // --- INVARIANT 1: non-increasing rank ---
                prop_assert!(a.priority_rank >= b.priority_rank);
                // --- INVARIANT 2: FIFO within equal rank ---
                if a.priority_rank == b.priority_rank {
                    prop_assert!((a.enqueued_at, a.seq) < (b.enqueued_at, b.seq));
                }
            }
        }
    }
}
