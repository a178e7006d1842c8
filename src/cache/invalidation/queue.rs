//! Bounded invalidation queue.
//!
//! Producers only push; the bus is the single consumer. When full, the
//! oldest item is discarded to make room.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::cache::backend::BackendKind;
use crate::cache::entry::now_ms;
use crate::cache::lock;

const SOURCE: &str = "cache::invalidation::queue";

const METRIC_QUEUE_LEN: &str = "kessel_invalidation_queue_len";
const METRIC_DROPPED_TOTAL: &str = "kessel_invalidation_dropped_total";

pub type Epoch = u64;

/// Lifecycle of a queued deletion.
///
/// `Queued → Processing → Done | Failed`, with `Processing → Retrying →
/// Processing` while attempts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Queued,
    Processing,
    Retrying,
    Done,
    Failed,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedItem {
    pub id: Uuid,
    pub epoch: Epoch,
    pub key: String,
    pub backend: BackendKind,
    /// Event name or `dependency` / `pattern` for derived work.
    pub cause: String,
    pub attempts: u32,
    pub state: ItemState,
    pub enqueued_at_ms: i64,
}

pub struct InvalidationQueue {
    items: Mutex<VecDeque<QueuedItem>>,
    limit: usize,
    epoch_counter: AtomicU64,
    dropped: AtomicU64,
}

impl InvalidationQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
            epoch_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a deletion unless the same `(backend, key)` is already waiting.
    /// Returns the epoch of the new item.
    pub fn push(&self, backend: BackendKind, key: &str, cause: &str) -> Option<Epoch> {
        let mut items = lock::lock(&self.items, SOURCE, "push");
        if items
            .iter()
            .any(|item| item.backend == backend && item.key == key)
        {
            return None;
        }
        if items.len() >= self.limit
            && let Some(dropped) = items.pop_front()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_DROPPED_TOTAL).increment(1);
            warn!(key = %dropped.key, cause = %dropped.cause, "invalidation queue full; dropped oldest");
        }
        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst);
        items.push_back(QueuedItem {
            id: Uuid::new_v4(),
            epoch,
            key: key.to_string(),
            backend,
            cause: cause.to_string(),
            attempts: 0,
            state: ItemState::Queued,
            enqueued_at_ms: now_ms(),
        });
        gauge!(METRIC_QUEUE_LEN).set(items.len() as f64);
        Some(epoch)
    }

    /// Take up to `limit` items in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<QueuedItem> {
        let mut items = lock::lock(&self.items, SOURCE, "drain");
        let count = limit.min(items.len());
        let batch = items.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(items.len() as f64);
        batch
    }

    pub fn len(&self) -> usize {
        lock::lock(&self.items, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_keys(&self) -> HashSet<String> {
        lock::lock(&self.items, SOURCE, "pending_keys")
            .iter()
            .map(|item| item.key.clone())
            .collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_with_epochs_and_dedup() {
        let queue = InvalidationQueue::new(10);
        let first = queue.push(BackendKind::SmallSync, "a", "TEST").expect("queued");
        let second = queue.push(BackendKind::SmallSync, "b", "TEST").expect("queued");
        assert!(first < second);
        assert!(queue.push(BackendKind::SmallSync, "a", "TEST").is_none());
        assert!(queue.push(BackendKind::LargeAsync, "a", "TEST").is_some());

        let batch = queue.drain(2);
        assert_eq!(
            batch.iter().map(|item| item.key.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(batch.iter().all(|item| item.state == ItemState::Queued));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn full_queue_discards_oldest() {
        let queue = InvalidationQueue::new(2);
        for key in ["a", "b", "c"] {
            queue.push(BackendKind::SmallSync, key, "TEST");
        }
        assert_eq!(queue.dropped(), 1);
        let keys: Vec<_> = queue.drain(10).into_iter().map(|item| item.key).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }
}
