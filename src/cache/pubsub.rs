//! In-process publish/subscribe hub.
//!
//! Components announce state changes (a key was invalidated, an entry was
//! evicted for quota) without knowing who listens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::trace;

use super::lock;

const SOURCE: &str = "cache::pubsub";

/// Published by the invalidation bus with `{"key": ..., "backend": ...}`.
pub const KEY_INVALIDATED: &str = "key-invalidated";
/// Published by the manager with `{"key": ..., "backend": ..., "bytes": ...}`.
pub const QUOTA_EVICTION: &str = "quota-eviction";
/// Published by the invalidation bus with `{"version": ...}`.
pub const VERSION_CHANGED: &str = "version-changed";

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Returned by [`PubSub::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct PubSub {
    next_id: AtomicU64,
    topics: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock::write(&self.topics, SOURCE, "subscribe")
            .entry(topic.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut topics = lock::write(&self.topics, SOURCE, "unsubscribe");
        for handlers in topics.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sub, _)| *sub == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver `payload` to every handler of `topic`, in subscription order.
    /// Returns the number of handlers invoked.
    pub fn publish(&self, topic: &str, payload: &Value) -> usize {
        // Handlers run without the lock held so they may publish or subscribe.
        let handlers: Vec<Handler> = lock::read(&self.topics, SOURCE, "publish")
            .get(topic)
            .map(|subs| subs.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(payload);
        }
        trace!(topic, delivered = handlers.len(), "published");
        handlers.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock::read(&self.topics, SOURCE, "subscriber_count")
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
