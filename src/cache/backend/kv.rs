//! Small synchronous key/string stores.
//!
//! Values are kept as serialized strings, the way browser key/value storage
//! holds them, so the byte budget accounts for the encoded form.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BackendKind, Capabilities, StorageBackend, Usage};
use crate::cache::config::BackendBudget;
use crate::cache::entry::{CacheEntry, EntryMeta, Priority, ValueKind};
use crate::cache::error::BackendError;
use crate::cache::lock;

const SOURCE: &str = "cache::backend::kv";

/// Lifetime of a [`KvStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvLifetime {
    /// Survives across sessions.
    Persistent,
    /// Cleared when the session ends.
    Session,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    #[serde(rename = "v")]
    value: String,
    #[serde(rename = "k")]
    kind: ValueKind,
    #[serde(rename = "t")]
    stored_at: i64,
    #[serde(rename = "ttl", default, skip_serializing_if = "Option::is_none")]
    ttl_ms: Option<u64>,
    #[serde(rename = "p")]
    priority: Priority,
    #[serde(rename = "n")]
    size_bytes: u64,
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    integrity: Option<String>,
    #[serde(rename = "c", default)]
    compressed: bool,
}

impl WireEntry {
    fn encode(entry: &CacheEntry) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireEntry {
            value: BASE64.encode(&entry.payload),
            kind: entry.kind,
            stored_at: entry.stored_at,
            ttl_ms: entry.ttl_ms,
            priority: entry.priority,
            size_bytes: entry.size_bytes,
            integrity: entry.integrity.clone(),
            compressed: entry.compressed,
        })
    }

    fn decode(key: &str, raw: &str) -> Result<CacheEntry, String> {
        let wire: WireEntry = serde_json::from_str(raw).map_err(|err| err.to_string())?;
        let payload = BASE64
            .decode(wire.value.as_bytes())
            .map_err(|err| err.to_string())?;
        Ok(CacheEntry {
            key: key.to_string(),
            payload: Bytes::from(payload),
            kind: wire.kind,
            stored_at: wire.stored_at,
            ttl_ms: wire.ttl_ms,
            priority: wire.priority,
            size_bytes: wire.size_bytes,
            integrity: wire.integrity,
            compressed: wire.compressed,
        })
    }
}

/// Synchronous key/string store with a hard byte budget.
pub struct KvStore {
    kind: BackendKind,
    lifetime: KvLifetime,
    budget: BackendBudget,
    items: RwLock<HashMap<String, String>>,
}

impl KvStore {
    /// Persistent store (survives sessions, not a device wipe).
    pub fn small_sync(budget: BackendBudget) -> Self {
        Self::new(BackendKind::SmallSync, KvLifetime::Persistent, budget)
    }

    /// Session-scoped store with the same shape and limits.
    pub fn small_session(budget: BackendBudget) -> Self {
        Self::new(BackendKind::SmallSession, KvLifetime::Session, budget)
    }

    fn new(kind: BackendKind, lifetime: KvLifetime, budget: BackendBudget) -> Self {
        Self {
            kind,
            lifetime,
            budget,
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn lifetime(&self) -> KvLifetime {
        self.lifetime
    }

    /// End the current session. Only session-scoped stores drop their data.
    pub fn end_session(&self) {
        if self.lifetime == KvLifetime::Session {
            lock::write(&self.items, SOURCE, "end_session").clear();
            debug!(backend = %self.kind, "session storage cleared");
        }
    }

    /// Raw string stored under `key`, if any.
    pub fn get_raw(&self, key: &str) -> Option<String> {
        lock::read(&self.items, SOURCE, "get_raw").get(key).cloned()
    }

    /// Write a raw string, bypassing entry encoding. Subject to the budget.
    pub fn set_raw(&self, key: &str, raw: String) -> Result<(), BackendError> {
        let mut items = lock::write(&self.items, SOURCE, "set_raw");
        self.check_budget(&items, key, raw.len())?;
        items.insert(key.to_string(), raw);
        Ok(())
    }

    fn used(items: &HashMap<String, String>) -> u64 {
        items
            .iter()
            .map(|(key, value)| (key.len() + value.len()) as u64)
            .sum()
    }

    fn check_budget(
        &self,
        items: &HashMap<String, String>,
        key: &str,
        value_len: usize,
    ) -> Result<(), BackendError> {
        let replaced = items
            .get(key)
            .map(|old| (key.len() + old.len()) as u64)
            .unwrap_or(0);
        let used = Self::used(items).saturating_sub(replaced);
        let needed = (key.len() + value_len) as u64;
        if used + needed > self.budget.quota_bytes {
            return Err(BackendError::QuotaExceeded {
                backend: self.kind,
                needed,
                available: self.budget.quota_bytes.saturating_sub(used),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for KvStore {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_bytes_hint: self.budget.quota_bytes,
            is_async: false,
            persistent: self.lifetime == KvLifetime::Persistent,
            supports_indices: false,
        }
    }

    fn warning_threshold(&self) -> u64 {
        self.budget.warning_threshold()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        let Some(raw) = self.get_raw(key) else {
            return Ok(None);
        };
        WireEntry::decode(key, &raw)
            .map(Some)
            .map_err(|message| BackendError::corrupt(self.kind, message))
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), BackendError> {
        let raw = WireEntry::encode(&entry)
            .map_err(|err| BackendError::other(self.kind, err.to_string()))?;
        self.set_raw(key, raw)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(lock::write(&self.items, SOURCE, "delete")
            .remove(key)
            .is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(lock::read(&self.items, SOURCE, "keys")
            .keys()
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        lock::write(&self.items, SOURCE, "clear").clear();
        Ok(())
    }

    async fn estimate_usage(&self) -> Result<Usage, BackendError> {
        let items = lock::read(&self.items, SOURCE, "estimate_usage");
        Ok(Usage {
            used: Self::used(&items),
            quota: self.budget.quota_bytes,
        })
    }

    async fn entries(&self) -> Result<Vec<EntryMeta>, BackendError> {
        let items = lock::read(&self.items, SOURCE, "entries");
        let mut metas = Vec::with_capacity(items.len());
        for (key, raw) in items.iter() {
            match WireEntry::decode(key, raw) {
                Ok(entry) => metas.push(EntryMeta {
                    footprint: (key.len() + raw.len()) as u64,
                    ..entry.meta()
                }),
                // Foreign or corrupt records are evicted before anything else.
                Err(_) => metas.push(EntryMeta {
                    key: key.clone(),
                    stored_at: 0,
                    ttl_ms: Some(0),
                    priority: Priority::Low,
                    footprint: (key.len() + raw.len()) as u64,
                }),
            }
        }
        Ok(metas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::now_ms;

    fn entry(key: &str, body: &str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            payload: Bytes::copy_from_slice(body.as_bytes()),
            kind: ValueKind::Text,
            stored_at: now_ms(),
            ttl_ms: None,
            priority: Priority::Medium,
            size_bytes: body.len() as u64,
            integrity: None,
            compressed: false,
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip_is_byte_identical() {
        let store = KvStore::small_sync(BackendBudget::new(4096));
        store
            .put("user:1", entry("user:1", "héllo"))
            .await
            .expect("put");
        let back = store.get("user:1").await.expect("get").expect("present");
        assert_eq!(back.payload, Bytes::from("héllo"));
        assert_eq!(back.kind, ValueKind::Text);
    }

    #[tokio::test]
    async fn put_replaces_existing_entry() {
        let store = KvStore::small_sync(BackendBudget::new(4096));
        store.put("k", entry("k", "one")).await.expect("put");
        store.put("k", entry("k", "two")).await.expect("put");
        assert_eq!(store.keys().await.expect("keys").len(), 1);
        let back = store.get("k").await.expect("get").expect("present");
        assert_eq!(back.payload, Bytes::from("two"));
    }

    #[tokio::test]
    async fn over_budget_write_is_quota_exceeded() {
        let store = KvStore::small_sync(BackendBudget::new(64));
        let err = store
            .put("big", entry("big", &"x".repeat(200)))
            .await
            .expect_err("quota");
        assert!(err.is_quota_exceeded());
    }

    #[tokio::test]
    async fn replacing_counts_only_the_difference() {
        let store = KvStore::small_sync(BackendBudget::new(40));
        store.set_raw("k", "a".repeat(30)).expect("first");
        store.set_raw("k", "b".repeat(35)).expect("replace fits");
    }

    #[tokio::test]
    async fn clear_empties_keys() {
        let store = KvStore::small_session(BackendBudget::new(4096));
        store.put("a", entry("a", "1")).await.expect("put");
        store.put("b", entry("b", "2")).await.expect("put");
        store.clear().await.expect("clear");
        assert!(store.keys().await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn only_session_store_drops_data_at_session_end() {
        let persistent = KvStore::small_sync(BackendBudget::new(4096));
        let session = KvStore::small_session(BackendBudget::new(4096));
        persistent.put("a", entry("a", "1")).await.expect("put");
        session.put("a", entry("a", "1")).await.expect("put");

        persistent.end_session();
        session.end_session();

        assert!(persistent.get("a").await.expect("get").is_some());
        assert!(session.get("a").await.expect("get").is_none());
        assert!(!session.capabilities().persistent);
    }

    #[tokio::test]
    async fn corrupt_record_is_reported() {
        let store = KvStore::small_sync(BackendBudget::new(4096));
        store.set_raw("bad", "not json".to_string()).expect("raw");
        let err = store.get("bad").await.expect_err("corrupt");
        assert!(matches!(err, BackendError::Corrupt { .. }));
    }
}
