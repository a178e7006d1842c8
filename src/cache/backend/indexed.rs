//! Indexed asynchronous record store.
//!
//! Three object sets live in one database:
//!
//! - `assets`: cache entries keyed by `key`, indexed on `timestamp`,
//!   `priority` and `size`
//! - `metadata`: free-form JSON keyed by `key`
//! - `analytics`: auto-incrementing records indexed on `timestamp` and `type`
//!
//! Writes go through [`IndexedStore::transaction`], which applies operations
//! in place and rolls them back from an undo log if the closure fails.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{BackendKind, Capabilities, StorageBackend, Usage};
use crate::cache::config::BackendBudget;
use crate::cache::entry::{CacheEntry, EntryMeta, Priority};
use crate::cache::error::BackendError;

const KIND: BackendKind = BackendKind::LargeAsync;
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// A row of the `analytics` object set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsRecord {
    pub id: u64,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub record_type: String,
    pub payload: serde_json::Value,
}

#[derive(Default)]
struct Database {
    assets: HashMap<String, CacheEntry>,
    by_timestamp: BTreeSet<(i64, String)>,
    by_priority: BTreeSet<(Priority, String)>,
    by_size: BTreeSet<(u64, String)>,
    used: u64,
    metadata: HashMap<String, serde_json::Value>,
    analytics: BTreeMap<u64, AnalyticsRecord>,
    analytics_by_type: BTreeMap<String, BTreeSet<u64>>,
    analytics_by_timestamp: BTreeSet<(i64, u64)>,
    next_analytics_id: u64,
}

impl Database {
    fn insert_asset(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let previous = self.remove_asset(&entry.key);
        self.by_timestamp
            .insert((entry.stored_at, entry.key.clone()));
        self.by_priority.insert((entry.priority, entry.key.clone()));
        self.by_size.insert((entry.size_bytes, entry.key.clone()));
        self.used += entry.footprint();
        self.assets.insert(entry.key.clone(), entry);
        previous
    }

    fn remove_asset(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.assets.remove(key)?;
        self.by_timestamp
            .remove(&(entry.stored_at, entry.key.clone()));
        self.by_priority.remove(&(entry.priority, entry.key.clone()));
        self.by_size.remove(&(entry.size_bytes, entry.key.clone()));
        self.used = self.used.saturating_sub(entry.footprint());
        Some(entry)
    }

    fn insert_analytics(&mut self, record: AnalyticsRecord) {
        self.analytics_by_type
            .entry(record.record_type.clone())
            .or_default()
            .insert(record.id);
        self.analytics_by_timestamp
            .insert((record.timestamp, record.id));
        self.analytics.insert(record.id, record);
    }

    fn remove_analytics(&mut self, id: u64) -> Option<AnalyticsRecord> {
        let record = self.analytics.remove(&id)?;
        if let Some(ids) = self.analytics_by_type.get_mut(&record.record_type) {
            ids.remove(&id);
            if ids.is_empty() {
                self.analytics_by_type.remove(&record.record_type);
            }
        }
        self.analytics_by_timestamp
            .remove(&(record.timestamp, record.id));
        Some(record)
    }
}

enum Undo {
    RestoreAsset(String, Option<CacheEntry>),
    RestoreMetadata(String, Option<serde_json::Value>),
    RemoveAnalytics(u64),
    RestoreAnalytics(AnalyticsRecord),
}

/// Mutable view over the database for the duration of one transaction.
pub struct Transaction<'a> {
    db: &'a mut Database,
    quota: u64,
    undo: Vec<Undo>,
}

impl Transaction<'_> {
    pub fn get_asset(&self, key: &str) -> Option<&CacheEntry> {
        self.db.assets.get(key)
    }

    /// Insert or replace an asset. Fails if the result would exceed the quota.
    pub fn put_asset(&mut self, entry: CacheEntry) -> Result<(), BackendError> {
        let replaced = self
            .db
            .assets
            .get(&entry.key)
            .map(CacheEntry::footprint)
            .unwrap_or(0);
        let used = self.db.used.saturating_sub(replaced);
        let needed = entry.footprint();
        if used + needed > self.quota {
            return Err(BackendError::QuotaExceeded {
                backend: KIND,
                needed,
                available: self.quota.saturating_sub(used),
            });
        }
        let key = entry.key.clone();
        let previous = self.db.insert_asset(entry);
        self.undo.push(Undo::RestoreAsset(key, previous));
        Ok(())
    }

    pub fn delete_asset(&mut self, key: &str) -> bool {
        match self.db.remove_asset(key) {
            Some(previous) => {
                self.undo
                    .push(Undo::RestoreAsset(key.to_string(), Some(previous)));
                true
            }
            None => false,
        }
    }

    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.db.metadata.get(key)
    }

    pub fn put_metadata(&mut self, key: &str, value: serde_json::Value) {
        let previous = self.db.metadata.insert(key.to_string(), value);
        self.undo
            .push(Undo::RestoreMetadata(key.to_string(), previous));
    }

    pub fn delete_metadata(&mut self, key: &str) -> bool {
        match self.db.metadata.remove(key) {
            Some(previous) => {
                self.undo
                    .push(Undo::RestoreMetadata(key.to_string(), Some(previous)));
                true
            }
            None => false,
        }
    }

    /// Append an analytics record and return its id.
    pub fn add_analytics(
        &mut self,
        record_type: &str,
        timestamp: i64,
        payload: serde_json::Value,
    ) -> u64 {
        self.db.next_analytics_id += 1;
        let id = self.db.next_analytics_id;
        self.db.insert_analytics(AnalyticsRecord {
            id,
            timestamp,
            record_type: record_type.to_string(),
            payload,
        });
        self.undo.push(Undo::RemoveAnalytics(id));
        id
    }

    pub fn delete_analytics(&mut self, id: u64) -> bool {
        match self.db.remove_analytics(id) {
            Some(record) => {
                self.undo.push(Undo::RestoreAnalytics(record));
                true
            }
            None => false,
        }
    }

    fn rollback(self) {
        let Transaction { db, undo, .. } = self;
        for step in undo.into_iter().rev() {
            match step {
                Undo::RestoreAsset(key, previous) => {
                    db.remove_asset(&key);
                    if let Some(entry) = previous {
                        db.insert_asset(entry);
                    }
                }
                Undo::RestoreMetadata(key, previous) => match previous {
                    Some(value) => {
                        db.metadata.insert(key, value);
                    }
                    None => {
                        db.metadata.remove(&key);
                    }
                },
                Undo::RemoveAnalytics(id) => {
                    db.remove_analytics(id);
                }
                Undo::RestoreAnalytics(record) => db.insert_analytics(record),
            }
        }
    }
}

/// Asynchronous, persistent, indexed store for large values.
pub struct IndexedStore {
    budget: BackendBudget,
    db: RwLock<Database>,
}

impl IndexedStore {
    pub fn new(budget: BackendBudget) -> Self {
        Self {
            budget,
            db: RwLock::new(Database::default()),
        }
    }

    /// Run `f` atomically. Any error rolls back every operation it applied.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, BackendError>,
    {
        let mut guard = timeout(TRANSACTION_TIMEOUT, self.db.write())
            .await
            .map_err(|_| BackendError::Timeout {
                backend: KIND,
                op: "transaction",
            })?;
        let mut tx = Transaction {
            db: &mut guard,
            quota: self.budget.quota_bytes,
            undo: Vec::new(),
        };
        match f(&mut tx) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(backend = %KIND, error = %err, "transaction rolled back");
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Asset keys stored within `[from, to]` (Unix ms), oldest first.
    pub async fn keys_by_timestamp(&self, from: i64, to: i64) -> Vec<String> {
        let db = self.db.read().await;
        db.by_timestamp
            .range((from, String::new())..)
            .take_while(|(ts, _)| *ts <= to)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Asset keys with exactly this priority.
    pub async fn keys_by_priority(&self, priority: Priority) -> Vec<String> {
        let db = self.db.read().await;
        db.by_priority
            .iter()
            .filter(|(p, _)| *p == priority)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// The `limit` largest assets, largest first.
    pub async fn largest(&self, limit: usize) -> Vec<(String, u64)> {
        let db = self.db.read().await;
        db.by_size
            .iter()
            .rev()
            .take(limit)
            .map(|(size, key)| (key.clone(), *size))
            .collect()
    }

    pub async fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.db.read().await.metadata.get(key).cloned()
    }

    pub async fn put_metadata(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.transaction(|tx| {
            tx.put_metadata(key, value);
            Ok(())
        })
        .await
    }

    pub async fn record_analytics(
        &self,
        record_type: &str,
        timestamp: i64,
        payload: serde_json::Value,
    ) -> Result<u64, BackendError> {
        self.transaction(|tx| Ok(tx.add_analytics(record_type, timestamp, payload)))
            .await
    }

    pub async fn analytics_by_type(&self, record_type: &str) -> Vec<AnalyticsRecord> {
        let db = self.db.read().await;
        db.analytics_by_type
            .get(record_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| db.analytics.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop analytics records older than `before` (Unix ms). Returns the count.
    pub async fn prune_analytics(&self, before: i64) -> Result<usize, BackendError> {
        let stale: Vec<u64> = {
            let db = self.db.read().await;
            db.analytics_by_timestamp
                .iter()
                .take_while(|(ts, _)| *ts < before)
                .map(|(_, id)| *id)
                .collect()
        };
        if stale.is_empty() {
            return Ok(0);
        }
        let removed = self
            .transaction(|tx| Ok(stale.iter().filter(|id| tx.delete_analytics(**id)).count()))
            .await?;
        debug!(backend = %KIND, removed, "analytics pruned");
        Ok(removed)
    }
}

#[async_trait]
impl StorageBackend for IndexedStore {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_bytes_hint: self.budget.quota_bytes,
            is_async: true,
            persistent: true,
            supports_indices: true,
        }
    }

    fn warning_threshold(&self) -> u64 {
        self.budget.warning_threshold()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        Ok(self.db.read().await.assets.get(key).cloned())
    }

    async fn put(&self, key: &str, mut entry: CacheEntry) -> Result<(), BackendError> {
        entry.key = key.to_string();
        self.transaction(|tx| tx.put_asset(entry)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.transaction(|tx| Ok(tx.delete_asset(key))).await
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.db.read().await.assets.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        let mut guard = timeout(TRANSACTION_TIMEOUT, self.db.write())
            .await
            .map_err(|_| BackendError::Timeout {
                backend: KIND,
                op: "clear",
            })?;
        let db = &mut *guard;
        db.assets.clear();
        db.by_timestamp.clear();
        db.by_priority.clear();
        db.by_size.clear();
        db.used = 0;
        db.metadata.clear();
        Ok(())
    }

    async fn estimate_usage(&self) -> Result<Usage, BackendError> {
        Ok(Usage {
            used: self.db.read().await.used,
            quota: self.budget.quota_bytes,
        })
    }

    async fn entries(&self) -> Result<Vec<EntryMeta>, BackendError> {
        Ok(self
            .db
            .read()
            .await
            .assets
            .values()
            .map(CacheEntry::meta)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::cache::entry::ValueKind;

    fn entry(key: &str, stored_at: i64, priority: Priority, size: usize) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            payload: Bytes::from(vec![b'x'; size]),
            kind: ValueKind::Binary,
            stored_at,
            ttl_ms: None,
            priority,
            size_bytes: size as u64,
            integrity: None,
            compressed: false,
        }
    }

    #[tokio::test]
    async fn indices_follow_puts_and_deletes() {
        let store = IndexedStore::new(BackendBudget::new(1 << 20));
        store
            .put("a", entry("a", 10, Priority::Low, 100))
            .await
            .expect("put");
        store
            .put("b", entry("b", 20, Priority::High, 300))
            .await
            .expect("put");
        store
            .put("c", entry("c", 30, Priority::Low, 200))
            .await
            .expect("put");

        assert_eq!(store.keys_by_timestamp(15, 30).await, vec!["b", "c"]);
        let mut low = store.keys_by_priority(Priority::Low).await;
        low.sort();
        assert_eq!(low, vec!["a", "c"]);
        assert_eq!(store.largest(1).await, vec![("b".to_string(), 300)]);

        assert!(store.delete("b").await.expect("delete"));
        assert!(store.keys_by_priority(Priority::High).await.is_empty());
        assert_eq!(store.largest(1).await, vec![("c".to_string(), 200)]);
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let store = IndexedStore::new(BackendBudget::new(1 << 20));
        store
            .put("keep", entry("keep", 1, Priority::Medium, 10))
            .await
            .expect("put");

        let result: Result<(), BackendError> = store
            .transaction(|tx| {
                tx.delete_asset("keep");
                tx.put_metadata("schema", json!({"version": 2}));
                tx.add_analytics("hit", 5, json!({}));
                Err(BackendError::other(KIND, "abort"))
            })
            .await;
        assert!(result.is_err());

        assert!(store.get("keep").await.expect("get").is_some());
        assert!(store.metadata("schema").await.is_none());
        assert!(store.analytics_by_type("hit").await.is_empty());
        assert_eq!(store.keys_by_priority(Priority::Medium).await, vec!["keep"]);
    }

    #[tokio::test]
    async fn quota_is_enforced_on_put() {
        let store = IndexedStore::new(BackendBudget::new(64));
        let err = store
            .put("big", entry("big", 1, Priority::Low, 100))
            .await
            .expect_err("quota");
        assert!(err.is_quota_exceeded());
        assert_eq!(store.estimate_usage().await.expect("usage").used, 0);
    }

    #[tokio::test]
    async fn analytics_ids_autoincrement_and_prune() {
        let store = IndexedStore::new(BackendBudget::new(1 << 20));
        let first = store
            .record_analytics("snapshot", 100, json!({"hits": 1}))
            .await
            .expect("record");
        let second = store
            .record_analytics("snapshot", 200, json!({"hits": 2}))
            .await
            .expect("record");
        assert!(second > first);

        assert_eq!(store.prune_analytics(150).await.expect("prune"), 1);
        let left = store.analytics_by_type("snapshot").await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, second);
    }

    #[tokio::test]
    async fn clear_leaves_no_keys() {
        let store = IndexedStore::new(BackendBudget::new(1 << 20));
        store
            .put("a", entry("a", 1, Priority::Low, 10))
            .await
            .expect("put");
        store.clear().await.expect("clear");
        assert!(store.keys().await.expect("keys").is_empty());
        assert_eq!(store.estimate_usage().await.expect("usage").used, 0);
    }
}
