//! Unified cache manager.
//!
//! `store` picks an adapter (by declared priority and serialized size unless
//! the caller names one), optionally compresses and integrity-tags the value,
//! and owns quota recovery: on quota-exceeded it evicts lowest-priority,
//! oldest entries from that adapter until half its warning threshold is
//! reclaimed, then retries the write exactly once.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task;
use tracing::{debug, error, info, instrument, warn};

use super::backend::{BackendKind, Bucket, Capabilities, StorageBackend};
use super::compression;
use super::config::CacheConfig;
use super::entry::{CacheEntry, CacheValue, Priority, eviction_order, now_ms};
use super::error::{BackendError, CacheError};
use super::integrity::{self, Verification};
use super::keys::KeyPattern;
use super::lock;
use super::pubsub::{self, PubSub};
use super::stats::{Counters, StatEvent, TelemetryCollector};

const SOURCE: &str = "cache::manager";

/// Values above this many bytes prefer the large asynchronous store.
pub const LARGE_VALUE_BYTES: u64 = 50 * 1024;
/// Values below this many bytes prefer the small synchronous store.
pub const SMALL_VALUE_BYTES: u64 = 5 * 1024;

/// Where a value should live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageTarget {
    /// Let the selection algorithm decide.
    #[default]
    Auto,
    Backend(BackendKind),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    pub storage: StorageTarget,
    pub priority: Priority,
    pub ttl_ms: Option<u64>,
    pub compress: bool,
    pub require_integrity: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrieveOptions {
    pub storage: StorageTarget,
    pub verify_integrity: bool,
}

/// What `purge` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeScope {
    All,
    Backend(BackendKind),
    /// Responses under one bucket of the response store.
    Bucket(Bucket),
    Expired,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStats {
    pub kind: BackendKind,
    pub used: u64,
    pub quota: u64,
    pub usage_ratio: f64,
    pub warning_threshold: u64,
    pub entries: usize,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStats {
    pub backends: Vec<BackendStats>,
    pub total_used: u64,
    pub max_cache_size: u64,
    pub tracked_keys: usize,
    pub telemetry: Counters,
}

pub struct CacheManager {
    config: CacheConfig,
    backends: BTreeMap<BackendKind, Arc<dyn StorageBackend>>,
    locations: DashMap<String, BackendKind>,
    key_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    integrity_failure: RwLock<Option<String>>,
    telemetry: Arc<TelemetryCollector>,
    pubsub: Arc<PubSub>,
}

impl CacheManager {
    /// A manager with no adapters; register them with [`Self::with_backend`].
    pub fn new(
        config: CacheConfig,
        telemetry: Arc<TelemetryCollector>,
        pubsub: Arc<PubSub>,
    ) -> Self {
        Self {
            config,
            backends: BTreeMap::new(),
            locations: DashMap::new(),
            key_locks: DashMap::new(),
            integrity_failure: RwLock::new(None),
            telemetry,
            pubsub,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.insert(backend.kind(), backend);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    pub fn backend(&self, kind: BackendKind) -> Option<&Arc<dyn StorageBackend>> {
        self.backends.get(&kind)
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Backend the key was last written to or read from, if known.
    pub fn location(&self, key: &str) -> Option<BackendKind> {
        self.locations.get(key).map(|kind| *kind)
    }

    /// Record that integrity tagging cannot work; later stores that require
    /// integrity fail with `INTEGRITY_INIT_FAILED`.
    pub fn mark_integrity_unavailable(&self, reason: impl Into<String>) {
        *lock::write(&self.integrity_failure, SOURCE, "mark_integrity_unavailable") =
            Some(reason.into());
    }

    fn usable(&self, kind: BackendKind, size: u64) -> bool {
        self.backends
            .get(&kind)
            .is_some_and(|backend| backend.capabilities().max_bytes_hint >= size)
    }

    /// Storage selection for `StorageTarget::Auto`.
    pub fn select_backend(&self, priority: Priority, size: u64) -> Result<BackendKind, CacheError> {
        let (primary, fallback) = if priority == Priority::Critical {
            (BackendKind::LargeAsync, BackendKind::SmallSync)
        } else if size > LARGE_VALUE_BYTES {
            (BackendKind::LargeAsync, BackendKind::ResponseStore)
        } else if size < SMALL_VALUE_BYTES {
            (BackendKind::SmallSync, BackendKind::SmallSession)
        } else {
            (BackendKind::SmallSession, BackendKind::LargeAsync)
        };
        [primary, fallback]
            .into_iter()
            .find(|kind| self.usable(*kind, size))
            .ok_or(CacheError::UnsupportedBackend(primary))
    }

    async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let key_lock = Arc::clone(self.key_locks.entry(key.to_string()).or_default().value());
        key_lock.lock_owned().await
    }

    fn forget_location(&self, key: &str, kind: BackendKind) {
        self.locations.remove_if(key, |_, located| *located == kind);
    }

    /// Write `value` under `key`. Returns the adapter that received it.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn store(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        options: StoreOptions,
    ) -> Result<BackendKind, CacheError> {
        let _guard = self.lock_key(key).await;
        let value = value.into();
        let bytes = value.to_bytes()?;
        let size = bytes.len() as u64;

        let kind = match options.storage {
            StorageTarget::Auto => self.select_backend(options.priority, size)?,
            StorageTarget::Backend(kind) if self.is_available(kind) => kind,
            StorageTarget::Backend(kind) => return Err(CacheError::UnsupportedBackend(kind)),
        };
        let backend = Arc::clone(
            self.backends
                .get(&kind)
                .ok_or(CacheError::UnsupportedBackend(kind))?,
        );

        let integrity = if options.require_integrity && self.config.enable_sri {
            Some(self.integrity_tag(&bytes).await?)
        } else {
            None
        };
        let (payload, compressed) = self.maybe_compress(key, bytes, options.compress).await;

        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            kind: value.kind(),
            stored_at: now_ms(),
            ttl_ms: options.ttl_ms,
            priority: options.priority,
            size_bytes: size,
            integrity,
            compressed,
        };

        self.put_with_recovery(&backend, key, entry).await?;

        if let Some(previous) = self.locations.insert(key.to_string(), kind)
            && previous != kind
            && let Some(stale) = self.backends.get(&previous)
            && let Err(err) = stale.delete(key).await
        {
            warn!(backend = %previous, error = %err, "stale copy not removed after move");
        }

        self.telemetry.record(StatEvent::Store {
            resource: key,
            bytes: size,
        });
        debug!(backend = %kind, bytes = size, compressed, "stored");
        Ok(kind)
    }

    async fn integrity_tag(&self, bytes: &Bytes) -> Result<String, CacheError> {
        let failure = lock::read(&self.integrity_failure, SOURCE, "integrity_tag").clone();
        if let Some(reason) = failure {
            return Err(CacheError::IntegrityInitFailed(reason));
        }
        let algorithm = self.config.integrity_algorithm;
        if bytes.len() < self.config.compression_threshold_bytes {
            return Ok(algorithm.sri(bytes));
        }
        let owned = bytes.clone();
        task::spawn_blocking(move || algorithm.sri(&owned))
            .await
            .map_err(|err| CacheError::IntegrityInitFailed(err.to_string()))
    }

    async fn maybe_compress(&self, key: &str, bytes: Bytes, requested: bool) -> (Bytes, bool) {
        if !requested || !self.config.enable_compression {
            return (bytes, false);
        }
        let result = if bytes.len() >= self.config.compression_threshold_bytes {
            compression::compress_in_worker(bytes.clone()).await
        } else {
            compression::compress(&bytes).map(|packed| (packed.len() < bytes.len()).then_some(packed))
        };
        match result {
            Ok(Some(packed)) => (packed, true),
            Ok(None) => (bytes, false),
            Err(err) => {
                warn!(key, error = %err, "compression failed; storing uncompressed");
                self.telemetry.record(StatEvent::Error {
                    resource: key,
                    code: "COMPRESSION_FAILED",
                });
                (bytes, false)
            }
        }
    }

    async fn put_with_recovery(
        &self,
        backend: &Arc<dyn StorageBackend>,
        key: &str,
        entry: CacheEntry,
    ) -> Result<(), CacheError> {
        let kind = backend.kind();
        match backend.put(key, entry.clone()).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_quota_exceeded() => {
                let target = backend.warning_threshold() / 2;
                let reclaimed = self.evict(backend, target).await;
                warn!(backend = %kind, reclaimed, target, "quota exceeded; retrying once after eviction");
                backend.put(key, entry).await.map_err(|retry_err| {
                    error!(backend = %kind, error = %retry_err, "write failed after quota recovery");
                    self.telemetry.record(StatEvent::Error {
                        resource: key,
                        code: "QUOTA_EXCEEDED",
                    });
                    CacheError::from(retry_err)
                })
            }
            Err(err) => {
                self.telemetry.record(StatEvent::Error {
                    resource: key,
                    code: "BACKEND_FAILED",
                });
                Err(CacheError::from(err))
            }
        }
    }

    /// Evict from `backend` until at least `target` bytes are reclaimed.
    /// Expired entries go first, then lowest priority, then oldest.
    async fn evict(&self, backend: &Arc<dyn StorageBackend>, target: u64) -> u64 {
        let kind = backend.kind();
        if target == 0 {
            return 0;
        }
        let mut entries = match backend.entries().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(backend = %kind, error = %err, "cannot enumerate entries for eviction");
                return 0;
            }
        };
        let now = now_ms();
        eviction_order(&mut entries);
        entries.sort_by_key(|meta| !meta.is_expired_at(now));

        let mut reclaimed = 0_u64;
        for meta in entries {
            if reclaimed >= target {
                break;
            }
            match backend.delete(&meta.key).await {
                Ok(true) => {
                    reclaimed += meta.footprint;
                    self.forget_location(&meta.key, kind);
                    self.telemetry.record(StatEvent::Eviction {
                        resource: &meta.key,
                        bytes: meta.footprint,
                    });
                    self.pubsub.publish(
                        pubsub::QUOTA_EVICTION,
                        &json!({
                            "key": meta.key,
                            "backend": kind.as_str(),
                            "bytes": meta.footprint,
                            "priority": meta.priority.as_str(),
                        }),
                    );
                    debug!(backend = %kind, key = %meta.key, priority = %meta.priority, "evicted");
                }
                Ok(false) => {}
                Err(err) => warn!(backend = %kind, key = %meta.key, error = %err, "eviction delete failed"),
            }
        }
        reclaimed
    }

    fn candidates(&self, key: &str, storage: StorageTarget) -> Result<Vec<BackendKind>, CacheError> {
        match storage {
            StorageTarget::Backend(kind) if self.is_available(kind) => Ok(vec![kind]),
            StorageTarget::Backend(kind) => Err(CacheError::UnsupportedBackend(kind)),
            StorageTarget::Auto => {
                let known = self.location(key);
                let mut order: Vec<BackendKind> = known.into_iter().collect();
                order.extend(self.backends.keys().copied().filter(|kind| Some(*kind) != known));
                Ok(order)
            }
        }
    }

    /// Read `key`. `None` on miss or expiry.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn retrieve(
        &self,
        key: &str,
        options: RetrieveOptions,
    ) -> Result<Option<CacheValue>, CacheError> {
        let started = Instant::now();
        let candidates = self.candidates(key, options.storage)?;
        let _guard = self.lock_key(key).await;

        for kind in candidates {
            let Some(backend) = self.backends.get(&kind) else {
                continue;
            };
            let entry = match backend.get(key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(err) => {
                    warn!(backend = %kind, error = %err, "read failed; treating as miss");
                    self.telemetry.record(StatEvent::Error {
                        resource: key,
                        code: "BACKEND_FAILED",
                    });
                    if matches!(err, BackendError::Corrupt { .. }) {
                        if let Err(err) = backend.delete(key).await {
                            warn!(backend = %kind, error = %err, "corrupt entry not deleted");
                        }
                        self.forget_location(key, kind);
                    }
                    continue;
                }
            };

            if entry.is_expired() {
                if let Err(err) = backend.delete(key).await {
                    warn!(backend = %kind, error = %err, "expired entry not deleted");
                }
                self.forget_location(key, kind);
                debug!(backend = %kind, "expired on read");
                break;
            }

            self.locations.insert(key.to_string(), kind);
            let size = entry.size_bytes;
            if let Some(value) = self.materialize(backend, entry, options).await? {
                self.telemetry.record(StatEvent::Hit {
                    resource: key,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                    bytes: size,
                });
                debug!(backend = %kind, outcome = "hit", "retrieved");
                return Ok(Some(value));
            }
            break;
        }

        self.telemetry.record(StatEvent::Miss {
            resource: key,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
        debug!(outcome = "miss", "retrieved");
        Ok(None)
    }

    /// Decompress, verify and decode an entry. Undecodable entries are
    /// deleted and reported as `None`.
    async fn materialize(
        &self,
        backend: &Arc<dyn StorageBackend>,
        entry: CacheEntry,
        options: RetrieveOptions,
    ) -> Result<Option<CacheValue>, CacheError> {
        let kind = backend.kind();
        let key = entry.key.as_str();
        let payload = if entry.compressed {
            let unpacked = if entry.payload.len() >= self.config.compression_threshold_bytes {
                compression::decompress_in_worker(entry.payload.clone()).await
            } else {
                compression::decompress(&entry.payload)
            };
            match unpacked {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(backend = %kind, key, error = %err, "stored payload does not decompress");
                    self.discard(backend, key, "COMPRESSION_FAILED").await;
                    return Ok(None);
                }
            }
        } else {
            entry.payload.clone()
        };

        if options.verify_integrity
            && let Some(recorded) = entry.integrity.as_deref()
            && let Verification::Mismatch { expected, actual } = integrity::verify(recorded, &payload)
        {
            error!(backend = %kind, key, %expected, %actual, "integrity mismatch");
            self.telemetry.record(StatEvent::SriFailure { resource: key });
            if let Err(err) = backend.delete(key).await {
                warn!(backend = %kind, key, error = %err, "tampered entry not deleted");
            }
            self.forget_location(key, kind);
            return Err(CacheError::IntegrityMismatch {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        match CacheValue::from_bytes(entry.kind, payload) {
            Ok(value) => Ok(Some(value)),
            Err(reason) => {
                warn!(backend = %kind, key, %reason, "stored value does not decode");
                self.discard(backend, key, "CORRUPT_ENTRY").await;
                Ok(None)
            }
        }
    }

    async fn discard(&self, backend: &Arc<dyn StorageBackend>, key: &str, code: &'static str) {
        self.telemetry.record(StatEvent::Error {
            resource: key,
            code,
        });
        if let Err(err) = backend.delete(key).await {
            warn!(backend = %backend.kind(), key, code, error = %err, "undecodable entry not deleted");
        }
        self.forget_location(key, backend.kind());
    }

    /// Read `key`, falling back to `fetch` on a miss (and on an integrity
    /// mismatch when `fallback_on_failure` is set). Fetched values are stored.
    pub async fn retrieve_or_fetch<F, Fut>(
        &self,
        key: &str,
        retrieve: RetrieveOptions,
        store: StoreOptions,
        fetch: F,
    ) -> Result<Option<CacheValue>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<CacheValue>>,
    {
        match self.retrieve(key, retrieve).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(CacheError::IntegrityMismatch { .. }) if self.config.fallback_on_failure => {
                info!(key, "integrity mismatch; refetching from origin");
            }
            Err(err) => return Err(err),
        }
        let Some(value) = fetch().await else {
            return Ok(None);
        };
        if let Err(err) = self.store(key, value.clone(), store).await {
            warn!(key, code = err.code(), error = %err, "fetched value not cached");
        }
        Ok(Some(value))
    }

    /// Every `(backend, key)` whose key matches any of `patterns`.
    pub async fn keys_matching(&self, patterns: &[KeyPattern]) -> Vec<(BackendKind, String)> {
        let mut matches = Vec::new();
        for (kind, backend) in &self.backends {
            let keys = match backend.keys().await {
                Ok(keys) => keys,
                Err(err) => {
                    warn!(backend = %kind, error = %err, "key enumeration failed");
                    continue;
                }
            };
            matches.extend(
                keys.into_iter()
                    .filter(|key| patterns.iter().any(|pattern| pattern.matches(key)))
                    .map(|key| (*kind, key)),
            );
        }
        matches
    }

    /// Delete one key from one adapter. No retries; the invalidation bus
    /// layers those on top.
    pub async fn delete(&self, kind: BackendKind, key: &str) -> Result<bool, BackendError> {
        let backend = self
            .backends
            .get(&kind)
            .ok_or_else(|| BackendError::other(kind, "backend not registered"))?;
        let _guard = self.lock_key(key).await;
        let removed = backend.delete(key).await?;
        self.forget_location(key, kind);
        if removed {
            self.telemetry.record(StatEvent::Invalidate { resource: key });
        }
        Ok(removed)
    }

    /// Delete every key matching `pattern` from every adapter.
    pub async fn invalidate(&self, pattern: &KeyPattern) -> usize {
        let mut removed = 0;
        for (kind, key) in self.keys_matching(std::slice::from_ref(pattern)).await {
            match self.delete(kind, &key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!(backend = %kind, key = %key, error = %err, "invalidation delete failed"),
            }
        }
        info!(pattern = %pattern, removed, "invalidated");
        removed
    }

    /// Remove everything in `scope`. Returns how many entries went away.
    pub async fn purge(&self, scope: PurgeScope) -> usize {
        let removed = match scope {
            PurgeScope::All => {
                let mut removed = 0;
                for kind in self.backends.keys().copied().collect::<Vec<_>>() {
                    removed += self.clear_backend(kind).await;
                }
                self.locations.clear();
                removed
            }
            PurgeScope::Backend(kind) => self.clear_backend(kind).await,
            PurgeScope::Bucket(bucket) => {
                let kind = BackendKind::ResponseStore;
                let Some(backend) = self.backends.get(&kind) else {
                    return 0;
                };
                let keys = backend.keys().await.unwrap_or_default();
                let mut removed = 0;
                for key in keys.iter().filter(|key| Bucket::for_url(key) == bucket) {
                    if matches!(backend.delete(key).await, Ok(true)) {
                        self.forget_location(key, kind);
                        removed += 1;
                    }
                }
                removed
            }
            PurgeScope::Expired => self.sweep_expired().await,
        };
        info!(?scope, removed, "purged");
        removed
    }

    async fn clear_backend(&self, kind: BackendKind) -> usize {
        let Some(backend) = self.backends.get(&kind) else {
            return 0;
        };
        let count = backend.keys().await.map(|keys| keys.len()).unwrap_or(0);
        if let Err(err) = backend.clear().await {
            warn!(backend = %kind, error = %err, "clear failed");
            return 0;
        }
        self.locations.retain(|_, located| *located != kind);
        count
    }

    /// Delete every entry whose TTL has lapsed. Returns the count.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let mut removed = 0;
        for (kind, backend) in &self.backends {
            let entries = match backend.entries().await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(backend = %kind, error = %err, "ttl sweep could not enumerate");
                    continue;
                }
            };
            for meta in entries.into_iter().filter(|meta| meta.is_expired_at(now)) {
                if matches!(backend.delete(&meta.key).await, Ok(true)) {
                    self.forget_location(&meta.key, *kind);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "ttl sweep");
        }
        removed
    }

    /// Periodic cleanup: evict from adapters above the cleanup threshold and
    /// from the fullest adapter while the total exceeds `max_cache_size`.
    /// Returns reclaimed bytes.
    pub async fn cleanup(&self) -> u64 {
        let mut reclaimed = 0;
        let mut usages = Vec::with_capacity(self.backends.len());
        for (kind, backend) in &self.backends {
            match backend.estimate_usage().await {
                Ok(usage) => usages.push((*kind, usage)),
                Err(err) => warn!(backend = %kind, error = %err, "usage estimate failed"),
            }
        }

        for (kind, usage) in &usages {
            if usage.ratio() > self.config.cleanup_threshold
                && let Some(backend) = self.backends.get(kind)
            {
                reclaimed += self.evict(backend, backend.warning_threshold() / 2).await;
            }
        }

        let total: u64 = usages.iter().map(|(_, usage)| usage.used).sum();
        let total = total.saturating_sub(reclaimed);
        if total > self.config.max_cache_size
            && let Some((kind, _)) = usages.iter().max_by_key(|(_, usage)| usage.used)
            && let Some(backend) = self.backends.get(kind)
        {
            reclaimed += self.evict(backend, total - self.config.max_cache_size).await;
        }

        self.key_locks.retain(|_, key_lock| Arc::strong_count(key_lock) > 1);
        info!(reclaimed, "cleanup finished");
        reclaimed
    }

    pub async fn stats(&self) -> ManagerStats {
        let mut backends = Vec::with_capacity(self.backends.len());
        for (kind, backend) in &self.backends {
            let usage = backend.estimate_usage().await.unwrap_or_default();
            let entries = backend.keys().await.map(|keys| keys.len()).unwrap_or(0);
            backends.push(BackendStats {
                kind: *kind,
                used: usage.used,
                quota: usage.quota,
                usage_ratio: usage.ratio(),
                warning_threshold: backend.warning_threshold(),
                entries,
                capabilities: backend.capabilities(),
            });
        }
        ManagerStats {
            total_used: backends.iter().map(|stats| stats.used).sum(),
            backends,
            max_cache_size: self.config.max_cache_size,
            tracked_keys: self.locations.len(),
            telemetry: self.telemetry.counters(),
        }
    }
}
