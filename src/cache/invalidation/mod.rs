//! Invalidation bus.
//!
//! Domain events are mapped to key patterns through the static rule table,
//! matched against every adapter and queued as individual deletions. A single
//! consumer drains the queue in batches, retries transient failures, fans out
//! to dependents and announces each removal on the pub/sub hub.

mod graph;
mod queue;
mod rules;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use metrics::histogram;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time;
use tracing::{debug, info, instrument, warn};

pub use graph::{CycleError, DependencyGraph};
pub use queue::{Epoch, InvalidationQueue, ItemState, QueuedItem};
pub use rules::{
    APP_VERSION_CHANGED, CACHE_RESET, CLAN_MEMBERSHIP_CHANGED, CLAN_UPDATED, EVENT_RULES,
    EventRule, GAME_COMPLETED, PROPOSAL_CREATED, Propagation, TOKEN_TRANSFER, USER_LOGIN,
    USER_LOGOUT, USER_PROFILE_UPDATED, VOTE_CAST, rule_for,
};

use super::config::CacheConfig;
use super::keys::KeyPattern;
use super::manager::CacheManager;
use super::pubsub::{KEY_INVALIDATED, PubSub, VERSION_CHANGED};
use super::stats::StatEvent;

const METRIC_BATCH_MS: &str = "kessel_invalidation_batch_ms";

const CAUSE_DEPENDENCY: &str = "dependency";
const CAUSE_PATTERN: &str = "pattern";

pub const INVALIDATION_TRANSIENT: &str = "INVALIDATION_TRANSIENT";
pub const INVALIDATION_PERMANENT: &str = "INVALIDATION_PERMANENT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidationError {
    #[error("no invalidation rule for event `{0}`")]
    UnknownEvent(String),
}

impl InvalidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownEvent(_) => "UNKNOWN_EVENT",
        }
    }
}

/// Hook for asking the hosting runtime to re-register its service worker.
pub trait ServiceWorkerRegistrar: Send + Sync {
    fn request_reregistration(&self, version: &str);
}

/// Totals for one `process_batch` or `drain` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub done: usize,
    pub failed: usize,
    pub retries: usize,
    pub dependents: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: BatchReport) {
        self.processed += other.processed;
        self.done += other.done;
        self.failed += other.failed;
        self.retries += other.retries;
        self.dependents += other.dependents;
    }
}

pub struct InvalidationBus {
    manager: Arc<CacheManager>,
    graph: Arc<DependencyGraph>,
    pubsub: Arc<PubSub>,
    queue: InvalidationQueue,
    batch_limit: NonZeroUsize,
    batch_gap: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
    registrar: Option<Arc<dyn ServiceWorkerRegistrar>>,
    wake: Notify,
    done_total: AtomicU64,
    failed_total: AtomicU64,
}

impl InvalidationBus {
    pub fn new(
        config: &CacheConfig,
        manager: Arc<CacheManager>,
        graph: Arc<DependencyGraph>,
        pubsub: Arc<PubSub>,
    ) -> Self {
        Self {
            manager,
            graph,
            pubsub,
            queue: InvalidationQueue::new(config.invalidation_queue_limit),
            batch_limit: config.max_invalidation_batch_non_zero(),
            batch_gap: config.invalidation_delay(),
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay(),
            registrar: None,
            wake: Notify::new(),
            done_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn ServiceWorkerRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Terminal outcomes since start: `(done, failed)`.
    pub fn outcomes(&self) -> (u64, u64) {
        (
            self.done_total.load(Ordering::Relaxed),
            self.failed_total.load(Ordering::Relaxed),
        )
    }

    /// Queue every key selected by `event`. Returns how many were queued.
    #[instrument(skip_all, fields(event = %event))]
    pub async fn emit(&self, event: &str, payload: &Value) -> Result<usize, InvalidationError> {
        let rule = rule_for(event).ok_or_else(|| InvalidationError::UnknownEvent(event.to_string()))?;
        let patterns = rule.expand(payload);
        let queued = self.enqueue_matching(&patterns, event).await;
        info!(event, patterns = patterns.len(), queued, "invalidation event accepted");
        Ok(queued)
    }

    /// Queue every key matching one ad-hoc pattern.
    pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        self.enqueue_matching(std::slice::from_ref(pattern), CAUSE_PATTERN)
            .await
    }

    async fn enqueue_matching(&self, patterns: &[KeyPattern], cause: &str) -> usize {
        let mut queued = 0;
        for (backend, key) in self.manager.keys_matching(patterns).await {
            if self.queue.push(backend, &key, cause).is_some() {
                queued += 1;
            }
        }
        if queued > 0 {
            self.wake.notify_one();
        }
        queued
    }

    /// Drop every asset and service-worker key, announce the new version and
    /// ask the host to re-register its service worker.
    pub async fn version_changed(&self, version: &str) -> usize {
        let queued = self
            .emit(APP_VERSION_CHANGED, &json!({ "version": version }))
            .await
            .unwrap_or_default();
        self.pubsub
            .publish(VERSION_CHANGED, &json!({ "version": version }));
        if let Some(registrar) = &self.registrar {
            registrar.request_reregistration(version);
        }
        info!(version, queued, "application version changed");
        queued
    }

    /// Process one batch of at most `max_invalidation_batch` items.
    pub async fn process_batch(&self) -> BatchReport {
        let batch = self.queue.drain(self.batch_limit.get());
        let mut report = BatchReport::default();
        if batch.is_empty() {
            return report;
        }
        let started = Instant::now();
        for mut item in batch {
            report.processed += 1;
            self.process_item(&mut item, &mut report).await;
        }
        histogram!(METRIC_BATCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(?report, "invalidation batch processed");
        report
    }

    async fn process_item(&self, item: &mut QueuedItem, report: &mut BatchReport) {
        loop {
            item.state = ItemState::Processing;
            item.attempts += 1;
            match self.manager.delete(item.backend, &item.key).await {
                Ok(_) => {
                    item.state = ItemState::Done;
                    break;
                }
                Err(err) if item.attempts <= self.retry_attempts => {
                    item.state = ItemState::Retrying;
                    report.retries += 1;
                    debug!(
                        key = %item.key,
                        attempt = item.attempts,
                        code = INVALIDATION_TRANSIENT,
                        error = %err,
                        "invalidation delete failed; retrying"
                    );
                    time::sleep(self.retry_delay).await;
                }
                Err(err) => {
                    item.state = ItemState::Failed;
                    warn!(
                        key = %item.key,
                        backend = %item.backend,
                        attempts = item.attempts,
                        code = INVALIDATION_PERMANENT,
                        error = %err,
                        "invalidation gave up"
                    );
                    break;
                }
            }
        }

        match item.state {
            ItemState::Done => {
                report.done += 1;
                self.done_total.fetch_add(1, Ordering::Relaxed);
                self.pubsub.publish(
                    KEY_INVALIDATED,
                    &json!({ "key": item.key, "backend": item.backend, "cause": item.cause }),
                );
                report.dependents += self.enqueue_dependents(&item.key).await;
            }
            _ => {
                report.failed += 1;
                self.failed_total.fetch_add(1, Ordering::Relaxed);
                self.manager.telemetry().record(StatEvent::Error {
                    resource: &item.key,
                    code: INVALIDATION_PERMANENT,
                });
            }
        }
    }

    async fn enqueue_dependents(&self, key: &str) -> usize {
        let dependents = self.graph.traverse(key, self.batch_limit.get());
        if dependents.is_empty() {
            return 0;
        }
        let patterns: Vec<KeyPattern> = dependents
            .iter()
            .map(|dependent| KeyPattern::regex(&format!("^{}$", regex::escape(dependent))))
            .collect();
        self.enqueue_matching(&patterns, CAUSE_DEPENDENCY).await
    }

    /// Process batches until the queue is empty, pausing between batches.
    pub async fn drain(&self) -> BatchReport {
        let mut total = BatchReport::default();
        loop {
            let report = self.process_batch().await;
            if report.processed == 0 {
                break;
            }
            total.absorb(report);
            if self.queue.is_empty() {
                break;
            }
            time::sleep(self.batch_gap).await;
        }
        if total.processed > 0 {
            info!(
                processed = total.processed,
                done = total.done,
                failed = total.failed,
                "invalidation queue drained"
            );
        }
        total
    }

    /// Single consumer loop; runs until aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            self.wake.notified().await;
            self.drain().await;
        }
    }

    /// Delete entries whose TTL has lapsed.
    pub async fn sweep_ttl(&self) -> usize {
        self.manager.sweep_expired().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::backend::{
        BackendKind, Capabilities, IndexedStore, KvStore, ResponseStore, StorageBackend, Usage,
    };
    use crate::cache::entry::{CacheEntry, EntryMeta};
    use crate::cache::error::BackendError;
    use crate::cache::manager::{RetrieveOptions, StorageTarget, StoreOptions};
    use crate::cache::stats::TelemetryCollector;

    fn manager(config: &CacheConfig, telemetry: Arc<TelemetryCollector>, pubsub: Arc<PubSub>) -> CacheManager {
        CacheManager::new(config.clone(), telemetry, pubsub)
            .with_backend(Arc::new(KvStore::small_sync(config.small_sync)))
            .with_backend(Arc::new(KvStore::small_session(config.small_session)))
            .with_backend(Arc::new(IndexedStore::new(config.large_async)))
            .with_backend(Arc::new(ResponseStore::new(config.response_store)))
    }

    fn bus_with(config: CacheConfig) -> (InvalidationBus, Arc<CacheManager>, Arc<PubSub>) {
        let pubsub = Arc::new(PubSub::new());
        let telemetry = Arc::new(TelemetryCollector::new(&config));
        let manager = Arc::new(manager(&config, telemetry, Arc::clone(&pubsub)));
        let bus = InvalidationBus::new(
            &config,
            Arc::clone(&manager),
            Arc::new(DependencyGraph::new()),
            Arc::clone(&pubsub),
        );
        (bus, manager, pubsub)
    }

    async fn seed(manager: &CacheManager, keys: &[&str]) {
        for key in keys {
            manager
                .store(*key, "value", StoreOptions::default())
                .await
                .expect("store");
        }
    }

    async fn present(manager: &CacheManager, key: &str) -> bool {
        manager
            .retrieve(key, RetrieveOptions::default())
            .await
            .expect("retrieve")
            .is_some()
    }

    #[tokio::test]
    async fn logout_removes_user_and_session_keys_only() {
        let (bus, manager, pubsub) = bus_with(CacheConfig::default());
        seed(&manager, &["user:42:profile", "session:42", "clan:9:members"]).await;
        let announced = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&announced);
        pubsub.subscribe(KEY_INVALIDATED, move |payload| {
            if let Some(key) = payload.get("key").and_then(Value::as_str) {
                sink.lock().expect("sink").push(key.to_string());
            }
        });

        assert_eq!(bus.emit(USER_LOGOUT, &json!({ "userId": 42 })).await, Ok(2));
        let report = bus.drain().await;
        assert_eq!(report.done, 2);

        assert!(!present(&manager, "user:42:profile").await);
        assert!(!present(&manager, "session:42").await);
        assert!(present(&manager, "clan:9:members").await);
        assert_eq!(announced.lock().expect("sink").len(), 2);
    }

    #[tokio::test]
    async fn unknown_events_are_rejected() {
        let (bus, _, _) = bus_with(CacheConfig::default());
        assert_eq!(
            bus.emit("SOLAR_FLARE", &Value::Null).await,
            Err(InvalidationError::UnknownEvent("SOLAR_FLARE".to_string()))
        );
    }

    #[tokio::test]
    async fn dependents_follow_their_parent() {
        let (bus, manager, _) = bus_with(CacheConfig::default());
        seed(&manager, &["clan:9:members", "ui:clan:9:roster", "leaderboard:weekly"]).await;
        bus.graph()
            .register("clan:9:members", "leaderboard:weekly")
            .expect("edge");

        bus.emit(CLAN_MEMBERSHIP_CHANGED, &json!({ "clanId": 9, "userId": 1 }))
            .await
            .expect("emit");
        let report = bus.drain().await;
        assert_eq!(report.dependents, 1);
        assert!(!present(&manager, "clan:9:members").await);
        assert!(!present(&manager, "ui:clan:9:roster").await);
        assert!(!present(&manager, "leaderboard:weekly").await);
    }

    #[tokio::test]
    async fn batches_respect_the_limit() {
        let (bus, manager, _) = bus_with(CacheConfig {
            max_invalidation_batch: 2,
            invalidation_delay_ms: 0,
            ..CacheConfig::default()
        });
        seed(&manager, &["session:1", "session:2", "session:3"]).await;
        bus.emit(USER_LOGIN, &Value::Null).await.expect("emit");

        assert_eq!(bus.process_batch().await.processed, 2);
        assert_eq!(bus.queue_len(), 1);
        assert_eq!(bus.drain().await.processed, 1);
    }

    struct FlakyBackend {
        failures_left: AtomicU32,
        inner: KvStore,
    }

    #[async_trait]
    impl StorageBackend for FlakyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::SmallSync
        }
        fn capabilities(&self) -> Capabilities {
            self.inner.capabilities()
        }
        fn warning_threshold(&self) -> u64 {
            self.inner.warning_threshold()
        }
        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), BackendError> {
            self.inner.put(key, entry).await
        }
        async fn delete(&self, key: &str) -> Result<bool, BackendError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(BackendError::other(BackendKind::SmallSync, "storage busy"));
            }
            self.inner.delete(key).await
        }
        async fn keys(&self) -> Result<Vec<String>, BackendError> {
            self.inner.keys().await
        }
        async fn clear(&self) -> Result<(), BackendError> {
            self.inner.clear().await
        }
        async fn estimate_usage(&self) -> Result<Usage, BackendError> {
            self.inner.estimate_usage().await
        }
        async fn entries(&self) -> Result<Vec<EntryMeta>, BackendError> {
            self.inner.entries().await
        }
    }

    fn flaky_bus(failures: u32) -> (InvalidationBus, Arc<CacheManager>) {
        let config = CacheConfig::default();
        let pubsub = Arc::new(PubSub::new());
        let telemetry = Arc::new(TelemetryCollector::new(&config));
        let manager = Arc::new(
            CacheManager::new(config.clone(), telemetry, Arc::clone(&pubsub)).with_backend(
                Arc::new(FlakyBackend {
                    failures_left: AtomicU32::new(failures),
                    inner: KvStore::small_sync(config.small_sync),
                }),
            ),
        );
        let bus = InvalidationBus::new(
            &config,
            Arc::clone(&manager),
            Arc::new(DependencyGraph::new()),
            pubsub,
        );
        (bus, manager)
    }

    fn on_small_sync() -> StoreOptions {
        StoreOptions {
            storage: StorageTarget::Backend(BackendKind::SmallSync),
            ..StoreOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let (bus, manager) = flaky_bus(2);
        manager.store("session:1", "v", on_small_sync()).await.expect("store");
        bus.emit(USER_LOGIN, &Value::Null).await.expect("emit");

        let report = bus.drain().await;
        assert_eq!(report.retries, 2);
        assert_eq!(report.done, 1);
        assert_eq!(bus.outcomes(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_bump_the_error_counter() {
        let (bus, manager) = flaky_bus(10);
        manager.store("session:1", "v", on_small_sync()).await.expect("store");
        bus.emit(USER_LOGIN, &Value::Null).await.expect("emit");

        let report = bus.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.retries, 3);
        assert_eq!(bus.outcomes(), (0, 1));
        assert_eq!(manager.telemetry().counters().errors, 1);
    }

    #[derive(Default)]
    struct RecordingRegistrar(Mutex<Vec<String>>);

    impl ServiceWorkerRegistrar for RecordingRegistrar {
        fn request_reregistration(&self, version: &str) {
            self.0.lock().expect("versions").push(version.to_string());
        }
    }

    #[tokio::test]
    async fn version_change_drops_assets_and_reregisters() {
        let config = CacheConfig::default();
        let pubsub = Arc::new(PubSub::new());
        let telemetry = Arc::new(TelemetryCollector::new(&config));
        let manager = Arc::new(manager(&config, telemetry, Arc::clone(&pubsub)));
        let registrar = Arc::new(RecordingRegistrar::default());
        let bus = InvalidationBus::new(
            &config,
            Arc::clone(&manager),
            Arc::new(DependencyGraph::new()),
            pubsub,
        )
        .with_registrar(registrar.clone());
        seed(&manager, &["/static/app.abc12345.js", "build:manifest", "user:1"]).await;

        assert_eq!(bus.version_changed("2.0.0").await, 2);
        bus.drain().await;
        assert!(!present(&manager, "/static/app.abc12345.js").await);
        assert!(present(&manager, "user:1").await);
        assert_eq!(*registrar.0.lock().expect("versions"), vec!["2.0.0".to_string()]);
    }
}
