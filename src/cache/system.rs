//! Composition root.
//!
//! Builds every component once, wires them together and owns the periodic
//! tasks. Collaborators receive `Arc` handles from here instead of reaching
//! for globals.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use super::backend::{IndexedStore, KvStore, ResponseStore};
use super::config::CacheConfig;
use super::headers::ContentSecurityPolicy;
use super::integrity::IntegrityManifest;
use super::invalidation::{DependencyGraph, InvalidationBus, ServiceWorkerRegistrar};
use super::manager::CacheManager;
use super::middleware::DecoratorState;
use super::negotiate::Negotiator;
use super::policy::PolicyTable;
use super::pubsub::PubSub;
use super::stats::TelemetryCollector;
use super::warming::{AssetCatalog, Fetcher, WarmingEngine};

pub struct CacheSystemBuilder {
    config: CacheConfig,
    fetcher: Arc<dyn Fetcher>,
    catalog: AssetCatalog,
    manifest_path: Option<PathBuf>,
    registrar: Option<Arc<dyn ServiceWorkerRegistrar>>,
    csp: ContentSecurityPolicy,
}

impl CacheSystemBuilder {
    pub fn new(config: CacheConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            catalog: AssetCatalog::standard(),
            manifest_path: None,
            registrar: None,
            csp: ContentSecurityPolicy::standard(),
        }
    }

    pub fn catalog(mut self, catalog: AssetCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn manifest(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(path.into());
        self
    }

    pub fn registrar(mut self, registrar: Arc<dyn ServiceWorkerRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn csp(mut self, csp: ContentSecurityPolicy) -> Self {
        self.csp = csp;
        self
    }

    /// Wire policy table → adapters → manager → negotiator → decorator →
    /// bus → warming → collector.
    ///
    /// A manifest that fails to load does not abort the build; stores that
    /// require integrity then fail with `INTEGRITY_INIT_FAILED`.
    pub fn build(self) -> CacheSystem {
        let config = Arc::new(self.config);
        let pubsub = Arc::new(PubSub::new());
        let policies = Arc::new(PolicyTable::standard());

        let indexed = Arc::new(IndexedStore::new(config.large_async));
        let telemetry =
            Arc::new(TelemetryCollector::new(&config).with_analytics(Arc::clone(&indexed)));

        let manager = Arc::new(
            CacheManager::new(config.as_ref().clone(), Arc::clone(&telemetry), Arc::clone(&pubsub))
                .with_backend(Arc::new(KvStore::small_sync(config.small_sync)))
                .with_backend(Arc::new(KvStore::small_session(config.small_session)))
                .with_backend(indexed)
                .with_backend(Arc::new(ResponseStore::new(config.response_store))),
        );

        let manifest = match &self.manifest_path {
            Some(path) => match IntegrityManifest::load(path) {
                Ok(manifest) => Some(manifest),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        code = err.code(),
                        error = %err,
                        "integrity manifest unavailable"
                    );
                    manager.mark_integrity_unavailable(err.to_string());
                    None
                }
            },
            None => None,
        };

        let negotiator = Arc::new(Negotiator::new(&config));
        negotiator.subscribe_to(&pubsub);

        let decorator = DecoratorState::new(
            Arc::clone(&config),
            Arc::clone(&policies),
            Arc::clone(&negotiator),
        )
        .with_csp(self.csp);

        let mut bus = InvalidationBus::new(
            &config,
            Arc::clone(&manager),
            Arc::new(DependencyGraph::new()),
            Arc::clone(&pubsub),
        );
        if let Some(registrar) = self.registrar {
            bus = bus.with_registrar(registrar);
        }

        let warming = Arc::new(WarmingEngine::new(
            &config,
            self.catalog,
            self.fetcher,
            Arc::clone(&manager),
            Arc::clone(&policies),
        ));

        info!(
            manifest = manifest.as_ref().map_or(0, IntegrityManifest::len),
            "cache system assembled"
        );

        CacheSystem {
            config,
            pubsub,
            policies,
            telemetry,
            manager,
            negotiator,
            decorator,
            bus: Arc::new(bus),
            warming,
            manifest: manifest.map(Arc::new),
            export_client: reqwest::Client::new(),
        }
    }
}

/// Every component of the cache subsystem, built once.
pub struct CacheSystem {
    config: Arc<CacheConfig>,
    pubsub: Arc<PubSub>,
    policies: Arc<PolicyTable>,
    telemetry: Arc<TelemetryCollector>,
    manager: Arc<CacheManager>,
    negotiator: Arc<Negotiator>,
    decorator: DecoratorState,
    bus: Arc<InvalidationBus>,
    warming: Arc<WarmingEngine>,
    manifest: Option<Arc<IntegrityManifest>>,
    export_client: reqwest::Client,
}

impl CacheSystem {
    pub fn builder(config: CacheConfig, fetcher: Arc<dyn Fetcher>) -> CacheSystemBuilder {
        CacheSystemBuilder::new(config, fetcher)
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    pub fn pubsub(&self) -> &Arc<PubSub> {
        &self.pubsub
    }

    pub fn policies(&self) -> &Arc<PolicyTable> {
        &self.policies
    }

    pub fn telemetry(&self) -> &Arc<TelemetryCollector> {
        &self.telemetry
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    /// State for [`super::decorate_responses`].
    pub fn decorator(&self) -> DecoratorState {
        self.decorator.clone()
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    pub fn warming(&self) -> &Arc<WarmingEngine> {
        &self.warming
    }

    pub fn manifest(&self) -> Option<&Arc<IntegrityManifest>> {
        self.manifest.as_ref()
    }

    /// Start the periodic tasks. They stop when the returned handle drops.
    pub fn spawn_background(&self) -> BackgroundTasks {
        let mut handles = Vec::with_capacity(5);

        let manager = Arc::clone(&self.manager);
        handles.push(spawn_every(self.config.cleanup_interval(), move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.cleanup().await;
            }
        }));

        let bus = Arc::clone(&self.bus);
        handles.push(spawn_every(self.config.ttl_sweep_interval(), move || {
            let bus = Arc::clone(&bus);
            async move {
                bus.sweep_ttl().await;
            }
        }));

        handles.push(tokio::spawn(Arc::clone(&self.bus).run()));

        let telemetry = Arc::clone(&self.telemetry);
        let client = self.export_client.clone();
        let endpoint = self.config.export_endpoint.clone();
        handles.push(spawn_every(self.config.aggregation_interval(), move || {
            let telemetry = Arc::clone(&telemetry);
            let client = client.clone();
            let endpoint = endpoint.clone();
            async move {
                telemetry.aggregate_and_persist().await;
                if let Some(endpoint) = endpoint {
                    telemetry.export(&client, &endpoint).await;
                }
            }
        }));

        handles.push(tokio::spawn(Arc::clone(&self.warming).run()));

        info!(tasks = handles.len(), "cache background tasks started");
        BackgroundTasks { handles }
    }
}

fn spawn_every<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // first tick is immediate
        loop {
            interval.tick().await;
            tick().await;
        }
    })
}

/// Handles of the periodic tasks; aborts them on drop.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every task and wait for them to wind down.
    pub async fn shutdown(mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::cache::error::CacheError;
    use crate::cache::invalidation::USER_LOGOUT;
    use crate::cache::manager::{RetrieveOptions, StoreOptions};
    use crate::cache::warming::FetchError;

    struct EchoFetcher;

    #[async_trait]
    impl Fetcher for EchoFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            Ok(Bytes::from(format!("/* {url} */")))
        }
    }

    fn system() -> CacheSystem {
        CacheSystem::builder(CacheConfig::default(), Arc::new(EchoFetcher)).build()
    }

    #[tokio::test(start_paused = true)]
    async fn background_processor_drains_emitted_events() {
        let system = system();
        let manager = system.manager();
        manager
            .store("user:42:profile", json!({ "name": "kessel" }), StoreOptions::default())
            .await
            .expect("store");

        let tasks = system.spawn_background();
        assert_eq!(tasks.len(), 5);
        system
            .bus()
            .emit(USER_LOGOUT, &json!({ "userId": 42 }))
            .await
            .expect("emit");
        time::sleep(Duration::from_millis(200)).await;

        let value = manager
            .retrieve("user:42:profile", RetrieveOptions::default())
            .await
            .expect("retrieve");
        assert!(value.is_none());
        tasks.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn warming_runs_in_the_background() {
        let system = system();
        let _tasks = system.spawn_background();
        time::sleep(Duration::from_secs(3)).await;
        assert!(!system.warming().loaded_assets().is_empty());
    }

    #[tokio::test]
    async fn unreadable_manifest_blocks_integrity_stores() {
        let dir = tempfile::tempdir().expect("tempdir");
        let system = CacheSystem::builder(CacheConfig::default(), Arc::new(EchoFetcher))
            .manifest(dir.path().join("missing.json"))
            .build();
        assert!(system.manifest().is_none());

        let err = system
            .manager()
            .store(
                "static:app",
                "body",
                StoreOptions {
                    require_integrity: true,
                    ..StoreOptions::default()
                },
            )
            .await
            .expect_err("integrity unavailable");
        assert!(matches!(err, CacheError::IntegrityInitFailed(_)));
    }
}
