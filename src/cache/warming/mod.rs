//! Warming engine: fetches high-value assets before they are needed and
//! writes them through the cache manager.
//!
//! Three phases run after start: the immediate sets are preloaded, the early
//! sets are prefetched once idle, and a transition model over recent
//! pageviews prefetches the assets of the most likely next page.

mod assets;
mod fetch;
mod model;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

pub use assets::{AssetCatalog, AssetSet, as_type};
pub use fetch::{FetchError, Fetcher, HttpFetcher};
pub use model::{
    BehaviorLog, OBSERVATION_LIMIT, Observation, ObservationKind, PathStats, TransitionModel,
};

use super::config::CacheConfig;
use super::entry::{Priority, now_ms};
use super::lock;
use super::manager::{CacheManager, StoreOptions};
use super::policy::PolicyTable;
use super::stats::{StatEvent, WarmingOutcome};

const SOURCE: &str = "cache::warming";
const METRIC_WARMING_REQUEST_TOTAL: &str = "kessel_warming_request_total";

pub const PRELOAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const PREFETCH_TIMEOUT: Duration = Duration::from_secs(15);
/// Idle budget before the early phase.
pub const EARLY_PHASE_DELAY: Duration = Duration::from_secs(1);
/// The predictive phase never starts sooner than this after start.
pub const PREDICTIVE_PHASE_DELAY: Duration = Duration::from_secs(2);
pub const PREDICTIVE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HintKind {
    Preload,
    Prefetch,
}

impl HintKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preload => "preload",
            Self::Prefetch => "prefetch",
        }
    }

    fn timeout(self) -> Duration {
        match self {
            Self::Preload => PRELOAD_TIMEOUT,
            Self::Prefetch => PREFETCH_TIMEOUT,
        }
    }

    fn priority(self) -> Priority {
        match self {
            Self::Preload => Priority::High,
            Self::Prefetch => Priority::Low,
        }
    }
}

/// A `<link>` resource hint emitted for a warmed asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkHint {
    pub rel: HintKind,
    pub href: String,
    #[serde(rename = "as")]
    pub as_type: &'static str,
}

impl fmt::Display for LinkHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rel {
            HintKind::Preload => write!(
                f,
                r#"<link rel="preload" href="{}" as="{}">"#,
                self.href, self.as_type
            ),
            HintKind::Prefetch => write!(f, r#"<link rel="prefetch" href="{}">"#, self.href),
        }
    }
}

/// Per-run tally. Warming failures are never surfaced as errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmingSummary {
    pub requested: usize,
    pub skipped: usize,
    pub loaded: usize,
    pub timed_out: usize,
    pub failed: usize,
}

impl WarmingSummary {
    fn count(&mut self, outcome: WarmingOutcome) {
        match outcome {
            WarmingOutcome::Loaded => self.loaded += 1,
            WarmingOutcome::Timeout => self.timed_out += 1,
            WarmingOutcome::Network => self.failed += 1,
        }
    }
}

fn outcome_label(outcome: WarmingOutcome) -> &'static str {
    match outcome {
        WarmingOutcome::Loaded => "loaded",
        WarmingOutcome::Timeout => "timeout",
        WarmingOutcome::Network => "network",
    }
}

pub struct WarmingEngine {
    catalog: AssetCatalog,
    fetcher: Arc<dyn Fetcher>,
    manager: Arc<CacheManager>,
    policies: Arc<PolicyTable>,
    predictive_threshold: f64,
    delay: Duration,
    exclude_authenticated: bool,
    permits: Arc<Semaphore>,
    log: Mutex<BehaviorLog>,
    loaded: RwLock<BTreeSet<String>>,
    hints: Mutex<Vec<LinkHint>>,
    session_active: AtomicBool,
}

impl WarmingEngine {
    pub fn new(
        config: &CacheConfig,
        catalog: AssetCatalog,
        fetcher: Arc<dyn Fetcher>,
        manager: Arc<CacheManager>,
        policies: Arc<PolicyTable>,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            manager,
            policies,
            predictive_threshold: config.predictive_threshold,
            delay: config.warming_delay(),
            exclude_authenticated: config.exclude_authenticated_without_session,
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests_non_zero().get())),
            log: Mutex::new(BehaviorLog::new()),
            loaded: RwLock::new(BTreeSet::new()),
            hints: Mutex::new(Vec::new()),
            session_active: AtomicBool::new(false),
        }
    }

    pub fn record_pageview(&self, path: &str) {
        self.record_pageview_at(path, now_ms());
    }

    pub fn record_pageview_at(&self, path: &str, at_ms: i64) {
        lock::lock(&self.log, SOURCE, "record_pageview").record_pageview(path, at_ms);
    }

    pub fn record_interaction(&self, target: &str) {
        lock::lock(&self.log, SOURCE, "record_interaction").record_interaction(target, now_ms());
    }

    pub fn set_session_active(&self, active: bool) {
        self.session_active.store(active, Ordering::Relaxed);
    }

    pub fn loaded_assets(&self) -> BTreeSet<String> {
        lock::read(&self.loaded, SOURCE, "loaded_assets").clone()
    }

    pub fn hints(&self) -> Vec<LinkHint> {
        lock::lock(&self.hints, SOURCE, "hints").clone()
    }

    pub fn transitions(&self) -> TransitionModel {
        lock::lock(&self.log, SOURCE, "transitions").transitions()
    }

    /// Run every phase, then repeat the predictive phase until aborted.
    pub async fn run(self: Arc<Self>) {
        self.warm_immediate().await;
        time::sleep(EARLY_PHASE_DELAY).await;
        self.warm_early().await;
        time::sleep(PREDICTIVE_PHASE_DELAY.saturating_sub(EARLY_PHASE_DELAY)).await;

        let mut ticker = time::interval(PREDICTIVE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.warm_predictive(None).await;
        }
    }

    pub async fn warm_immediate(self: &Arc<Self>) -> WarmingSummary {
        let urls = self.urls_of(&AssetSet::IMMEDIATE);
        info!(phase = "immediate", assets = urls.len(), "warming phase started");
        self.warm(urls, HintKind::Preload).await
    }

    pub async fn warm_early(self: &Arc<Self>) -> WarmingSummary {
        let urls = self.urls_of(&AssetSet::EARLY);
        info!(phase = "early", assets = urls.len(), "warming phase started");
        self.warm(urls, HintKind::Prefetch).await
    }

    /// Prefetch assets of pages likely to follow `current` (the latest
    /// pageview when `None`).
    pub async fn warm_predictive(self: &Arc<Self>, current: Option<&str>) -> WarmingSummary {
        let (model, current) = {
            let log = lock::lock(&self.log, SOURCE, "warm_predictive");
            let current = current
                .map(str::to_string)
                .or_else(|| log.current_path().map(str::to_string));
            (log.transitions(), current)
        };
        let Some(current) = current else {
            return WarmingSummary::default();
        };

        let session = self.session_active.load(Ordering::Relaxed);
        let mut urls = Vec::new();
        for (next, confidence) in model.predictions(&current, self.predictive_threshold) {
            if self.exclude_authenticated && !session && self.catalog.requires_session(&next) {
                debug!(from = %current, to = %next, "skipping authenticated page without session");
                continue;
            }
            debug!(from = %current, to = %next, confidence, "predicted navigation");
            urls.extend(self.catalog.assets_for(&next).iter().cloned());
        }
        if urls.is_empty() {
            return WarmingSummary::default();
        }
        info!(phase = "predictive", from = %current, assets = urls.len(), "warming phase started");
        self.warm(urls, HintKind::Prefetch).await
    }

    fn urls_of(&self, sets: &[AssetSet]) -> Vec<String> {
        sets.iter()
            .flat_map(|set| self.catalog.set(*set).iter().cloned())
            .collect()
    }

    /// Emit hints for unseen URLs, then fetch them with bounded concurrency
    /// and a fixed gap between launches.
    #[instrument(skip_all, fields(rel = kind.as_str()))]
    async fn warm(self: &Arc<Self>, urls: Vec<String>, kind: HintKind) -> WarmingSummary {
        let mut summary = WarmingSummary {
            requested: urls.len(),
            ..WarmingSummary::default()
        };

        let fresh: Vec<String> = {
            let mut loaded = lock::write(&self.loaded, SOURCE, "warm");
            let mut hints = lock::lock(&self.hints, SOURCE, "warm");
            urls.into_iter()
                .filter(|url| {
                    if !loaded.insert(url.clone()) {
                        return false;
                    }
                    hints.push(LinkHint {
                        rel: kind,
                        href: url.clone(),
                        as_type: as_type(url),
                    });
                    true
                })
                .collect()
        };
        summary.skipped = summary.requested - fresh.len();

        let mut tasks = JoinSet::new();
        for (index, url) in fresh.into_iter().enumerate() {
            if index > 0 && !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                engine.warm_one(&url, kind).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.count(outcome),
                Err(err) => {
                    warn!(error = %err, "warming task panicked");
                    summary.failed += 1;
                }
            }
        }
        debug!(?summary, "warming batch finished");
        summary
    }

    async fn warm_one(&self, url: &str, kind: HintKind) -> WarmingOutcome {
        let outcome = match time::timeout(kind.timeout(), self.fetcher.fetch(url)).await {
            Ok(Ok(body)) => {
                self.store(url, body, kind).await;
                WarmingOutcome::Loaded
            }
            Ok(Err(err)) => {
                debug!(url, error = %err, "warming fetch failed");
                WarmingOutcome::Network
            }
            Err(_) => {
                warn!(url, timeout_ms = kind.timeout().as_millis() as u64, "warming timed out");
                WarmingOutcome::Timeout
            }
        };
        if outcome != WarmingOutcome::Loaded {
            lock::write(&self.loaded, SOURCE, "warm_one").remove(url);
        }
        counter!(METRIC_WARMING_REQUEST_TOTAL, "outcome" => outcome_label(outcome)).increment(1);
        self.manager.telemetry().record(StatEvent::Warming {
            resource: url,
            outcome,
        });
        outcome
    }

    async fn store(&self, url: &str, body: bytes::Bytes, kind: HintKind) {
        let (_, policy) = self.policies.resolve(url);
        let options = StoreOptions {
            priority: kind.priority(),
            ttl_ms: (policy.max_age > 0).then(|| policy.max_age_ms()),
            compress: policy.compressible,
            require_integrity: policy.require_integrity,
            ..StoreOptions::default()
        };
        if let Err(err) = self.manager.store(url, body, options).await {
            warn!(url, code = err.code(), error = %err, "warmed asset was not cached");
        }
    }
}
