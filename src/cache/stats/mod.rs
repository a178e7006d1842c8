//! Hit/miss telemetry collector.
//!
//! Every recording path passes a sample-rate gate, then bumps the global
//! counters and the per-resource counters. An aggregation tick snapshots the
//! global counters into a rolling window capped at one day of minutes.

mod counters;
mod report;

use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use super::backend::IndexedStore;
use super::config::CacheConfig;
use super::entry::now_ms;
use super::lock;

pub use counters::{Counters, Grade};
pub use report::{Recommendation, RecommendationKind, Report};

const SOURCE: &str = "cache::stats";

const METRIC_HIT_TOTAL: &str = "kessel_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "kessel_cache_miss_total";
const METRIC_STORE_TOTAL: &str = "kessel_cache_store_total";
const METRIC_EVICT_TOTAL: &str = "kessel_cache_evict_total";
const METRIC_SRI_FAILURE_TOTAL: &str = "kessel_cache_sri_failure_total";

/// Snapshots kept in the rolling window (24 h at one per minute).
pub const WINDOW_CAPACITY: usize = 1440;
/// Upper bound on retained raw events regardless of age.
const RAW_EVENT_LIMIT: usize = 100_000;
/// Distinct resources tracked; the least recently recorded is dropped first.
pub const RESOURCE_LIMIT: usize = 10_000;
const ANALYTICS_SNAPSHOT: &str = "snapshot";

/// Browser-reported timing for one fetched resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTiming {
    pub name: String,
    pub transfer_size: u64,
    pub decoded_body_size: u64,
    pub duration_ms: f64,
}

impl ResourceTiming {
    /// Nothing crossed the network yet a body was decoded: served from cache.
    pub fn is_cache_hit(&self) -> bool {
        self.transfer_size == 0 && self.decoded_body_size > 0
    }
}

/// Outcome of one warming attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarmingOutcome {
    Loaded,
    Timeout,
    Network,
}

/// One recordable telemetry event.
#[derive(Debug, Clone)]
pub enum StatEvent<'a> {
    Hit {
        resource: &'a str,
        latency_ms: f64,
        bytes: u64,
    },
    Miss {
        resource: &'a str,
        latency_ms: f64,
    },
    Store {
        resource: &'a str,
        bytes: u64,
    },
    Invalidate {
        resource: &'a str,
    },
    Error {
        resource: &'a str,
        code: &'static str,
    },
    SriFailure {
        resource: &'a str,
    },
    Eviction {
        resource: &'a str,
        bytes: u64,
    },
    NetworkRequest {
        resource: &'a str,
        latency_ms: f64,
        from_cache: bool,
        bytes: u64,
    },
    ResourceTiming(&'a ResourceTiming),
    Warming {
        resource: &'a str,
        outcome: WarmingOutcome,
    },
}

impl StatEvent<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Hit { .. } => "hit",
            Self::Miss { .. } => "miss",
            Self::Store { .. } => "store",
            Self::Invalidate { .. } => "invalidate",
            Self::Error { .. } => "error",
            Self::SriFailure { .. } => "sri-failure",
            Self::Eviction { .. } => "eviction",
            Self::NetworkRequest { .. } => "network-request",
            Self::ResourceTiming(_) => "resource-timing",
            Self::Warming { .. } => "warming",
        }
    }

    fn resource(&self) -> &str {
        match self {
            Self::Hit { resource, .. }
            | Self::Miss { resource, .. }
            | Self::Store { resource, .. }
            | Self::Invalidate { resource }
            | Self::Error { resource, .. }
            | Self::SriFailure { resource }
            | Self::Eviction { resource, .. }
            | Self::NetworkRequest { resource, .. }
            | Self::Warming { resource, .. } => resource,
            Self::ResourceTiming(timing) => &timing.name,
        }
    }

    fn apply(&self, counters: &mut Counters) {
        match self {
            Self::Hit {
                latency_ms, bytes, ..
            } => {
                counters.hits += 1;
                counters.bytes_saved += bytes;
                counters.add_request(*latency_ms);
            }
            Self::Miss { latency_ms, .. } => {
                counters.misses += 1;
                counters.add_request(*latency_ms);
            }
            Self::Store { .. } => counters.stores += 1,
            Self::Invalidate { .. } => counters.invalidations += 1,
            Self::Error { .. } => counters.errors += 1,
            Self::SriFailure { .. } => {
                counters.sri_failures += 1;
                counters.errors += 1;
            }
            Self::Eviction { .. } => counters.evictions += 1,
            Self::NetworkRequest {
                latency_ms,
                from_cache,
                bytes,
                ..
            } => {
                if *from_cache {
                    counters.hits += 1;
                    counters.bytes_saved += bytes;
                } else {
                    counters.misses += 1;
                }
                counters.add_request(*latency_ms);
            }
            Self::ResourceTiming(timing) => {
                if timing.is_cache_hit() {
                    counters.hits += 1;
                    counters.bytes_saved += timing.decoded_body_size;
                } else {
                    counters.misses += 1;
                }
                counters.add_request(timing.duration_ms);
            }
            Self::Warming { outcome, .. } => match outcome {
                WarmingOutcome::Loaded => counters.warmed += 1,
                WarmingOutcome::Timeout | WarmingOutcome::Network => {
                    counters.warming_failures += 1
                }
            },
        }
    }

    fn mirror_to_metrics(&self) {
        match self {
            Self::Hit { .. } => counter!(METRIC_HIT_TOTAL).increment(1),
            Self::Miss { .. } => counter!(METRIC_MISS_TOTAL).increment(1),
            Self::Store { .. } => counter!(METRIC_STORE_TOTAL).increment(1),
            Self::Eviction { .. } => counter!(METRIC_EVICT_TOTAL).increment(1),
            Self::SriFailure { .. } => counter!(METRIC_SRI_FAILURE_TOTAL).increment(1),
            Self::ResourceTiming(timing) if timing.is_cache_hit() => {
                counter!(METRIC_HIT_TOTAL).increment(1)
            }
            Self::ResourceTiming(_) => counter!(METRIC_MISS_TOTAL).increment(1),
            _ => {}
        }
    }
}

/// Global counters captured by one aggregation tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub at: i64,
    pub counters: Counters,
}

#[derive(Debug, Clone)]
struct RawEvent {
    at: i64,
    name: &'static str,
    resource: String,
}

#[derive(Debug, Clone, Copy)]
struct TrackedResource {
    counters: Counters,
    last_seen: i64,
}

struct CollectorState {
    global: Counters,
    resources: LruCache<String, TrackedResource>,
    window: VecDeque<Snapshot>,
    raw: VecDeque<RawEvent>,
    sample_credit: f64,
}

impl CollectorState {
    fn new(resource_limit: NonZeroUsize) -> Self {
        Self {
            global: Counters::default(),
            resources: LruCache::new(resource_limit),
            window: VecDeque::new(),
            raw: VecDeque::new(),
            sample_credit: 0.0,
        }
    }
}

/// Collects cache telemetry. Cheap to share behind an `Arc`.
pub struct TelemetryCollector {
    sample_rate: f64,
    retention_ms: u64,
    resource_limit: NonZeroUsize,
    state: Mutex<CollectorState>,
    analytics: Option<Arc<IndexedStore>>,
}

impl TelemetryCollector {
    pub fn new(config: &CacheConfig) -> Self {
        let resource_limit = NonZeroUsize::new(RESOURCE_LIMIT).unwrap_or(NonZeroUsize::MIN);
        Self {
            sample_rate: config.sample_rate_clamped(),
            retention_ms: config.retention_period_ms,
            resource_limit,
            state: Mutex::new(CollectorState::new(resource_limit)),
            analytics: None,
        }
    }

    /// Track at most `limit` distinct resources.
    pub fn with_resource_limit(mut self, limit: usize) -> Self {
        self.resource_limit = NonZeroUsize::new(limit).unwrap_or(NonZeroUsize::MIN);
        self.state = Mutex::new(CollectorState::new(self.resource_limit));
        self
    }

    /// Persist aggregation snapshots into the indexed store's analytics set.
    pub fn with_analytics(mut self, store: Arc<IndexedStore>) -> Self {
        self.analytics = Some(store);
        self
    }

    /// Record one event, subject to the sample-rate gate.
    ///
    /// Sampling is systematic: with rate `r`, every event adds `r` credit and
    /// an event is kept whenever a whole unit of credit is available.
    pub fn record(&self, event: StatEvent<'_>) {
        event.mirror_to_metrics();

        let mut state = lock::lock(&self.state, SOURCE, "record");
        state.sample_credit += self.sample_rate;
        if state.sample_credit < 1.0 {
            return;
        }
        state.sample_credit -= 1.0;

        let now = now_ms();
        event.apply(&mut state.global);
        let resource = event.resource();
        match state.resources.get_mut(resource) {
            Some(tracked) => {
                event.apply(&mut tracked.counters);
                tracked.last_seen = now;
            }
            None => {
                let mut counters = Counters::default();
                event.apply(&mut counters);
                state.resources.put(
                    resource.to_string(),
                    TrackedResource {
                        counters,
                        last_seen: now,
                    },
                );
            }
        }

        if state.raw.len() >= RAW_EVENT_LIMIT {
            state.raw.pop_front();
        }
        state.raw.push_back(RawEvent {
            at: now,
            name: event.name(),
            resource: resource.to_string(),
        });
    }

    pub fn counters(&self) -> Counters {
        lock::lock(&self.state, SOURCE, "counters").global
    }

    pub fn resource(&self, resource: &str) -> Option<Counters> {
        lock::lock(&self.state, SOURCE, "resource")
            .resources
            .peek(resource)
            .map(|tracked| tracked.counters)
    }

    /// Distinct resources currently tracked.
    pub fn resource_count(&self) -> usize {
        lock::lock(&self.state, SOURCE, "resource_count")
            .resources
            .len()
    }

    /// Raw events of `name` still retained.
    pub fn raw_event_count(&self, name: &str) -> usize {
        lock::lock(&self.state, SOURCE, "raw_event_count")
            .raw
            .iter()
            .filter(|event| event.name == name)
            .count()
    }

    pub fn window(&self) -> Vec<Snapshot> {
        lock::lock(&self.state, SOURCE, "window")
            .window
            .iter()
            .copied()
            .collect()
    }

    /// Snapshot the global counters into the rolling window and drop raw
    /// events and per-resource counters older than the retention period.
    pub fn aggregate(&self) -> Snapshot {
        self.aggregate_at(now_ms())
    }

    fn aggregate_at(&self, now: i64) -> Snapshot {
        let mut state = lock::lock(&self.state, SOURCE, "aggregate");
        let snapshot = Snapshot {
            at: now,
            counters: state.global,
        };
        if state.window.len() >= WINDOW_CAPACITY {
            state.window.pop_front();
        }
        state.window.push_back(snapshot);

        let cutoff = now.saturating_sub(self.retention_ms as i64);
        let before = state.raw.len();
        while state.raw.front().is_some_and(|event| event.at < cutoff) {
            state.raw.pop_front();
        }
        let pruned = before - state.raw.len();

        let stale: Vec<String> = state
            .resources
            .iter()
            .filter(|(_, tracked)| tracked.last_seen < cutoff)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            state.resources.pop(name);
        }
        debug!(
            window = state.window.len(),
            pruned,
            stale_resources = stale.len(),
            "telemetry aggregated"
        );
        snapshot
    }

    /// Aggregate, then write the snapshot to the analytics set and prune
    /// persisted snapshots past retention.
    pub async fn aggregate_and_persist(&self) -> Snapshot {
        let snapshot = self.aggregate();
        if let Some(store) = &self.analytics {
            let payload = match serde_json::to_value(snapshot.counters) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "telemetry snapshot not serializable");
                    return snapshot;
                }
            };
            if let Err(err) = store
                .record_analytics(ANALYTICS_SNAPSHOT, snapshot.at, payload)
                .await
            {
                warn!(error = %err, "telemetry snapshot not persisted");
            }
            let cutoff = snapshot.at.saturating_sub(self.retention_ms as i64);
            if let Err(err) = store.prune_analytics(cutoff).await {
                warn!(error = %err, "telemetry snapshot pruning failed");
            }
        }
        snapshot
    }

    pub fn report(&self) -> Report {
        let state = lock::lock(&self.state, SOURCE, "report");
        let resources: BTreeMap<String, Counters> = state
            .resources
            .iter()
            .map(|(name, tracked)| (name.clone(), tracked.counters))
            .collect();
        let global = state.global;
        Report {
            generated_at: now_ms(),
            counters: global,
            hit_rate: global.hit_rate(),
            avg_latency_ms: global.avg_latency_ms(),
            error_rate: global.error_rate(),
            grade: Grade::from_performance(global.hit_rate(), global.avg_latency_ms()),
            recommendations: report::recommendations(&global, &resources),
            resources,
            window_len: state.window.len(),
        }
    }

    /// POST the current report as JSON. Failures are logged and swallowed.
    pub async fn export(&self, client: &reqwest::Client, endpoint: &str) -> bool {
        let report = self.report();
        let result = client
            .post(endpoint)
            .timeout(Duration::from_secs(10))
            .json(&report)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => {
                debug!(endpoint, "telemetry exported");
                true
            }
            Err(err) => {
                warn!(
                    endpoint,
                    error = %err,
                    code = "TELEMETRY_EXPORT_FAILED",
                    "telemetry export failed"
                );
                false
            }
        }
    }

    pub fn reset(&self) {
        let mut state = lock::lock(&self.state, SOURCE, "reset");
        *state = CollectorState::new(self.resource_limit);
    }

    /// Compact summary for log lines.
    pub fn summary(&self) -> serde_json::Value {
        let counters = self.counters();
        json!({
            "hits": counters.hits,
            "misses": counters.misses,
            "hitRate": counters.hit_rate(),
            "errors": counters.errors,
        })
    }
}
