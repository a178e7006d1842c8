//! Cache configuration.
//!
//! Every knob the subsystem recognizes lives here and is loaded from the
//! `[cache]` table of `kessel.toml` (see `crate::config`).

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use super::integrity::Algorithm;

const DEFAULT_MAX_ETAG_CACHE_SIZE: usize = 1000;
const DEFAULT_ETAG_CACHE_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_SAMPLE_RATE: f64 = 1.0;
const DEFAULT_AGGREGATION_INTERVAL_MS: u64 = 60 * 1000;
const DEFAULT_RETENTION_PERIOD_MS: u64 = 24 * 60 * 60 * 1000;
const DEFAULT_CLEANUP_THRESHOLD: f64 = 0.8;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_TTL_SWEEP_INTERVAL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_MAX_CACHE_SIZE: u64 = 50 * 1024 * 1024;
const DEFAULT_MAX_INVALIDATION_BATCH: usize = 100;
const DEFAULT_INVALIDATION_DELAY_MS: u64 = 50;
const DEFAULT_INVALIDATION_QUEUE_LIMIT: usize = 1000;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_PREDICTIVE_THRESHOLD: f64 = 0.7;
const DEFAULT_WARMING_DELAY_MS: u64 = 100;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 6;
const DEFAULT_SMALL_SYNC_QUOTA: u64 = 5 * 1024 * 1024;
const DEFAULT_LARGE_ASYNC_QUOTA: u64 = 50 * 1024 * 1024;
const DEFAULT_RESPONSE_STORE_QUOTA: u64 = 100 * 1024 * 1024;
const DEFAULT_WARNING_RATIO: f64 = 0.8;
const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Validator generation strategy for `ETag` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EtagStrategy {
    /// Content digest of the full body.
    #[default]
    Strong,
    /// Modification time and size, no body read.
    Weak,
    /// Short MD5 prefix combined with modification time.
    Hybrid,
}

/// How the Content-Security-Policy is delivered on HTML responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CspMode {
    #[default]
    Header,
    ReportOnly,
    Meta,
    Disabled,
}

impl FromStr for EtagStrategy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strong" => Ok(Self::Strong),
            "weak" => Ok(Self::Weak),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown etag strategy `{other}` (strong|weak|hybrid)")),
        }
    }
}

impl FromStr for CspMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "header" => Ok(Self::Header),
            "report-only" => Ok(Self::ReportOnly),
            "meta" => Ok(Self::Meta),
            "disabled" => Ok(Self::Disabled),
            other => Err(format!(
                "unknown csp mode `{other}` (header|report-only|meta|disabled)"
            )),
        }
    }
}

/// Per-backend byte budget.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BackendBudget {
    /// Hard quota in bytes; writes beyond it raise quota-exceeded.
    pub quota_bytes: u64,
    /// Fraction of the quota at which the backend is considered under pressure.
    pub warning_ratio: f64,
}

impl BackendBudget {
    pub const fn new(quota_bytes: u64) -> Self {
        Self {
            quota_bytes,
            warning_ratio: DEFAULT_WARNING_RATIO,
        }
    }

    /// Warning threshold in bytes.
    pub fn warning_threshold(&self) -> u64 {
        (self.quota_bytes as f64 * self.warning_ratio.clamp(0.0, 1.0)) as u64
    }
}

impl Default for BackendBudget {
    fn default() -> Self {
        Self::new(DEFAULT_SMALL_SYNC_QUOTA)
    }
}

/// Cache configuration from `kessel.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Stamp `ETag` headers and answer `If-None-Match`/`If-Match`.
    pub enable_etag: bool,
    /// Stamp `Last-Modified` and answer the date preconditions.
    pub enable_last_modified: bool,
    /// Emit `Vary` headers.
    pub enable_vary: bool,
    /// Compute integrity digests for policies that require them.
    pub enable_sri: bool,
    /// Compress stored values flagged for compression.
    pub enable_compression: bool,
    pub etag_strategy: EtagStrategy,
    /// Digest behind strong validators.
    pub etag_algorithm: Algorithm,
    /// Digest recorded for integrity-tagged entries and `X-Content-Integrity`.
    pub integrity_algorithm: Algorithm,
    /// Maximum memoized validators.
    pub max_etag_cache_size: usize,
    /// Lifetime of a memoized validator.
    pub etag_cache_ttl_ms: u64,
    /// Fraction of telemetry events recorded, in `[0, 1]`.
    pub sample_rate: f64,
    pub aggregation_interval_ms: u64,
    pub retention_period_ms: u64,
    /// Usage ratio above which the periodic cleanup evicts.
    pub cleanup_threshold: f64,
    pub cleanup_interval_ms: u64,
    pub ttl_sweep_interval_ms: u64,
    /// Upper bound across all backends; the periodic cleanup evicts above it.
    pub max_cache_size: u64,
    pub max_invalidation_batch: usize,
    /// Gap between invalidation batches.
    pub invalidation_delay_ms: u64,
    pub invalidation_queue_limit: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Minimum transition confidence before predictive prefetching.
    pub predictive_threshold: f64,
    /// Throttle between warming requests.
    pub warming_delay_ms: u64,
    pub max_concurrent_requests: usize,
    /// Values at or above this many bytes compress off the async executor.
    pub compression_threshold_bytes: usize,
    /// Refetch from the origin instead of failing when a cached value fails
    /// its integrity check.
    pub fallback_on_failure: bool,
    /// Skip warming for authenticated-only routes when no session is present.
    pub exclude_authenticated_without_session: bool,
    pub csp_mode: CspMode,
    pub small_sync: BackendBudget,
    pub small_session: BackendBudget,
    pub large_async: BackendBudget,
    pub response_store: BackendBudget,
    /// Telemetry reports are POSTed here on every aggregation tick when set.
    pub export_endpoint: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_etag: true,
            enable_last_modified: true,
            enable_vary: true,
            enable_sri: true,
            enable_compression: true,
            etag_strategy: EtagStrategy::Strong,
            etag_algorithm: Algorithm::Sha256,
            integrity_algorithm: Algorithm::Sha384,
            max_etag_cache_size: DEFAULT_MAX_ETAG_CACHE_SIZE,
            etag_cache_ttl_ms: DEFAULT_ETAG_CACHE_TTL_MS,
            sample_rate: DEFAULT_SAMPLE_RATE,
            aggregation_interval_ms: DEFAULT_AGGREGATION_INTERVAL_MS,
            retention_period_ms: DEFAULT_RETENTION_PERIOD_MS,
            cleanup_threshold: DEFAULT_CLEANUP_THRESHOLD,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
            ttl_sweep_interval_ms: DEFAULT_TTL_SWEEP_INTERVAL_MS,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_invalidation_batch: DEFAULT_MAX_INVALIDATION_BATCH,
            invalidation_delay_ms: DEFAULT_INVALIDATION_DELAY_MS,
            invalidation_queue_limit: DEFAULT_INVALIDATION_QUEUE_LIMIT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            predictive_threshold: DEFAULT_PREDICTIVE_THRESHOLD,
            warming_delay_ms: DEFAULT_WARMING_DELAY_MS,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD,
            fallback_on_failure: true,
            exclude_authenticated_without_session: true,
            csp_mode: CspMode::Header,
            small_sync: BackendBudget::new(DEFAULT_SMALL_SYNC_QUOTA),
            small_session: BackendBudget::new(DEFAULT_SMALL_SYNC_QUOTA),
            large_async: BackendBudget::new(DEFAULT_LARGE_ASYNC_QUOTA),
            response_store: BackendBudget::new(DEFAULT_RESPONSE_STORE_QUOTA),
            export_endpoint: None,
        }
    }
}

impl CacheConfig {
    /// Memoized validator capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_etag_cache_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_etag_cache_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Invalidation batch size, clamping to 1 if zero.
    pub fn max_invalidation_batch_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_invalidation_batch).unwrap_or(NonZeroUsize::MIN)
    }

    /// Warming concurrency, clamping to 1 if zero.
    pub fn max_concurrent_requests_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_concurrent_requests).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn etag_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.etag_cache_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn ttl_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.ttl_sweep_interval_ms)
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_millis(self.aggregation_interval_ms)
    }

    pub fn invalidation_delay(&self) -> Duration {
        Duration::from_millis(self.invalidation_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn warming_delay(&self) -> Duration {
        Duration::from_millis(self.warming_delay_ms)
    }

    /// Sample rate clamped into `[0, 1]`.
    pub fn sample_rate_clamped(&self) -> f64 {
        self.sample_rate.clamp(0.0, 1.0)
    }
}
