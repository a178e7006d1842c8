//! Kessel cache subsystem.
//!
//! Layers, leaves first:
//!
//! - **Policy table**: asset tag → cache directives, with an ordered URL classifier
//! - **Storage adapters**: four backends behind one [`StorageBackend`] contract
//! - **Cache manager**: backend selection, compression, integrity, quota recovery
//! - **Negotiator**: `ETag`/`Last-Modified` validators and precondition evaluation
//! - **Response decorator**: axum middleware stamping policy and security headers
//! - **Warming engine**: preload/prefetch driven by observed navigation
//! - **Invalidation bus**: domain events → key patterns → batched deletions
//! - **Telemetry collector**: sampled hit/miss counters, grading, recommendations
//!
//! ## Configuration
//!
//! Controlled by the `[cache]` table of `kessel.toml`:
//!
//! ```toml
//! [cache]
//! enable_etag = true
//! etag_strategy = "strong"
//! max_invalidation_batch = 100
//! # ... see config.rs for all options
//! ```
//!
//! [`CacheSystem`] wires everything together.

pub mod backend;
mod compression;
mod config;
mod entry;
mod error;
mod headers;
mod integrity;
pub mod invalidation;
mod keys;
mod lock;
mod manager;
mod middleware;
mod negotiate;
mod policy;
mod pubsub;
pub mod stats;
mod system;
pub mod warming;

pub use backend::{BackendKind, Capabilities, StorageBackend, Usage};
pub use compression::{CompressionError, compress, decompress};
pub use config::{BackendBudget, CacheConfig, CspMode, EtagStrategy};
pub use entry::{CacheEntry, CacheValue, EntryMeta, Priority, ValueKind};
pub use error::{BackendError, CacheError};
pub use headers::{
    ContentSecurityPolicy, Directive, X_CONTENT_INTEGRITY, http_date, parse_http_date,
    security_headers,
};
pub use integrity::{
    Algorithm, IntegrityManifest, IntegrityRecord, ManifestDrift, Verification, sri_list, verify,
};
pub use invalidation::{InvalidationBus, InvalidationError, ServiceWorkerRegistrar};
pub use keys::KeyPattern;
pub use manager::{
    CacheManager, ManagerStats, PurgeScope, RetrieveOptions, StorageTarget, StoreOptions,
};
pub use middleware::{DecoratorState, FileSource, MAX_DECORATED_BODY, decorate_responses};
pub use negotiate::{Decision, EntityTag, FileMeta, Negotiator, Preconditions, canonical_json};
pub use policy::{AssetTag, CLASSIFICATION_RULES, Policy, PolicyTable, VaryAxis, classify};
pub use pubsub::{KEY_INVALIDATED, PubSub, QUOTA_EVICTION, SubscriptionId, VERSION_CHANGED};
pub use stats::{Grade, Report, StatEvent, TelemetryCollector};
pub use system::{BackgroundTasks, CacheSystem, CacheSystemBuilder};
pub use warming::{AssetCatalog, Fetcher, HttpFetcher, WarmingEngine};
