//! Storage adapters.
//!
//! Four adapters share one contract: two small synchronous string stores
//! (persistent and session-scoped), an indexed asynchronous record store and a
//! request/response store partitioned into named buckets. The manager only
//! talks to [`StorageBackend`]; it never downcasts.

mod indexed;
mod kv;
mod response;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use super::entry::{CacheEntry, EntryMeta};
use super::error::BackendError;

pub use indexed::{AnalyticsRecord, IndexedStore};
pub use kv::{KvLifetime, KvStore};
pub use response::{Bucket, CachedResponse, ResponseStore};

/// Identity of a storage adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    SmallSync,
    SmallSession,
    LargeAsync,
    ResponseStore,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::SmallSync,
        BackendKind::SmallSession,
        BackendKind::LargeAsync,
        BackendKind::ResponseStore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SmallSync => "smallSync",
            Self::SmallSession => "smallSession",
            Self::LargeAsync => "largeAsync",
            Self::ResponseStore => "responseStore",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an adapter can do. The manager skips adapters lacking a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub max_bytes_hint: u64,
    pub is_async: bool,
    pub persistent: bool,
    pub supports_indices: bool,
}

/// Result of `estimate_usage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub used: u64,
    pub quota: u64,
}

impl Usage {
    pub fn ratio(&self) -> f64 {
        if self.quota == 0 {
            return 0.0;
        }
        self.used as f64 / self.quota as f64
    }

    pub fn available(&self) -> u64 {
        self.quota.saturating_sub(self.used)
    }
}

/// Common contract implemented by every adapter.
///
/// `put` replaces any existing entry for the key, so at most one live entry
/// per key exists in a backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// Byte level above which the backend is considered under pressure.
    fn warning_threshold(&self) -> u64;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError>;

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), BackendError>;

    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Snapshot of current keys. Later mutations are not reflected.
    async fn keys(&self) -> Result<Vec<String>, BackendError>;

    async fn clear(&self) -> Result<(), BackendError>;

    async fn estimate_usage(&self) -> Result<Usage, BackendError>;

    /// Snapshot of entry metadata for eviction and TTL sweeps.
    async fn entries(&self) -> Result<Vec<EntryMeta>, BackendError>;
}
