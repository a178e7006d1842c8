//! Cache entry model shared by every storage adapter.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Retention priority of an entry. Lower priorities are evicted first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Eviction rank: higher rank goes first.
    pub fn eviction_rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the caller's value, kept so reads hand back what was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    Json,
    Binary,
}

/// A value handed to `CacheManager::store`.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Text(String),
    Json(serde_json::Value),
    Binary(Bytes),
}

impl CacheValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Text(_) => ValueKind::Text,
            Self::Json(_) => ValueKind::Json,
            Self::Binary(_) => ValueKind::Binary,
        }
    }

    /// Serialized form used for storage, hashing and size estimation.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            Self::Text(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Self::Json(value) => serde_json::to_vec(value).map(Bytes::from),
            Self::Binary(bytes) => Ok(bytes.clone()),
        }
    }

    /// Rebuild a value from its serialized form.
    pub fn from_bytes(kind: ValueKind, bytes: Bytes) -> Result<Self, String> {
        match kind {
            ValueKind::Text => String::from_utf8(bytes.to_vec())
                .map(Self::Text)
                .map_err(|err| format!("stored text is not utf-8: {err}")),
            ValueKind::Json => serde_json::from_slice(&bytes)
                .map(Self::Json)
                .map_err(|err| format!("stored json is invalid: {err}")),
            ValueKind::Binary => Ok(Self::Binary(bytes)),
        }
    }

    /// Byte length of the serialized form: UTF-8 length for text, serialized
    /// length for JSON, raw length for binary.
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Json(value) => serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0),
            Self::Binary(bytes) => bytes.len(),
        }
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for CacheValue {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

/// A stored cache entry. `payload` holds the (possibly compressed) bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub kind: ValueKind,
    /// Unix milliseconds when the entry was written.
    pub stored_at: i64,
    pub ttl_ms: Option<u64>,
    pub priority: Priority,
    /// Size of the uncompressed serialized value.
    pub size_bytes: u64,
    /// SRI string (`sha384-...`) over the uncompressed serialized value.
    pub integrity: Option<String>,
    pub compressed: bool,
}

impl CacheEntry {
    /// True once `stored_at + ttl_ms < now`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        match self.ttl_ms {
            Some(ttl) => self.stored_at.saturating_add(ttl as i64) < now_ms,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Bytes the entry occupies in its backend.
    pub fn footprint(&self) -> u64 {
        (self.key.len() + self.payload.len()) as u64
    }

    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            key: self.key.clone(),
            stored_at: self.stored_at,
            ttl_ms: self.ttl_ms,
            priority: self.priority,
            footprint: self.footprint(),
        }
    }
}

/// Lightweight view of an entry used by eviction and TTL sweeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub key: String,
    pub stored_at: i64,
    pub ttl_ms: Option<u64>,
    pub priority: Priority,
    pub footprint: u64,
}

impl EntryMeta {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.ttl_ms
            .is_some_and(|ttl| self.stored_at.saturating_add(ttl as i64) < now_ms)
    }
}

/// Order entries for eviction: lowest priority first, then oldest first.
pub fn eviction_order(entries: &mut [EntryMeta]) {
    entries.sort_by(|a, b| {
        b.priority
            .eviction_rank()
            .cmp(&a.priority.eviction_rank())
            .then(a.stored_at.cmp(&b.stored_at))
    });
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
