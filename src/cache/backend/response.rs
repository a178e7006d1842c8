//! Request/response store partitioned into named buckets.
//!
//! Every URL maps to exactly one bucket, so a key never moves between
//! buckets. Cache entries handed to this store through [`StorageBackend`] are
//! kept as full responses with their bookkeeping in `x-kessel-*` headers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::{BackendKind, Capabilities, StorageBackend, Usage};
use crate::cache::config::BackendBudget;
use crate::cache::entry::{CacheEntry, EntryMeta, Priority, ValueKind};
use crate::cache::error::BackendError;

const KIND: BackendKind = BackendKind::ResponseStore;

const H_STORED_AT: &str = "x-kessel-stored-at";
const H_TTL: &str = "x-kessel-ttl";
const H_PRIORITY: &str = "x-kessel-priority";
const H_KIND: &str = "x-kessel-kind";
const H_SIZE: &str = "x-kessel-size";
const H_INTEGRITY: &str = "x-kessel-integrity";
const H_COMPRESSED: &str = "x-kessel-compressed";

static GAMING_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^/(gaming|games?|tournaments?|leaderboards?)(/|$)")
        .expect("gaming path regex")
});
static STATIC_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^/static/|\.(m?js|css|map|woff2?|ttf|otf|eot|png|jpe?g|gif|webp|avif|svg|ico)$)")
        .expect("static path regex")
});

/// Named partition of the response store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Static,
    Dynamic,
    Api,
    Gaming,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [Bucket::Static, Bucket::Dynamic, Bucket::Api, Bucket::Gaming];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Api => "api",
            Self::Gaming => "gaming",
        }
    }

    /// Bucket owning `url`. Query strings and fragments are ignored.
    pub fn for_url(url: &str) -> Self {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url);
        let path = match path.find("://") {
            Some(scheme_end) => {
                let rest = &path[scheme_end + 3..];
                rest.find('/').map(|slash| &rest[slash..]).unwrap_or("/")
            }
            None => path,
        };
        if path == "/api" || path.starts_with("/api/") {
            Self::Api
        } else if GAMING_PATH.is_match(path) {
            Self::Gaming
        } else if STATIC_PATH.is_match(path) {
            Self::Static
        } else {
            Self::Dynamic
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored HTTP response. Header names are lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn footprint(&self, url: &str) -> u64 {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        (url.len() + headers + self.body.len()) as u64
    }

    fn from_entry(entry: &CacheEntry) -> Self {
        let kind = match entry.kind {
            ValueKind::Text => "text",
            ValueKind::Json => "json",
            ValueKind::Binary => "binary",
        };
        let mut response = Self::ok(entry.payload.clone())
            .with_header(H_STORED_AT, entry.stored_at.to_string())
            .with_header(H_PRIORITY, entry.priority.as_str())
            .with_header(H_KIND, kind)
            .with_header(H_SIZE, entry.size_bytes.to_string())
            .with_header(H_COMPRESSED, if entry.compressed { "1" } else { "0" });
        if let Some(ttl) = entry.ttl_ms {
            response = response.with_header(H_TTL, ttl.to_string());
        }
        if let Some(integrity) = &entry.integrity {
            response = response.with_header(H_INTEGRITY, integrity.clone());
        }
        response
    }

    fn to_entry(&self, key: &str) -> Result<CacheEntry, String> {
        let kind = match self.header(H_KIND) {
            Some("text") => ValueKind::Text,
            Some("json") => ValueKind::Json,
            Some("binary") | None => ValueKind::Binary,
            Some(other) => return Err(format!("unknown value kind `{other}`")),
        };
        let stored_at = self
            .header(H_STORED_AT)
            .map(str::parse::<i64>)
            .transpose()
            .map_err(|err| format!("bad {H_STORED_AT}: {err}"))?
            .unwrap_or(0);
        let ttl_ms = self
            .header(H_TTL)
            .map(str::parse::<u64>)
            .transpose()
            .map_err(|err| format!("bad {H_TTL}: {err}"))?;
        let priority = match self.header(H_PRIORITY) {
            Some("CRITICAL") => Priority::Critical,
            Some("HIGH") => Priority::High,
            Some("LOW") => Priority::Low,
            _ => Priority::Medium,
        };
        let size_bytes = self
            .header(H_SIZE)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(self.body.len() as u64);
        Ok(CacheEntry {
            key: key.to_string(),
            payload: self.body.clone(),
            kind,
            stored_at,
            ttl_ms,
            priority,
            size_bytes,
            integrity: self.header(H_INTEGRITY).map(str::to_string),
            compressed: self.header(H_COMPRESSED) == Some("1"),
        })
    }
}

/// Asynchronous URL-keyed response store.
pub struct ResponseStore {
    budget: BackendBudget,
    buckets: RwLock<HashMap<Bucket, HashMap<String, CachedResponse>>>,
}

impl ResponseStore {
    pub fn new(budget: BackendBudget) -> Self {
        Self {
            budget,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Store a response under `url` in the bucket the URL maps to.
    pub async fn put_response(
        &self,
        url: &str,
        response: CachedResponse,
    ) -> Result<Bucket, BackendError> {
        let bucket = Bucket::for_url(url);
        let mut buckets = self.buckets.write().await;
        let replaced = buckets
            .get(&bucket)
            .and_then(|responses| responses.get(url))
            .map(|old| old.footprint(url))
            .unwrap_or(0);
        let used = Self::used(&buckets).saturating_sub(replaced);
        let needed = response.footprint(url);
        if used + needed > self.budget.quota_bytes {
            return Err(BackendError::QuotaExceeded {
                backend: KIND,
                needed,
                available: self.budget.quota_bytes.saturating_sub(used),
            });
        }
        buckets
            .entry(bucket)
            .or_default()
            .insert(url.to_string(), response);
        Ok(bucket)
    }

    pub async fn match_response(&self, url: &str) -> Option<CachedResponse> {
        let bucket = Bucket::for_url(url);
        self.buckets
            .read()
            .await
            .get(&bucket)
            .and_then(|responses| responses.get(url))
            .cloned()
    }

    /// URLs currently held in `bucket`.
    pub async fn bucket_keys(&self, bucket: Bucket) -> Vec<String> {
        self.buckets
            .read()
            .await
            .get(&bucket)
            .map(|responses| responses.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a whole bucket. Returns how many responses it held.
    pub async fn delete_bucket(&self, bucket: Bucket) -> usize {
        let removed = self
            .buckets
            .write()
            .await
            .remove(&bucket)
            .map(|responses| responses.len())
            .unwrap_or(0);
        debug!(backend = %KIND, bucket = %bucket, removed, "bucket deleted");
        removed
    }

    fn used(buckets: &HashMap<Bucket, HashMap<String, CachedResponse>>) -> u64 {
        buckets
            .values()
            .flat_map(|responses| responses.iter())
            .map(|(url, response)| response.footprint(url))
            .sum()
    }
}

#[async_trait]
impl StorageBackend for ResponseStore {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_bytes_hint: self.budget.quota_bytes,
            is_async: true,
            persistent: true,
            supports_indices: false,
        }
    }

    fn warning_threshold(&self) -> u64 {
        self.budget.warning_threshold()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, BackendError> {
        match self.match_response(key).await {
            Some(response) => response
                .to_entry(key)
                .map(Some)
                .map_err(|message| BackendError::corrupt(KIND, message)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<(), BackendError> {
        self.put_response(key, CachedResponse::from_entry(&entry))
            .await
            .map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let bucket = Bucket::for_url(key);
        Ok(self
            .buckets
            .write()
            .await
            .get_mut(&bucket)
            .is_some_and(|responses| responses.remove(key).is_some()))
    }

    async fn keys(&self) -> Result<Vec<String>, BackendError> {
        Ok(self
            .buckets
            .read()
            .await
            .values()
            .flat_map(|responses| responses.keys().cloned())
            .collect())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.buckets.write().await.clear();
        Ok(())
    }

    async fn estimate_usage(&self) -> Result<Usage, BackendError> {
        Ok(Usage {
            used: Self::used(&*self.buckets.read().await),
            quota: self.budget.quota_bytes,
        })
    }

    async fn entries(&self) -> Result<Vec<EntryMeta>, BackendError> {
        let buckets = self.buckets.read().await;
        let mut metas = Vec::new();
        for (url, response) in buckets.values().flat_map(|responses| responses.iter()) {
            let footprint = response.footprint(url);
            let meta = match response.to_entry(url) {
                Ok(entry) => EntryMeta {
                    footprint,
                    ..entry.meta()
                },
                Err(_) => EntryMeta {
                    key: url.clone(),
                    stored_at: 0,
                    ttl_ms: Some(0),
                    priority: Priority::Low,
                    footprint,
                },
            };
            metas.push(meta);
        }
        Ok(metas)
    }
}
