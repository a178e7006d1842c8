//! Conditional-request negotiation: validator generation and precondition
//! evaluation.

use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, header};
use lru::LruCache;
use md5::{Digest as Md5Digest, Md5};
use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use super::config::{CacheConfig, EtagStrategy};
use super::headers::parse_http_date;
use super::integrity::Algorithm;
use super::lock;
use super::pubsub::{KEY_INVALIDATED, PubSub, SubscriptionId};

const SOURCE: &str = "cache::negotiate";
const STRONG_HEX_LEN: usize = 16;
const HYBRID_MD5_LEN: usize = 8;

const METRIC_NOT_MODIFIED: &str = "kessel_http_not_modified_total";
const METRIC_PRECONDITION_FAILED: &str = "kessel_http_precondition_failed_total";

/// An entity tag. `opaque` excludes the quotes and the `W/` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTag {
    pub weak: bool,
    pub opaque: String,
}

impl EntityTag {
    pub fn strong(opaque: impl Into<String>) -> Self {
        Self {
            weak: false,
            opaque: opaque.into(),
        }
    }

    pub fn weak(opaque: impl Into<String>) -> Self {
        Self {
            weak: true,
            opaque: opaque.into(),
        }
    }

    /// Parse one list member such as `"abc"` or `W/"abc"`. Unquoted values
    /// are accepted as-is.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (weak, rest) = match raw.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        let opaque = rest
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .unwrap_or(rest);
        Some(Self {
            weak,
            opaque: opaque.to_string(),
        })
    }

    /// Weak comparison: the `W/` marker is ignored.
    pub fn weak_eq(&self, other: &EntityTag) -> bool {
        self.opaque == other.opaque
    }

    /// Strong comparison: both tags must be strong and equal.
    pub fn strong_eq(&self, other: &EntityTag) -> bool {
        !self.weak && !other.weak && self.opaque == other.opaque
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weak {
            f.write_str("W/")?;
        }
        write!(f, "\"{}\"", self.opaque)
    }
}

/// Filesystem metadata of a file-backed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    pub modified: OffsetDateTime,
    pub size: u64,
}

impl FileMeta {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Option<Self> {
        let modified = metadata.modified().ok()?;
        Some(Self {
            modified: OffsetDateTime::from(modified),
            size: metadata.len(),
        })
    }

    fn modified_ms(&self) -> u128 {
        (self.modified.unix_timestamp_nanos() / 1_000_000).max(0) as u128
    }
}

/// Client precondition headers as received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
    pub if_match: Option<String>,
    pub if_unmodified_since: Option<String>,
}

impl Preconditions {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Self {
            if_none_match: get(header::IF_NONE_MATCH),
            if_modified_since: get(header::IF_MODIFIED_SINCE),
            if_match: get(header::IF_MATCH),
            if_unmodified_since: get(header::IF_UNMODIFIED_SINCE),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none()
            && self.if_modified_since.is_none()
            && self.if_match.is_none()
            && self.if_unmodified_since.is_none()
    }
}

/// Outcome of precondition evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send the full response.
    Proceed,
    /// 304 with an empty body.
    NotModified,
    /// 412 with an empty body.
    PreconditionFailed,
}

struct Memo {
    modified_ms: u128,
    size: u64,
    tag: EntityTag,
    created: Instant,
}

/// Generates validators and answers conditional requests.
///
/// Validators of file-backed responses are memoized by key, keyed further
/// by modification time and size so an edited file never reuses a stale tag.
pub struct Negotiator {
    strategy: EtagStrategy,
    algorithm: Algorithm,
    ttl: Duration,
    memo: Mutex<LruCache<String, Memo>>,
}

impl Negotiator {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            strategy: config.etag_strategy,
            algorithm: config.etag_algorithm,
            ttl: config.etag_cache_ttl(),
            memo: Mutex::new(LruCache::new(config.max_etag_cache_size_non_zero())),
        }
    }

    pub fn strategy(&self) -> EtagStrategy {
        self.strategy
    }

    /// Drop memoized validators whenever a key is invalidated.
    pub fn subscribe_to(self: &Arc<Self>, hub: &PubSub) -> SubscriptionId {
        let negotiator = Arc::downgrade(self);
        hub.subscribe(KEY_INVALIDATED, move |payload| {
            if let Some(negotiator) = negotiator.upgrade()
                && let Some(key) = payload.get("key").and_then(Value::as_str)
            {
                negotiator.forget(key);
            }
        })
    }

    /// Validator for `body` served under `key`.
    ///
    /// Weak and hybrid validators need file metadata; without it the strong
    /// digest is used.
    pub fn validator(&self, key: &str, body: &[u8], meta: Option<FileMeta>) -> EntityTag {
        let Some(meta) = meta else {
            return strong_tag(self.algorithm, body);
        };
        if let Some(tag) = self.memoized(key, &meta) {
            return tag;
        }
        let tag = match self.strategy {
            EtagStrategy::Strong => strong_tag(self.algorithm, body),
            EtagStrategy::Weak => weak_tag(&meta),
            EtagStrategy::Hybrid => hybrid_tag(body, &meta),
        };
        lock::lock(&self.memo, SOURCE, "validator").put(
            key.to_string(),
            Memo {
                modified_ms: meta.modified_ms(),
                size: meta.size,
                tag: tag.clone(),
                created: Instant::now(),
            },
        );
        tag
    }

    /// Strong validator over the canonical form of a JSON document, so
    /// documents differing only in key order share a tag.
    pub fn json_validator(&self, value: &Value) -> EntityTag {
        strong_tag(self.algorithm, canonical_json(value).as_bytes())
    }

    fn memoized(&self, key: &str, meta: &FileMeta) -> Option<EntityTag> {
        let mut memo = lock::lock(&self.memo, SOURCE, "memoized");
        let (expired, tag) = {
            let entry = memo.get(key)?;
            let fresh = entry.modified_ms == meta.modified_ms() && entry.size == meta.size;
            (
                entry.created.elapsed() > self.ttl,
                fresh.then(|| entry.tag.clone()),
            )
        };
        if expired {
            memo.pop(key);
            return None;
        }
        tag
    }

    pub fn forget(&self, key: &str) -> bool {
        lock::lock(&self.memo, SOURCE, "forget").pop(key).is_some()
    }

    pub fn memo_len(&self) -> usize {
        lock::lock(&self.memo, SOURCE, "memo_len").len()
    }

    /// Evaluate client preconditions against the current validators.
    ///
    /// `If-None-Match` is checked first and, when present, `If-Modified-Since`
    /// is ignored. Write preconditions are checked only when no 304 applies.
    pub fn evaluate(
        &self,
        preconditions: &Preconditions,
        etag: Option<&EntityTag>,
        last_modified: Option<OffsetDateTime>,
    ) -> Decision {
        let decision = decide(preconditions, etag, last_modified);
        match decision {
            Decision::NotModified => counter!(METRIC_NOT_MODIFIED).increment(1),
            Decision::PreconditionFailed => counter!(METRIC_PRECONDITION_FAILED).increment(1),
            Decision::Proceed => {}
        }
        if decision != Decision::Proceed {
            debug!(?decision, etag = ?etag.map(ToString::to_string), "conditional request answered");
        }
        decision
    }
}

fn decide(
    preconditions: &Preconditions,
    etag: Option<&EntityTag>,
    last_modified: Option<OffsetDateTime>,
) -> Decision {
    let last_modified = last_modified.map(truncate_to_seconds);

    if let Some(list) = preconditions.if_none_match.as_deref() {
        if list_matches(list, etag, true, EntityTag::weak_eq) {
            return Decision::NotModified;
        }
    } else if let Some(since) = preconditions.if_modified_since.as_deref()
        && let Some(modified) = last_modified
        && let Some(since) = parse_http_date(since)
        && modified <= since
    {
        return Decision::NotModified;
    }

    if let Some(list) = preconditions.if_match.as_deref()
        && !list_matches(list, etag, etag.is_some(), EntityTag::strong_eq)
    {
        return Decision::PreconditionFailed;
    }

    if let Some(since) = preconditions.if_unmodified_since.as_deref()
        && let Some(modified) = last_modified
        && let Some(since) = parse_http_date(since)
        && modified > since
    {
        return Decision::PreconditionFailed;
    }

    Decision::Proceed
}

/// `*` matches whenever the representation `exists`.
fn list_matches(
    list: &str,
    current: Option<&EntityTag>,
    exists: bool,
    eq: fn(&EntityTag, &EntityTag) -> bool,
) -> bool {
    if list.trim() == "*" {
        return exists;
    }
    let Some(current) = current else {
        return false;
    };
    list.split(',')
        .filter_map(EntityTag::parse)
        .any(|candidate| eq(&candidate, current))
}

fn truncate_to_seconds(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_nanosecond(0).unwrap_or(at)
}

pub fn strong_tag(algorithm: Algorithm, body: &[u8]) -> EntityTag {
    let digest = algorithm.hex_digest(body);
    EntityTag::strong(&digest[..STRONG_HEX_LEN])
}

pub fn weak_tag(meta: &FileMeta) -> EntityTag {
    EntityTag::weak(format!("{:x}-{:x}", meta.modified_ms(), meta.size))
}

pub fn hybrid_tag(body: &[u8], meta: &FileMeta) -> EntityTag {
    let digest = hex::encode(Md5::digest(body).as_slice());
    EntityTag::strong(format!(
        "{}-{:x}",
        &digest[..HYBRID_MD5_LEN],
        meta.modified_ms()
    ))
}

/// Serialize with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(text) => write_string(text, out),
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_string(text: &str, out: &mut String) {
    let _ = write!(out, "{}", Value::String(text.to_string()));
}
