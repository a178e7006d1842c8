//! Asset classification and per-tag cache policies.
//!
//! Classification walks [`CLASSIFICATION_RULES`] top to bottom and stops at the
//! first match. The order is load-bearing: a service worker is also a script
//! and a critical bundle is also a stylesheet.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const YEAR: u64 = 365 * DAY;

/// Enumerated classification of a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetTag {
    StaticAsset,
    Html,
    ApiResponse,
    Dynamic,
    ServiceWorker,
    Font,
    Image,
    CriticalResource,
    Media,
    Json,
}

impl AssetTag {
    pub const ALL: [AssetTag; 10] = [
        AssetTag::StaticAsset,
        AssetTag::Html,
        AssetTag::ApiResponse,
        AssetTag::Dynamic,
        AssetTag::ServiceWorker,
        AssetTag::Font,
        AssetTag::Image,
        AssetTag::CriticalResource,
        AssetTag::Media,
        AssetTag::Json,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaticAsset => "STATIC_ASSET",
            Self::Html => "HTML",
            Self::ApiResponse => "API_RESPONSE",
            Self::Dynamic => "DYNAMIC",
            Self::ServiceWorker => "SERVICE_WORKER",
            Self::Font => "FONT",
            Self::Image => "IMAGE",
            Self::CriticalResource => "CRITICAL_RESOURCE",
            Self::Media => "MEDIA",
            Self::Json => "JSON",
        }
    }

    /// Parse a tag name; unknown names fall back to `DYNAMIC`.
    pub fn parse_lossy(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(name))
            .unwrap_or(Self::Dynamic)
    }
}

impl fmt::Display for AssetTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request header a cached representation varies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum VaryAxis {
    AcceptEncoding,
    Accept,
    Origin,
}

impl VaryAxis {
    pub fn header_name(self) -> &'static str {
        match self {
            Self::AcceptEncoding => "Accept-Encoding",
            Self::Accept => "Accept",
            Self::Origin => "Origin",
        }
    }
}

/// Cache directives for one asset tag. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Policy {
    /// `max-age` in seconds.
    pub max_age: u64,
    pub s_max_age: Option<u64>,
    pub immutable: bool,
    pub public_cacheable: bool,
    pub must_revalidate: bool,
    pub stale_while_revalidate: Option<u64>,
    pub no_cache: bool,
    pub no_store: bool,
    pub compressible: bool,
    pub vary_axes: BTreeSet<VaryAxis>,
    pub require_integrity: bool,
}

impl Policy {
    /// Render the `Cache-Control` value with only the enabled directives.
    ///
    /// `stale-while-revalidate` is dropped for immutable policies: an
    /// immutable response is never stale within its lifetime.
    pub fn cache_control(&self) -> String {
        let mut directives: Vec<String> = Vec::with_capacity(6);
        directives.push(if self.public_cacheable { "public" } else { "private" }.to_string());
        if self.no_store {
            directives.push("no-store".to_string());
        }
        if self.no_cache {
            directives.push("no-cache".to_string());
        }
        directives.push(format!("max-age={}", self.max_age));
        if let Some(shared) = self.s_max_age {
            directives.push(format!("s-maxage={shared}"));
        }
        if self.must_revalidate {
            directives.push("must-revalidate".to_string());
        }
        if self.immutable {
            directives.push("immutable".to_string());
        } else if let Some(swr) = self.stale_while_revalidate {
            directives.push(format!("stale-while-revalidate={swr}"));
        }
        directives.join(", ")
    }

    /// Comma-separated `Vary` value, or `None` when the policy varies on nothing.
    pub fn vary_header(&self) -> Option<String> {
        if self.vary_axes.is_empty() {
            return None;
        }
        Some(
            self.vary_axes
                .iter()
                .map(|axis| axis.header_name())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    /// `max-age` as milliseconds, handy as a TTL for stored copies.
    pub fn max_age_ms(&self) -> u64 {
        self.max_age.saturating_mul(1000)
    }
}

/// One entry of the ordered classification list.
pub struct ClassificationRule {
    pub tag: AssetTag,
    pub pattern: &'static str,
    regex: Lazy<Regex>,
}

macro_rules! rule {
    ($tag:expr, $pattern:literal) => {
        ClassificationRule {
            tag: $tag,
            pattern: $pattern,
            regex: Lazy::new(|| Regex::new($pattern).expect("classification pattern is valid")),
        }
    };
}

/// Ordered rule list. First match wins; no match yields `DYNAMIC`.
pub static CLASSIFICATION_RULES: [ClassificationRule; 9] = [
    rule!(
        AssetTag::ServiceWorker,
        r"(?i)(^|/)(sw|service-worker|workbox-[0-9a-f]+)\.js$"
    ),
    rule!(AssetTag::ApiResponse, r"^/api(/|$)"),
    rule!(AssetTag::Font, r"(?i)\.(woff2?|ttf|otf|eot)$"),
    rule!(AssetTag::Image, r"(?i)\.(png|jpe?g|gif|webp|avif|svg|ico)$"),
    rule!(
        AssetTag::CriticalResource,
        r"(?i)/(critical|app-shell|runtime|vendor)\.[0-9a-f]{8,}\.(js|css)$"
    ),
    rule!(AssetTag::StaticAsset, r"(?i)\.(m?js|css|map)$"),
    rule!(AssetTag::Html, r"(?i)(\.html?$|/$)"),
    rule!(AssetTag::Media, r"(?i)\.(mp4|webm|mp3|ogg|wav|m4a)$"),
    rule!(AssetTag::Json, r"(?i)\.json$"),
];

/// Static registry mapping asset tags to policies.
pub struct PolicyTable {
    policies: HashMap<AssetTag, Policy>,
}

impl PolicyTable {
    /// The standard policy set.
    pub fn standard() -> Self {
        let mut policies = HashMap::with_capacity(AssetTag::ALL.len());
        for tag in AssetTag::ALL {
            policies.insert(tag, standard_policy(tag));
        }
        Self { policies }
    }

    /// Classify a URL or path. Total: every input receives a tag.
    pub fn classify(&self, url: &str) -> AssetTag {
        classify(url)
    }

    /// Policy for a tag. Unknown tags resolve to the `DYNAMIC` policy.
    pub fn policy_for(&self, tag: AssetTag) -> &Policy {
        self.policies
            .get(&tag)
            .or_else(|| self.policies.get(&AssetTag::Dynamic))
            .unwrap_or(&FALLBACK_POLICY)
    }

    /// Classify and look up in one step.
    pub fn resolve(&self, url: &str) -> (AssetTag, &Policy) {
        let tag = self.classify(url);
        (tag, self.policy_for(tag))
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}

static FALLBACK_POLICY: Lazy<Policy> = Lazy::new(|| standard_policy(AssetTag::Dynamic));

/// Classify a URL or path against [`CLASSIFICATION_RULES`].
pub fn classify(url: &str) -> AssetTag {
    let path = strip_to_path(url);
    CLASSIFICATION_RULES
        .iter()
        .find(|rule| rule.regex.is_match(path))
        .map(|rule| rule.tag)
        .unwrap_or(AssetTag::Dynamic)
}

/// Drop scheme, authority, query and fragment so rules only see the path.
fn strip_to_path(url: &str) -> &str {
    let without_scheme = match url.find("://") {
        Some(index) => {
            let rest = &url[index + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => url,
    };
    let end = without_scheme
        .find(['?', '#'])
        .unwrap_or(without_scheme.len());
    &without_scheme[..end]
}

fn vary(axes: &[VaryAxis]) -> BTreeSet<VaryAxis> {
    axes.iter().copied().collect()
}

fn standard_policy(tag: AssetTag) -> Policy {
    use VaryAxis::{Accept, AcceptEncoding, Origin};

    let base = Policy {
        max_age: 0,
        s_max_age: None,
        immutable: false,
        public_cacheable: true,
        must_revalidate: false,
        stale_while_revalidate: None,
        no_cache: false,
        no_store: false,
        compressible: true,
        vary_axes: vary(&[AcceptEncoding]),
        require_integrity: false,
    };

    match tag {
        AssetTag::StaticAsset => Policy {
            max_age: YEAR,
            immutable: true,
            stale_while_revalidate: Some(DAY),
            require_integrity: true,
            ..base
        },
        AssetTag::Html => Policy {
            max_age: 5 * MINUTE,
            must_revalidate: true,
            ..base
        },
        AssetTag::ApiResponse => Policy {
            max_age: 15 * MINUTE,
            public_cacheable: false,
            must_revalidate: true,
            stale_while_revalidate: Some(5 * MINUTE),
            vary_axes: vary(&[AcceptEncoding, Accept, Origin]),
            ..base
        },
        AssetTag::ServiceWorker => Policy {
            max_age: 0,
            must_revalidate: true,
            ..base
        },
        AssetTag::Font => Policy {
            max_age: YEAR,
            immutable: true,
            compressible: false,
            vary_axes: vary(&[Origin]),
            ..base
        },
        AssetTag::Image => Policy {
            max_age: 30 * DAY,
            stale_while_revalidate: Some(DAY),
            compressible: false,
            vary_axes: vary(&[]),
            ..base
        },
        AssetTag::CriticalResource => Policy {
            max_age: HOUR,
            must_revalidate: true,
            stale_while_revalidate: Some(30 * MINUTE),
            require_integrity: true,
            ..base
        },
        AssetTag::Media => Policy {
            max_age: 7 * DAY,
            compressible: false,
            vary_axes: vary(&[]),
            ..base
        },
        AssetTag::Json => Policy {
            max_age: HOUR,
            must_revalidate: true,
            ..base
        },
        AssetTag::Dynamic => Policy {
            max_age: 0,
            public_cacheable: false,
            no_cache: true,
            must_revalidate: true,
            vary_axes: vary(&[AcceptEncoding, Accept]),
            ..base
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_worker_wins_over_generic_script() {
        assert_eq!(classify("/sw.js"), AssetTag::ServiceWorker);
        assert_eq!(classify("/static/service-worker.js"), AssetTag::ServiceWorker);
        assert_eq!(classify("/static/app.js"), AssetTag::StaticAsset);
    }

    #[test]
    fn critical_bundle_wins_over_generic_style() {
        assert_eq!(
            classify("/static/critical.0a1b2c3d.css"),
            AssetTag::CriticalResource
        );
        assert_eq!(classify("/static/app.abc12345.js"), AssetTag::StaticAsset);
    }

    #[test]
    fn api_prefix_wins_over_extension() {
        assert_eq!(classify("/api/clans"), AssetTag::ApiResponse);
        assert_eq!(classify("/api/export.json"), AssetTag::ApiResponse);
        assert_eq!(classify("/data/export.json"), AssetTag::Json);
    }

    #[test]
    fn classification_ignores_query_and_origin() {
        assert_eq!(
            classify("https://cdn.example.com/fonts/inter.woff2?v=3"),
            AssetTag::Font
        );
        assert_eq!(classify("/img/logo.PNG#frag"), AssetTag::Image);
        assert_eq!(classify("https://example.com"), AssetTag::Html);
    }

    #[test]
    fn classifier_is_total() {
        for input in ["", "?", "#", "no-slash", "/profile/42", "://", "💥"] {
            let tag = classify(input);
            assert!(AssetTag::ALL.contains(&tag), "{input:?} -> {tag:?}");
        }
        assert_eq!(classify("/profile/42"), AssetTag::Dynamic);
    }

    #[test]
    fn rules_keep_documented_order() {
        let order: Vec<_> = CLASSIFICATION_RULES.iter().map(|rule| rule.tag).collect();
        assert_eq!(
            &order[..7],
            &[
                AssetTag::ServiceWorker,
                AssetTag::ApiResponse,
                AssetTag::Font,
                AssetTag::Image,
                AssetTag::CriticalResource,
                AssetTag::StaticAsset,
                AssetTag::Html,
            ]
        );
    }

    #[test]
    fn static_asset_cache_control() {
        let table = PolicyTable::standard();
        let policy = table.policy_for(AssetTag::StaticAsset);
        insta::assert_snapshot!(policy.cache_control(), @"public, max-age=31536000, immutable");
        assert!(policy.require_integrity);
    }

    #[test]
    fn api_cache_control_and_vary() {
        let table = PolicyTable::standard();
        let policy = table.policy_for(AssetTag::ApiResponse);
        insta::assert_snapshot!(
            policy.cache_control(),
            @"private, max-age=900, must-revalidate, stale-while-revalidate=300"
        );
        assert_eq!(
            policy.vary_header().as_deref(),
            Some("Accept-Encoding, Accept, Origin")
        );
    }

    #[test]
    fn service_worker_is_never_fresh() {
        let table = PolicyTable::standard();
        insta::assert_snapshot!(
            table.policy_for(AssetTag::ServiceWorker).cache_control(),
            @"public, max-age=0, must-revalidate"
        );
    }

    #[test]
    fn dynamic_policy_disables_caching() {
        let table = PolicyTable::standard();
        insta::assert_snapshot!(
            table.policy_for(AssetTag::Dynamic).cache_control(),
            @"private, no-cache, max-age=0, must-revalidate"
        );
    }

    #[test]
    fn unknown_tag_name_falls_back_to_dynamic() {
        assert_eq!(AssetTag::parse_lossy("NOPE"), AssetTag::Dynamic);
        assert_eq!(AssetTag::parse_lossy("font"), AssetTag::Font);
    }

    #[test]
    fn image_policy_matches_table() {
        let table = PolicyTable::standard();
        let policy = table.policy_for(AssetTag::Image);
        assert_eq!(policy.max_age, 30 * DAY);
        assert_eq!(policy.stale_while_revalidate, Some(DAY));
        assert!(!policy.immutable);
        assert!(policy.vary_header().is_none());
    }
}
