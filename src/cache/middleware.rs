//! Response decorator middleware.
//!
//! Stamps cache policy, security, validator and integrity headers on GET and
//! HEAD responses and answers conditional requests with 304 or 412. A failure
//! to decorate degrades to fewer headers; the handler's response is never
//! replaced by an error of our own.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header, response::Parts},
    middleware::Next,
    response::Response,
};
use tokio::task;
use tracing::{debug, instrument, warn};

use super::{
    config::{CacheConfig, CspMode},
    headers::{ContentSecurityPolicy, X_CONTENT_INTEGRITY, http_date, security_headers},
    negotiate::{Decision, EntityTag, FileMeta, Negotiator, Preconditions},
    policy::{AssetTag, Policy, PolicyTable},
};

/// Bodies above this are passed through without validators.
pub const MAX_DECORATED_BODY: usize = 8 * 1024 * 1024;

const NON_IDEMPOTENT_CACHE_CONTROL: &str = "no-cache, no-store, must-revalidate";

/// Response extension set by file-serving handlers so the decorator can
/// stamp `Last-Modified` and use metadata-based validators.
#[derive(Debug, Clone, Copy)]
pub struct FileSource(pub FileMeta);

/// Shared state for the decorator.
#[derive(Clone)]
pub struct DecoratorState {
    pub config: Arc<CacheConfig>,
    pub policies: Arc<PolicyTable>,
    pub negotiator: Arc<Negotiator>,
    pub csp: Arc<ContentSecurityPolicy>,
}

impl DecoratorState {
    pub fn new(
        config: Arc<CacheConfig>,
        policies: Arc<PolicyTable>,
        negotiator: Arc<Negotiator>,
    ) -> Self {
        Self {
            config,
            policies,
            negotiator,
            csp: Arc::new(ContentSecurityPolicy::standard()),
        }
    }

    pub fn with_csp(mut self, csp: ContentSecurityPolicy) -> Self {
        self.csp = Arc::new(csp);
        self
    }
}

/// Middleware entry point; install with `axum::middleware::from_fn_with_state`.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn decorate_responses(
    State(state): State<DecoratorState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    if method != Method::GET && method != Method::HEAD {
        let mut response = next.run(request).await;
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(NON_IDEMPOTENT_CACHE_CONTROL),
        );
        return response;
    }

    let path = request.uri().path().to_string();
    let preconditions = Preconditions::from_headers(request.headers());
    let response = next.run(request).await;
    decorate(&state, &path, &preconditions, response).await
}

async fn decorate(
    state: &DecoratorState,
    path: &str,
    preconditions: &Preconditions,
    response: Response,
) -> Response {
    let (tag, policy) = state.policies.resolve(path);
    let file = response.extensions().get::<FileSource>().map(|source| source.0);
    let (mut parts, body) = response.into_parts();

    stamp_security(&mut parts.headers, tag, state);
    if !parts.status.is_success() {
        return Response::from_parts(parts, body);
    }
    stamp_policy(&mut parts.headers, policy, &state.config);

    let fits = body
        .size_hint()
        .upper()
        .is_some_and(|upper| upper <= MAX_DECORATED_BODY as u64);
    if !fits {
        debug!(%tag, "body too large or unsized; skipping validators");
        return Response::from_parts(parts, body);
    }

    let mut bytes = match axum::body::to_bytes(body, MAX_DECORATED_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%tag, error = %err, "failed to buffer response body; skipping validators");
            parts.headers.remove(header::CONTENT_LENGTH);
            return Response::from_parts(parts, Body::empty());
        }
    };

    if tag == AssetTag::Html
        && state.config.csp_mode == CspMode::Meta
        && let Ok(html) = std::str::from_utf8(&bytes)
        && let Some(injected) = state.csp.inject_meta(html)
    {
        bytes = Bytes::from(injected);
        parts.headers.remove(header::CONTENT_LENGTH);
    }

    let etag = state
        .config
        .enable_etag
        .then(|| validator(state, path, tag, &parts.headers, &bytes, file));
    if let Some(etag) = &etag {
        insert(&mut parts.headers, header::ETAG, etag.to_string());
    }

    let last_modified = file
        .filter(|_| state.config.enable_last_modified)
        .map(|meta| meta.modified);
    if let Some(modified) = last_modified {
        insert(&mut parts.headers, header::LAST_MODIFIED, http_date(modified));
    }

    if state.config.enable_sri && policy.require_integrity {
        match integrity_header(&bytes, &state.config).await {
            Some(value) => insert(&mut parts.headers, X_CONTENT_INTEGRITY, value),
            None => warn!(%tag, "integrity digest failed; header omitted"),
        }
    }

    match state
        .negotiator
        .evaluate(preconditions, etag.as_ref(), last_modified)
    {
        Decision::Proceed => Response::from_parts(parts, Body::from(bytes)),
        Decision::NotModified => empty(parts, StatusCode::NOT_MODIFIED),
        Decision::PreconditionFailed => empty(parts, StatusCode::PRECONDITION_FAILED),
    }
}

fn stamp_security(headers: &mut HeaderMap, tag: AssetTag, state: &DecoratorState) {
    for (name, value) in security_headers(tag) {
        headers.insert(name, HeaderValue::from_static(value));
    }
    if tag == AssetTag::Html
        && let Some((name, value)) = state.csp.header(state.config.csp_mode)
    {
        insert(headers, name, value);
    }
}

fn stamp_policy(headers: &mut HeaderMap, policy: &Policy, config: &CacheConfig) {
    insert(headers, header::CACHE_CONTROL, policy.cache_control());
    if config.enable_vary
        && let Some(vary) = policy.vary_header()
    {
        insert(headers, header::VARY, vary);
    }
}

fn validator(
    state: &DecoratorState,
    path: &str,
    tag: AssetTag,
    headers: &HeaderMap,
    body: &[u8],
    file: Option<FileMeta>,
) -> EntityTag {
    if file.is_none()
        && is_json(tag, headers)
        && let Ok(document) = serde_json::from_slice::<serde_json::Value>(body)
    {
        return state.negotiator.json_validator(&document);
    }
    state.negotiator.validator(path, body, file)
}

fn is_json(tag: AssetTag, headers: &HeaderMap) -> bool {
    let declared = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));
    declared || matches!(tag, AssetTag::ApiResponse | AssetTag::Json)
}

async fn integrity_header(body: &Bytes, config: &CacheConfig) -> Option<String> {
    let algorithm = config.integrity_algorithm;
    if body.len() < config.compression_threshold_bytes {
        return Some(algorithm.sri(body));
    }
    let owned = body.clone();
    task::spawn_blocking(move || algorithm.sri(&owned))
        .await
        .ok()
}

fn empty(mut parts: Parts, status: StatusCode) -> Response {
    parts.status = status;
    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.remove(header::CONTENT_TYPE);
    Response::from_parts(parts, Body::empty())
}

fn insert<K>(headers: &mut HeaderMap, name: K, value: String)
where
    K: axum::http::header::IntoHeaderName,
{
    match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(err) => warn!(error = %err, "dropping header with invalid value"),
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, routing::get};
    use http_body_util::{Full, Limited};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    fn state(config: CacheConfig) -> DecoratorState {
        let config = Arc::new(config);
        DecoratorState::new(
            Arc::clone(&config),
            Arc::new(PolicyTable::standard()),
            Arc::new(Negotiator::new(&config)),
        )
    }

    fn app(state: DecoratorState) -> Router {
        Router::new()
            .route("/static/app.abc12345.js", get(|| async { "console.log('kessel')" }))
            .route("/index.html", get(|| async {
                axum::response::Html("<html><head><title>k</title></head><body></body></html>")
            }))
            .route("/api/clans", get(|| async { Json(json!({ "b": 2, "a": 1 })) }).post(|| async { "ok" }))
            .route("/missing.js", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/static/broken.abc12345.js",
                get(|| async {
                    // Claims four bytes, then fails on the ten it actually holds.
                    let body = Limited::new(Full::new(Bytes::from_static(b"0123456789")), 4);
                    (StatusCode::ACCEPTED, Body::new(body))
                }),
            )
            .layer(axum::middleware::from_fn_with_state(state, decorate_responses))
    }

    async fn send(app: &Router, method: Method, uri: &str, headers: &[(&str, &str)]) -> Response {
        let mut request = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        app.clone()
            .oneshot(request.body(Body::empty()).expect("request"))
            .await
            .expect("response")
    }

    fn header_of<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|value| value.to_str().ok())
    }

    #[tokio::test]
    async fn static_asset_is_stamped_and_revalidates() {
        let app = app(state(CacheConfig::default()));
        let response = send(&app, Method::GET, "/static/app.abc12345.js", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_of(&response, "cache-control"),
            Some("public, max-age=31536000, immutable")
        );
        assert!(header_of(&response, "x-content-integrity").is_some_and(|v| v.starts_with("sha384-")));
        assert_eq!(header_of(&response, "x-content-type-options"), Some("nosniff"));
        let etag = header_of(&response, "etag").expect("etag").to_string();
        assert_eq!(etag.len(), 18);

        let revalidated = send(&app, Method::GET, "/static/app.abc12345.js", &[("if-none-match", &etag)]).await;
        assert_eq!(revalidated.status(), StatusCode::NOT_MODIFIED);
        let body = axum::body::to_bytes(revalidated.into_body(), 1024).await.expect("body");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn non_idempotent_methods_are_never_cached() {
        let app = app(state(CacheConfig::default()));
        let response = send(&app, Method::POST, "/api/clans", &[]).await;
        assert_eq!(
            header_of(&response, "cache-control"),
            Some("no-cache, no-store, must-revalidate")
        );
        assert!(header_of(&response, "etag").is_none());
    }

    #[tokio::test]
    async fn html_gets_frame_options_and_csp() {
        let app = app(state(CacheConfig::default()));
        let response = send(&app, Method::GET, "/index.html", &[]).await;
        assert_eq!(header_of(&response, "x-frame-options"), Some("SAMEORIGIN"));
        assert!(header_of(&response, "content-security-policy").is_some_and(|v| v.starts_with("default-src 'self'")));

        let meta = app_with_meta().await;
        let body = axum::body::to_bytes(meta.into_body(), 4096).await.expect("body");
        let html = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(html.contains("<head><meta http-equiv=\"Content-Security-Policy\""));
    }

    async fn app_with_meta() -> Response {
        let app = app(state(CacheConfig {
            csp_mode: CspMode::Meta,
            ..CacheConfig::default()
        }));
        let response = send(&app, Method::GET, "/index.html", &[]).await;
        assert!(header_of(&response, "content-security-policy").is_none());
        response
    }

    #[tokio::test]
    async fn if_match_mismatch_is_412() {
        let app = app(state(CacheConfig::default()));
        let response = send(&app, Method::GET, "/api/clans", &[("if-match", "\"nope\"")]).await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn error_responses_only_get_security_headers() {
        let app = app(state(CacheConfig::default()));
        let response = send(&app, Method::GET, "/missing.js", &[]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(header_of(&response, "cache-control").is_none());
        assert_eq!(header_of(&response, "x-content-type-options"), Some("nosniff"));
    }

    #[tokio::test]
    async fn unreadable_body_keeps_the_handler_status() {
        let app = app(state(CacheConfig::default()));
        let response = send(&app, Method::GET, "/static/broken.abc12345.js", &[]).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            header_of(&response, "cache-control"),
            Some("public, max-age=31536000, immutable")
        );
        assert!(header_of(&response, "etag").is_none());
        assert!(header_of(&response, "x-content-integrity").is_none());
        let body = axum::body::to_bytes(response.into_body(), 1024).await.expect("body");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn disabled_features_drop_their_headers() {
        let app = app(state(CacheConfig {
            enable_etag: false,
            enable_sri: false,
            enable_vary: false,
            ..CacheConfig::default()
        }));
        let response = send(&app, Method::GET, "/static/app.abc12345.js", &[]).await;
        assert!(header_of(&response, "etag").is_none());
        assert!(header_of(&response, "x-content-integrity").is_none());
        assert!(header_of(&response, "vary").is_none());
        assert!(header_of(&response, "cache-control").is_some());
    }
}
