use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
    response::Response,
};
use bytes::Bytes;
use kessel::cache::{
    CacheConfig, CacheSystem, CspMode, RetrieveOptions, StoreOptions,
    warming::{FetchError, Fetcher},
};
use kessel::infra::http::{HttpState, build_router};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

struct StubFetcher;

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        Ok(Bytes::from(format!("/* {url} */")))
    }
}

struct Harness {
    _root: TempDir,
    system: Arc<CacheSystem>,
    app: Router,
}

fn write_asset(root: &Path, relative: &str, body: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create asset dir");
    }
    std::fs::write(path, body).expect("write asset");
}

fn harness_with(config: CacheConfig) -> Harness {
    let root = tempfile::tempdir().expect("tempdir");
    write_asset(root.path(), "static/app.abc12345.js", "console.log('kessel');");
    write_asset(
        root.path(),
        "index.html",
        "<html><head><title>kessel</title></head><body>home</body></html>",
    );
    write_asset(root.path(), "sw.js", "self.addEventListener('fetch', () => {});");

    let system = Arc::new(CacheSystem::builder(config, Arc::new(StubFetcher)).build());
    let app = build_router(HttpState::new(Arc::clone(&system), root.path()));
    Harness {
        _root: root,
        system,
        app,
    }
}

fn harness() -> Harness {
    harness_with(CacheConfig::default())
}

async fn send(app: &Router, method: Method, uri: &str, headers: &[(&str, &str)], body: Body) -> Response {
    let mut request = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    app.clone()
        .oneshot(request.body(body).expect("request"))
        .await
        .expect("response")
}

async fn get(app: &Router, uri: &str, headers: &[(&str, &str)]) -> Response {
    send(app, Method::GET, uri, headers, Body::empty()).await
}

fn header_of<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|value| value.to_str().ok())
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn hashed_static_asset_is_immutable_and_revalidates() {
    let h = harness();

    let response = get(&h.app, "/static/app.abc12345.js", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_of(&response, "cache-control"),
        Some("public, max-age=31536000, immutable")
    );
    assert!(header_of(&response, "x-content-integrity").is_some_and(|v| v.starts_with("sha384-")));
    assert!(header_of(&response, "last-modified").is_some());
    assert_eq!(header_of(&response, "x-content-type-options"), Some("nosniff"));
    let etag = header_of(&response, "etag").expect("etag").to_string();

    let revalidated = get(&h.app, "/static/app.abc12345.js", &[("if-none-match", &etag)]).await;
    assert_eq!(revalidated.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header_of(&revalidated, "etag"), Some(etag.as_str()));
    let body = to_bytes(revalidated.into_body(), 1024).await.expect("body");
    assert!(body.is_empty());
}

#[tokio::test]
async fn directory_requests_serve_index_with_csp() {
    let h = harness();
    let response = get(&h.app, "/", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_of(&response, "x-frame-options"), Some("SAMEORIGIN"));
    assert!(header_of(&response, "content-security-policy").is_some());
    let body = to_bytes(response.into_body(), 1024).await.expect("body");
    assert!(String::from_utf8_lossy(&body).contains("home"));
}

#[tokio::test]
async fn meta_csp_mode_injects_into_documents() {
    let config = CacheConfig {
        csp_mode: CspMode::Meta,
        ..CacheConfig::default()
    };
    let h = harness_with(config);
    let response = get(&h.app, "/index.html", &[]).await;
    assert!(header_of(&response, "content-security-policy").is_none());
    let body = to_bytes(response.into_body(), 4096).await.expect("body");
    assert!(String::from_utf8_lossy(&body).contains("http-equiv=\"Content-Security-Policy\""));
}

#[tokio::test]
async fn service_worker_script_is_never_fresh() {
    let h = harness();
    let response = get(&h.app, "/sw.js", &[]).await;
    assert_eq!(
        header_of(&response, "cache-control"),
        Some("public, max-age=0, must-revalidate")
    );
}

#[tokio::test]
async fn missing_and_escaping_paths_are_not_found() {
    let h = harness();
    for uri in ["/nope.js", "/static/../../etc/passwd"] {
        let response = get(&h.app, uri, &[]).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        assert!(header_of(&response, "cache-control").is_none());
        assert_eq!(header_of(&response, "x-content-type-options"), Some("nosniff"));
    }
}

#[tokio::test]
async fn api_validator_ignores_query_order() {
    let h = harness();
    let first = get(&h.app, "/api/clans/9?page=1&sort=rank", &[]).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        header_of(&first, "cache-control"),
        Some("private, max-age=900, must-revalidate, stale-while-revalidate=300")
    );
    assert_eq!(header_of(&first, "vary"), Some("Accept-Encoding, Accept, Origin"));
    let etag = header_of(&first, "etag").expect("etag").to_string();

    let second = get(&h.app, "/api/clans/9?sort=rank&page=1", &[]).await;
    assert_eq!(header_of(&second, "etag"), Some(etag.as_str()));

    let conditional = get(&h.app, "/api/clans/9?page=1&sort=rank", &[("if-none-match", &etag)]).await;
    assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn if_match_mismatch_is_precondition_failed() {
    let h = harness();
    let response = get(&h.app, "/static/app.abc12345.js", &[("if-match", "\"0000000000000000\"")]).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    let any = get(&h.app, "/static/app.abc12345.js", &[("if-match", "*")]).await;
    assert_eq!(any.status(), StatusCode::OK);
}

#[tokio::test]
async fn if_match_wildcard_needs_a_current_validator() {
    let h = harness_with(CacheConfig {
        enable_etag: false,
        ..CacheConfig::default()
    });
    let response = get(&h.app, "/static/app.abc12345.js", &[("if-match", "*")]).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    assert!(header_of(&response, "etag").is_none());
}

#[tokio::test]
async fn version_endpoint_queues_asset_keys() {
    let h = harness();
    h.system
        .manager()
        .store("static:app.js", "console.log(1)", StoreOptions::default())
        .await
        .expect("store");
    let response = send(&h.app, Method::POST, "/_cache/version/2.0.0", &[], Body::empty()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["version"], "2.0.0");
    assert_eq!(body["queued"], 1);
}

#[tokio::test]
async fn logout_event_endpoint_clears_user_data() {
    let h = harness();
    let manager = h.system.manager();
    for key in ["user:42:profile", "session:abc", "clan:9:members"] {
        manager
            .store(key, json!({ "key": key }), StoreOptions::default())
            .await
            .expect("store");
    }

    let response = send(
        &h.app,
        Method::POST,
        "/_cache/events/USER_LOGOUT",
        &[("content-type", "application/json")],
        Body::from(r#"{"userId":42}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["event"], "USER_LOGOUT");
    assert_eq!(body["queued"], 2);

    h.system.bus().drain().await;
    for key in ["user:42:profile", "session:abc"] {
        let value = manager.retrieve(key, RetrieveOptions::default()).await.expect("retrieve");
        assert!(value.is_none(), "{key} should be gone");
    }
    let clan = manager
        .retrieve("clan:9:members", RetrieveOptions::default())
        .await
        .expect("retrieve");
    assert!(clan.is_some());
}

#[tokio::test]
async fn unknown_events_and_bad_payloads_are_rejected() {
    let h = harness();
    let unknown = send(&h.app, Method::POST, "/_cache/events/NOT_A_THING", &[], Body::empty()).await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(unknown).await["error"], "UNKNOWN_EVENT");

    let garbled = send(
        &h.app,
        Method::POST,
        "/_cache/events/USER_LOGOUT",
        &[],
        Body::from("{not json"),
    )
    .await;
    assert_eq!(garbled.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(garbled).await["error"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn stats_endpoint_reports_every_section() {
    let h = harness();
    h.system
        .manager()
        .store("clan:1", "members", StoreOptions::default())
        .await
        .expect("store");
    h.system
        .manager()
        .retrieve("clan:1", RetrieveOptions::default())
        .await
        .expect("retrieve");

    let response = get(&h.app, "/_cache/stats", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_of(&response, "cache-control"), Some("no-store"));
    let body = json_body(response).await;
    for section in ["telemetry", "storage", "invalidation", "warming"] {
        assert!(body.get(section).is_some(), "missing {section}");
    }
    assert_eq!(body["invalidation"]["queued"], 0);
}

#[tokio::test]
async fn html_navigation_feeds_the_warming_model() {
    let h = harness();
    get(&h.app, "/", &[]).await;
    get(&h.app, "/index.html", &[("cookie", "session=abc")]).await;
    let model = h.system.warming().transitions();
    assert_eq!(model.total_from("/"), 1);
}
