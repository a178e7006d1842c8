use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
    middleware,
    routing::get,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use kessel::cache::{
    AssetCatalog, BackendBudget, BackendKind, CacheConfig, CacheManager, CacheSystem, Priority,
    PubSub, RetrieveOptions, StorageTarget, StoreOptions, TelemetryCollector, decorate_responses,
    backend::{IndexedStore, KvStore, ResponseStore},
    invalidation::{InvalidationQueue, USER_LOGOUT},
    warming::{AssetSet, FetchError, Fetcher},
};
use kessel::infra::telemetry::describe_metrics;
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serde_json::{Value, json};
use serial_test::serial;
use tower::ServiceExt;

static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();

fn snapshotter() -> &'static Snapshotter {
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        describe_metrics();
        snapshotter
    })
}

fn metric_names(snapshotter: &Snapshotter) -> HashSet<String> {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect()
}

struct FailingFetcher;

#[async_trait]
impl Fetcher for FailingFetcher {
    async fn fetch(&self, _url: &str) -> Result<Bytes, FetchError> {
        Err(FetchError::Status(503))
    }
}

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let snapshotter = snapshotter();

    // Hit, miss, store and evict through a tiny small-sync quota
    let config = CacheConfig::default();
    let telemetry = Arc::new(TelemetryCollector::new(&config));
    let small_sync = Arc::new(KvStore::small_sync(BackendBudget::new(5 * 1024)));
    let manager = CacheManager::new(config.clone(), telemetry, Arc::new(PubSub::new()))
        .with_backend(small_sync.clone())
        .with_backend(Arc::new(KvStore::small_session(config.small_session)))
        .with_backend(Arc::new(IndexedStore::new(config.large_async)))
        .with_backend(Arc::new(ResponseStore::new(config.response_store)));
    let pinned = |priority| StoreOptions {
        storage: StorageTarget::Backend(BackendKind::SmallSync),
        priority,
        ..StoreOptions::default()
    };

    let body = "x".repeat(800);
    for (key, priority) in [
        ("metrics:critical", Priority::Critical),
        ("metrics:high", Priority::High),
        ("metrics:medium", Priority::Medium),
        ("metrics:low", Priority::Low),
        ("metrics:pressure", Priority::Medium),
    ] {
        manager
            .store(key, body.as_str(), pinned(priority))
            .await
            .expect("store");
    }
    manager
        .retrieve("metrics:high", RetrieveOptions::default())
        .await
        .expect("hit");
    manager
        .retrieve("metrics:absent", RetrieveOptions::default())
        .await
        .expect("miss");

    // Integrity failure on tampered bytes
    let sri = StoreOptions {
        require_integrity: true,
        ..pinned(Priority::High)
    };
    manager.store("metrics:sri", "good", sri).await.expect("store");
    let raw = small_sync.get_raw("metrics:sri").expect("raw");
    let mut wire: Value = serde_json::from_str(&raw).expect("wire json");
    wire["v"] = Value::String(BASE64.encode("evil"));
    small_sync
        .set_raw("metrics:sri", wire.to_string())
        .expect("tamper");
    let verify = RetrieveOptions {
        verify_integrity: true,
        ..RetrieveOptions::default()
    };
    assert!(manager.retrieve("metrics:sri", verify).await.is_err());

    // Queue length and drops
    let queue = InvalidationQueue::new(1);
    queue.push(BackendKind::SmallSync, "a", "pattern");
    queue.push(BackendKind::SmallSync, "b", "pattern");
    let _ = queue.drain(1);

    // Batch latency and warming outcomes through the assembled system
    let system = CacheSystem::builder(
        CacheConfig {
            warming_delay_ms: 0,
            ..CacheConfig::default()
        },
        Arc::new(FailingFetcher),
    )
    .catalog(AssetCatalog::empty().with_set(AssetSet::Core, vec!["/static/js/app.js".to_string()]))
    .build();
    system
        .manager()
        .store("user:1:profile", json!({ "id": 1 }), StoreOptions::default())
        .await
        .expect("store");
    system
        .bus()
        .emit(USER_LOGOUT, &json!({ "userId": 1 }))
        .await
        .expect("emit");
    system.bus().drain().await;
    let summary = system.warming().warm_immediate().await;
    assert_eq!(summary.failed, 1);

    let names = metric_names(snapshotter);
    let expected = [
        "kessel_cache_hit_total",
        "kessel_cache_miss_total",
        "kessel_cache_store_total",
        "kessel_cache_evict_total",
        "kessel_cache_sri_failure_total",
        "kessel_invalidation_queue_len",
        "kessel_invalidation_dropped_total",
        "kessel_invalidation_batch_ms",
        "kessel_warming_request_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[tokio::test]
#[serial]
async fn conditional_requests_emit_expected_metric_keys() {
    let snapshotter = snapshotter();

    let system = CacheSystem::builder(CacheConfig::default(), Arc::new(FailingFetcher)).build();
    let app = Router::new()
        .route("/static/app.abc12345.js", get(|| async { "console.log('metrics')" }))
        .layer(middleware::from_fn_with_state(
            system.decorator(),
            decorate_responses,
        ));

    let send = |headers: Vec<(header::HeaderName, String)>| {
        let app = app.clone();
        async move {
            let mut request = Request::builder()
                .method(Method::GET)
                .uri("/static/app.abc12345.js");
            for (name, value) in headers {
                request = request.header(name, value);
            }
            app.oneshot(request.body(Body::empty()).expect("request should build"))
                .await
                .expect("router should respond")
        }
    };

    let first = send(Vec::new()).await;
    let etag = first
        .headers()
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
        .expect("etag")
        .to_string();

    let not_modified = send(vec![(header::IF_NONE_MATCH, etag)]).await;
    assert_eq!(not_modified.status(), StatusCode::NOT_MODIFIED);
    let failed = send(vec![(header::IF_MATCH, "\"ffffffffffffffff\"".to_string())]).await;
    assert_eq!(failed.status(), StatusCode::PRECONDITION_FAILED);

    let names = metric_names(snapshotter);
    for metric in [
        "kessel_http_not_modified_total",
        "kessel_http_precondition_failed_total",
    ] {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
