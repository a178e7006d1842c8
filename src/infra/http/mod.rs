//! HTTP surface: the asset root and `/api` echo behind the cache decorator,
//! plus the `/_cache` administration endpoints.

mod admin;
mod assets;
mod middleware;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::cache::{CacheSystem, decorate_responses};

pub use middleware::RequestContext;

#[derive(Clone)]
pub struct HttpState {
    pub system: Arc<CacheSystem>,
    pub asset_root: Arc<PathBuf>,
}

impl HttpState {
    pub fn new(system: Arc<CacheSystem>, asset_root: impl Into<PathBuf>) -> Self {
        Self {
            system,
            asset_root: Arc::new(asset_root.into()),
        }
    }
}

pub fn build_router(state: HttpState) -> Router {
    // Everything the browser caches goes through the decorator.
    let decorated = Router::new()
        .route("/api/{*path}", get(assets::api_echo))
        .fallback(assets::serve_asset)
        .layer(from_fn_with_state(
            state.system.decorator(),
            decorate_responses,
        ))
        .layer(from_fn_with_state(state.clone(), middleware::track_navigation));

    let admin = Router::new()
        .route("/_cache/stats", get(admin::stats))
        .route("/_cache/events/{name}", post(admin::emit_event))
        .route("/_cache/version/{version}", post(admin::version_changed));

    decorated
        .merge(admin)
        .with_state(state)
        .layer(from_fn(middleware::log_responses))
        .layer(from_fn(middleware::set_request_context))
}

fn error_response(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    let body = Json(json!({ "error": code, "message": message.into() }));
    (status, body).into_response()
}
