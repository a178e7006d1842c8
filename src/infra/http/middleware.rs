use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, header},
    middleware::Next,
    response::Response,
};
use tracing::{error, warn};
use uuid::Uuid;

use super::HttpState;
use crate::cache::AssetTag;

const SESSION_COOKIE: &str = "session=";

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let response = next.run(request).await;
    let status = response.status();

    if status.is_server_error() {
        error!(
            target: "kessel::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms = start.elapsed().as_millis(),
            request_id = request_id,
            "request failed",
        );
    } else if status.is_client_error() && status.as_u16() != 412 {
        warn!(
            target: "kessel::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms = start.elapsed().as_millis(),
            request_id = request_id,
            "client request error",
        );
    }

    response
}

/// Feed HTML page views and session presence to the warming engine.
pub async fn track_navigation(
    State(state): State<HttpState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::GET {
        let path = request.uri().path();
        if state.system.policies().classify(path) == AssetTag::Html {
            let warming = state.system.warming();
            let session = request
                .headers()
                .get_all(header::COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(|cookies| {
                    cookies
                        .split(';')
                        .any(|pair| pair.trim_start().starts_with(SESSION_COOKIE))
                });
            warming.set_session_active(session);
            warming.record_pageview(path);
        }
    }
    next.run(request).await
}
