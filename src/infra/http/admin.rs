//! `/_cache` administration endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::info;

use super::{HttpState, error_response};

/// Telemetry report, per-backend usage and invalidation queue state.
pub(super) async fn stats(State(state): State<HttpState>) -> Response {
    let system = &state.system;
    let (done, failed) = system.bus().outcomes();
    let body = json!({
        "telemetry": system.telemetry().report(),
        "storage": system.manager().stats().await,
        "invalidation": {
            "queued": system.bus().queue_len(),
            "dropped": system.bus().dropped(),
            "done": done,
            "failed": failed,
        },
        "warming": {
            "loaded": system.warming().loaded_assets().len(),
            "hints": system.warming().hints().len(),
        },
    });
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Emit a domain event. The body, when present, is the JSON payload.
pub(super) async fn emit_event(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let payload = if body.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_PAYLOAD",
                    format!("event payload is not JSON: {err}"),
                );
            }
        }
    };

    match state.system.bus().emit(&name, &payload).await {
        Ok(queued) => (
            StatusCode::ACCEPTED,
            Json(json!({ "event": name, "queued": queued })),
        )
            .into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.code(), err.to_string()),
    }
}

/// Signal a new application version.
pub(super) async fn version_changed(
    State(state): State<HttpState>,
    Path(version): Path<String>,
) -> Response {
    let queued = state.system.bus().version_changed(&version).await;
    info!(version = %version, queued, "version change accepted");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "version": version, "queued": queued })),
    )
        .into_response()
}
