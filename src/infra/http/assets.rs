//! Asset root and `/api` echo handlers.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path as FsPath, PathBuf};

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::json;
use tracing::{error, warn};

use super::{HttpState, error_response};
use crate::cache::{FileMeta, FileSource, IntegrityRecord};

const SOURCE: &str = "infra::http::assets";
const INDEX_FILE: &str = "index.html";

/// Serve a file from the asset root. Directory paths map to `index.html`.
pub(super) async fn serve_asset(State(state): State<HttpState>, uri: Uri) -> Response {
    let Some(relative) = resolve_relative(uri.path()) else {
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "asset not found");
    };
    let full = state.asset_root.join(&relative);

    let (bytes, metadata) = match tokio::try_join!(tokio::fs::read(&full), tokio::fs::metadata(&full)) {
        Ok(found) => found,
        Err(err) if err.kind() == ErrorKind::NotFound || err.kind() == ErrorKind::IsADirectory => {
            return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "asset not found");
        }
        Err(err) => {
            error!(target: SOURCE, path = %full.display(), error = %err, "failed to read asset");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO",
                "failed to read asset",
            );
        }
    };

    let key = relative.to_string_lossy().replace('\\', "/");
    if let Some(manifest) = state.system.manifest()
        && let Some(expected) = manifest.get(&key)
        && expected.sri() != IntegrityRecord::compute(key.clone(), &bytes).sri()
    {
        warn!(target: SOURCE, asset = %key, "asset differs from the integrity manifest");
    }

    build_response(&relative, Bytes::from(bytes), FileMeta::from_metadata(&metadata))
}

/// Structured echo of the requested resource; exercises the JSON validator path.
pub(super) async fn api_echo(
    Path(path): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    Json(json!({ "resource": path, "params": params })).into_response()
}

fn resolve_relative(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    let candidate = if trimmed.is_empty() || trimmed.ends_with('/') {
        format!("{trimmed}{INDEX_FILE}")
    } else {
        trimmed.to_string()
    };
    let relative = PathBuf::from(candidate);
    relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
        .then_some(relative)
}

fn build_response(relative: &FsPath, bytes: Bytes, meta: Option<FileMeta>) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    let mime = mime_guess::from_path(relative).first_or_octet_stream();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Some(meta) = meta {
        response.extensions_mut().insert(FileSource(meta));
    }

    response
}
