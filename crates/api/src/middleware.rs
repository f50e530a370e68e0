use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::app::errors::json_error;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ApiKeyState {
    /// `None` disables the check.
    pub expected: Option<Arc<str>>,
}

pub async fn api_key_middleware(
    State(state): State<ApiKeyState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(expected) = state.expected.as_deref() {
        if !key_matches(extract_api_key(req.headers()), expected) {
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized", "Unauthorized");
        }
    }

    next.run(req).await
}

fn extract_api_key(headers: &HeaderMap) -> Option<&[u8]> {
    headers.get(API_KEY_HEADER).map(|v| v.as_bytes())
}

/// Constant-time in the key contents; only the length can leak.
fn key_matches(presented: Option<&[u8]>, expected: &str) -> bool {
    presented.is_some_and(|key| bool::from(key.ct_eq(expected.as_bytes())))
}

/// One structured log line per request.
pub async fn request_log(req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let started = Instant::now();

    let res = next.run(req).await;

    let status = res.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if status.is_server_error() {
        warn!(%method, %path, status = status.as_u16(), elapsed_ms, "request failed");
    } else {
        info!(%method, %path, status = status.as_u16(), elapsed_ms, "request");
    }
    res
}
