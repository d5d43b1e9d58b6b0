use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::proxy::ip_guard::ViolationKind;
use crate::proxy::state::AppState;

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();
    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }
    diff == 0
}

/// Pulls the caller key from any of the three surfaces' conventions:
/// Bearer header, `x-api-key`, `x-goog-api-key`, or `?key=` query.
fn extract_caller_key(request: &Request) -> Option<String> {
    if let Some(value) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        return Some(
            value
                .strip_prefix("Bearer ")
                .unwrap_or(value)
                .trim()
                .to_string(),
        );
    }
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = request.headers().get(name).and_then(|h| h.to_str().ok()) {
            return Some(value.trim().to_string());
        }
    }
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|kv| {
            kv.strip_prefix("key=")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    })
}

fn is_public_path(path: &str) -> bool {
    path == "/health" || path.starts_with("/sdapi/")
}

/// The routes that actually require a caller key. Anything else either is
/// public or falls through to the 404 handler, whose violation is the
/// unknown-path kind, not a failed-auth one.
fn is_api_route(path: &str) -> bool {
    matches!(
        path,
        "/v1/chat/completions" | "/v1/messages" | "/v1/models" | "/v1beta/models"
    ) || path.starts_with("/v1beta/models/")
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if request.method() == axum::http::Method::OPTIONS
        || is_public_path(&path)
        || !is_api_route(&path)
    {
        return next.run(request).await;
    }

    let provided = extract_caller_key(&request);
    let authorized = provided
        .as_deref()
        .map(|key| constant_time_str_eq(key, &state.config.api_key))
        .unwrap_or(false);
    if authorized {
        return next.run(request).await;
    }

    if let Some(ip) = super::client_ip::extract_client_ip(&request) {
        state.guard.record_violation(&ip, ViolationKind::InvalidApiKey);
        tracing::warn!("Rejected request to {} with invalid caller key from {}", path, ip);
    } else {
        tracing::warn!("Rejected request to {} with invalid caller key (no client IP)", path);
    }

    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({
            "error": {
                "type": "invalid_request_error",
                "message": "Invalid or missing API key.",
                "code": "invalid_api_key"
            }
        })),
    )
        .into_response()
}
