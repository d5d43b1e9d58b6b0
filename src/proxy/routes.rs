use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::constants::is_whitelisted_path;
use crate::proxy::handlers;
use crate::proxy::health;
use crate::proxy::ip_guard::ViolationKind;
use crate::proxy::middleware::{auth_middleware, client_ip, ip_guard_middleware};
use crate::proxy::state::AppState;

/// Any path outside the explicit whitelist 404s and counts as a probe
/// violation against the caller's IP.
async fn fallback_handler(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    if !is_whitelisted_path(&path) {
        if let Some(ip) = client_ip::extract_client_ip(&request) {
            state.guard.record_violation(&ip, ViolationKind::UnknownPath);
            tracing::debug!("Unknown path {} probed from {}", path, ip);
        }
    }
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": { "type": "not_found", "message": "Unknown path", "code": 404 }
        })),
    )
        .into_response()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check_handler))
        .route("/v1/models", get(handlers::openai::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(handlers::openai::handle_chat_completions),
        )
        .route("/v1/messages", post(handlers::claude::handle_messages))
        .route("/v1beta/models", get(handlers::gemini::handle_list_models))
        .route(
            "/v1beta/models/:model_action",
            post(handlers::gemini::handle_generate),
        )
        .route("/sdapi/v1/txt2img", post(handlers::images::handle_txt2img))
        .route("/sdapi/v1/img2img", post(handlers::images::handle_img2img))
        .fallback(fallback_handler)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            ip_guard_middleware,
        ))
        .with_state(state)
}
