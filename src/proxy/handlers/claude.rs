use axum::{
    body::Body,
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::info;

use super::common::{dispatch_stream, with_completion_record, Dialect, PipelineError};
use crate::proxy::mappers::claude::streaming::create_claude_sse_stream;
use crate::proxy::mappers::claude::{
    collect_stream_to_message, transform_claude_request, ClaudeContext, ClaudeRequest,
};
use crate::proxy::mappers::openai::streaming::RelayOptions;
use crate::proxy::session::SessionFingerprint;
use crate::proxy::signature_cache::CachePolicy;
use crate::proxy::state::AppState;

fn relay_options(state: &AppState, model: &str, fingerprint: &str) -> RelayOptions {
    RelayOptions {
        model: model.to_string(),
        session_fingerprint: fingerprint.to_string(),
        heartbeat_ms: state.config.streaming.heartbeat_interval_ms,
        policy: CachePolicy::from_mode(&state.config.signature_cache.mode),
        cache_tool_signatures: state.config.signature_cache.cache_tool_signatures,
        image_sink: state.image_sink.clone(),
    }
}

/// Explicit caller identity wins over the content fingerprint, matching the
/// messages API metadata contract.
fn fingerprint_of(req: &ClaudeRequest) -> String {
    if let Some(user_id) = req.metadata.as_ref().and_then(|m| m.user_id.as_deref()) {
        if !user_id.is_empty() {
            return format!("sid-{}", user_id);
        }
    }
    SessionFingerprint::from_messages(
        req.messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.text()))
            .collect::<Vec<_>>(),
    )
}

pub async fn handle_messages(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return PipelineError::bad_request(format!("invalid request: {}", e))
                .into_response(Dialect::Claude)
        }
    };
    if request.messages.is_empty() {
        return PipelineError::bad_request("messages must not be empty".to_string())
            .into_response(Dialect::Claude);
    }

    let fingerprint = fingerprint_of(&request);
    info!(
        "Claude messages request: {} | {} messages | stream={}",
        request.model,
        request.messages.len(),
        request.stream
    );

    let model = request.model.clone();
    let generation = state.config.generation.clone();
    let cache_tool_signatures = state.config.signature_cache.cache_tool_signatures;
    let build = {
        let request = request.clone();
        let fingerprint = fingerprint.clone();
        move |cred: &crate::proxy::credentials::PooledCredential| {
            transform_claude_request(
                &request,
                &ClaudeContext {
                    project_id: cred.project_id.as_deref(),
                    upstream_session_id: &cred.session_id,
                    session_fingerprint: &fingerprint,
                    generation: &generation,
                    cache_tool_signatures,
                },
            )
        }
    };

    let dispatched = match dispatch_stream(&state, &model, &build).await {
        Ok(d) => d,
        Err(e) => return e.into_response(Dialect::Claude),
    };
    let relay = create_claude_sse_stream(
        dispatched.stream,
        relay_options(&state, &model, &fingerprint),
    );
    let relay = with_completion_record(
        relay,
        state.quota.clone(),
        dispatched.selection.credential.id.clone(),
        model.clone(),
    );

    if request.stream {
        return Response::builder()
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(relay))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }
    // Non-stream callers are served through the stream shim unconditionally
    // on this surface; long unary upstream calls are the timeout hazard the
    // shim exists for.
    match collect_stream_to_message(relay).await {
        Ok(message) => (StatusCode::OK, Json(message)).into_response(),
        Err(e) => PipelineError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            e,
            "upstream_other",
        )
        .into_response(Dialect::Claude),
    }
}
