use axum::{
    body::Body,
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::info;

use super::common::{catalog_model_ids, dispatch_stream, dispatch_unary, Dialect, PipelineError};
use crate::proxy::mappers::gemini::{
    collect_stream_to_response, create_gemini_sse_stream, transform_gemini_request, GeminiContext,
};
use crate::proxy::mappers::openai::streaming::{unwrap_envelope, RelayOptions};
use crate::proxy::quota::ModelGroup;
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

/// The path segment is `{model}:{action}`.
fn split_model_action(segment: &str) -> Result<(String, String), PipelineError> {
    match segment.split_once(':') {
        Some((model, action)) if !model.is_empty() && !action.is_empty() => {
            Ok((model.to_string(), action.to_string()))
        }
        _ => Err(PipelineError::bad_request(format!(
            "expected models/{{model}}:{{action}}, got {}",
            segment
        ))),
    }
}

pub async fn handle_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let (model, action) = match split_model_action(&model_action) {
        Ok(pair) => pair,
        Err(e) => return e.into_response(Dialect::Gemini),
    };
    let wants_stream = match action.as_str() {
        "streamGenerateContent" => true,
        "generateContent" => false,
        other => {
            return PipelineError::bad_request(format!("unsupported action: {}", other))
                .into_response(Dialect::Gemini)
        }
    };

    let fingerprint = SessionFingerprint::from_gemini_contents(&body);
    info!(
        "Gemini request: {} | action={} | stream={}",
        model, action, wants_stream
    );

    let generation = state.config.generation.clone();
    let build = {
        let body = body.clone();
        let model = model.clone();
        move |cred: &crate::proxy::credentials::PooledCredential| {
            transform_gemini_request(
                &model,
                &body,
                &GeminiContext {
                    project_id: cred.project_id.as_deref(),
                    upstream_session_id: &cred.session_id,
                    generation: &generation,
                },
            )
        }
    };

    if wants_stream || state.config.streaming.fake_non_stream {
        let dispatched = match dispatch_stream(&state, &model, &build).await {
            Ok(d) => d,
            Err(e) => return e.into_response(Dialect::Gemini),
        };
        let relay = create_gemini_sse_stream(
            dispatched.stream,
            relay_options(&state, &model, &fingerprint),
        );
        let relay = super::common::with_completion_record(
            relay,
            state.quota.clone(),
            dispatched.selection.credential.id.clone(),
            model.clone(),
        );

        if wants_stream {
            return Response::builder()
                .header("Content-Type", "text/event-stream")
                .header("Cache-Control", "no-cache")
                .header("Connection", "keep-alive")
                .header("X-Accel-Buffering", "no")
                .body(Body::from_stream(relay))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        return match collect_stream_to_response(relay).await {
            Ok(full) => (StatusCode::OK, Json(full)).into_response(),
            Err(e) => PipelineError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                e,
                "upstream_other",
            )
            .into_response(Dialect::Gemini),
        };
    }

    let (response, selection) = match dispatch_unary(&state, &model, &build).await {
        Ok(r) => r,
        Err(e) => return e.into_response(Dialect::Gemini),
    };
    state
        .quota
        .record_request(&selection.credential.id, ModelGroup::classify(&model));
    (StatusCode::OK, Json(unwrap_envelope(response))).into_response()
}

pub async fn handle_list_models(State(state): State<AppState>) -> Response {
    let models: Vec<Value> = catalog_model_ids(&state.quota)
        .into_iter()
        .map(|id| {
            json!({
                "name": format!("models/{}", id),
                "displayName": id,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    Json(json!({ "models": models })).into_response()
}
