use axum::{
    body::Body,
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tracing::{debug, info};

use super::common::{
    dispatch_stream, openai_models_response, unary_as_stream, with_completion_record, Dialect,
    PipelineError,
};
use crate::proxy::mappers::openai::streaming::{create_openai_sse_stream, RelayOptions};
use crate::proxy::mappers::openai::{
    collect_stream_to_json, transform_openai_request, OpenAIContent, OpenAIMessage, OpenAIRequest,
    OpenAiContext,
};
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

fn fingerprint_of(req: &OpenAIRequest) -> String {
    SessionFingerprint::from_messages(
        req.messages
            .iter()
            .map(|m| {
                (
                    m.role.as_str(),
                    m.content.as_ref().map(|c| c.text()).unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>(),
    )
}

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let mut request: OpenAIRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return PipelineError::bad_request(format!("invalid request: {}", e))
                .into_response(Dialect::OpenAi)
        }
    };
    if request.messages.is_empty() {
        debug!("Empty messages array, injecting placeholder turn");
        request.messages.push(OpenAIMessage {
            role: "user".to_string(),
            content: Some(OpenAIContent::String(" ".to_string())),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        });
    }

    let fingerprint = fingerprint_of(&request);
    info!(
        "OpenAI chat request: {} | {} messages | stream={}",
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
            transform_openai_request(
                &request,
                &OpenAiContext {
                    project_id: cred.project_id.as_deref(),
                    upstream_session_id: &cred.session_id,
                    session_fingerprint: &fingerprint,
                    generation: &generation,
                    cache_tool_signatures,
                },
            )
        }
    };

    let use_stream_path = request.stream || state.config.streaming.fake_non_stream;
    if use_stream_path {
        let dispatched = match dispatch_stream(&state, &model, &build).await {
            Ok(d) => d,
            Err(e) => return e.into_response(Dialect::OpenAi),
        };
        let relay = create_openai_sse_stream(
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
        // Non-stream shim: stream upstream, collect to one JSON body.
        return match collect_stream_to_json(relay).await {
            Ok(full) => (StatusCode::OK, Json(full)).into_response(),
            Err(e) => PipelineError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                e,
                "upstream_other",
            )
            .into_response(Dialect::OpenAi),
        };
    }

    // Shim disabled: true unary call, converted through the same machinery.
    let (response, selection) = match super::common::dispatch_unary(&state, &model, &build).await {
        Ok(r) => r,
        Err(e) => return e.into_response(Dialect::OpenAi),
    };
    let relay = create_openai_sse_stream(
        unary_as_stream(response),
        relay_options(&state, &model, &fingerprint),
    );
    match collect_stream_to_json(relay).await {
        Ok(full) => {
            state.quota.record_request(
                &selection.credential.id,
                crate::proxy::quota::ModelGroup::classify(&model),
            );
            (StatusCode::OK, Json(full)).into_response()
        }
        Err(e) => {
            PipelineError::new(StatusCode::BAD_GATEWAY, "upstream_error", e, "upstream_other")
                .into_response(Dialect::OpenAi)
        }
    }
}

pub async fn handle_list_models(State(state): State<AppState>) -> Response {
    Json(openai_models_response(&state.quota)).into_response()
}
