use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use tracing::info;

use super::common::{dispatch_stream, Dialect, PipelineError};
use crate::proxy::mappers::gemini::{
    collect_stream_to_response, create_gemini_sse_stream, transform_gemini_request, GeminiContext,
};
use crate::proxy::mappers::openai::streaming::RelayOptions;
use crate::proxy::quota::ModelGroup;
use crate::proxy::signature_cache::CachePolicy;
use crate::proxy::state::AppState;

const IMAGE_MODEL: &str = "gemini-3-pro-image";

fn prompt_of(body: &Value) -> String {
    body.get("prompt")
        .and_then(|p| p.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Compat subset of the Stable-Diffusion web API: prompt in, base64 images
/// out. Size hints ride along as plain text since the upstream has no
/// dedicated knobs for them.
async fn run_image_generation(state: AppState, body: Value, init_images: Vec<String>) -> Response {
    let prompt = prompt_of(&body);
    if prompt.is_empty() {
        return PipelineError::bad_request("prompt is required".to_string())
            .into_response(Dialect::OpenAi);
    }
    let width = body.get("width").and_then(|v| v.as_u64()).unwrap_or(1024);
    let height = body.get("height").and_then(|v| v.as_u64()).unwrap_or(1024);
    info!("Image generation request: {}x{} ({} init images)", width, height, init_images.len());

    let mut parts = vec![json!({
        "text": format!("{} (target size {}x{})", prompt, width, height)
    })];
    for image in &init_images {
        parts.push(json!({
            "inlineData": { "mimeType": "image/png", "data": image }
        }));
    }
    let inbound = json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": { "thinkingConfig": { "includeThoughts": false, "thinkingBudget": 0 } }
    });

    let generation = state.config.generation.clone();
    let build = move |cred: &crate::proxy::credentials::PooledCredential| {
        transform_gemini_request(
            IMAGE_MODEL,
            &inbound,
            &GeminiContext {
                project_id: cred.project_id.as_deref(),
                upstream_session_id: &cred.session_id,
                generation: &generation,
            },
        )
    };

    let dispatched = match dispatch_stream(&state, IMAGE_MODEL, &build).await {
        Ok(d) => d,
        Err(e) => return e.into_response(Dialect::OpenAi),
    };
    let relay = create_gemini_sse_stream(
        dispatched.stream,
        RelayOptions {
            model: IMAGE_MODEL.to_string(),
            session_fingerprint: format!("sd-{}", uuid::Uuid::new_v4().simple()),
            heartbeat_ms: 0,
            policy: CachePolicy::Never,
            cache_tool_signatures: false,
            image_sink: state.image_sink.clone(),
        },
    );
    let response = match collect_stream_to_response(relay).await {
        Ok(r) => r,
        Err(e) => {
            return PipelineError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                e,
                "upstream_other",
            )
            .into_response(Dialect::OpenAi)
        }
    };

    let images: Vec<String> = response
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| {
                    part.pointer("/inlineData/data")
                        .and_then(|d| d.as_str())
                        .map(str::to_string)
                })
                .collect()
        })
        .unwrap_or_default();

    if images.is_empty() {
        return PipelineError::new(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "model produced no image output".to_string(),
            "upstream_other",
        )
        .into_response(Dialect::OpenAi);
    }
    state
        .quota
        .record_request(&dispatched.selection.credential.id, ModelGroup::Banana);

    Json(json!({
        "images": images,
        "parameters": body,
        "info": "",
    }))
    .into_response()
}

pub async fn handle_txt2img(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    run_image_generation(state, body, Vec::new()).await
}

pub async fn handle_img2img(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let init_images: Vec<String> = body
        .get("init_images")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    run_image_generation(state, body, init_images).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_extraction_trims() {
        assert_eq!(prompt_of(&json!({"prompt": "  a cat  "})), "a cat");
        assert_eq!(prompt_of(&json!({})), "");
    }
}
