use serde_json::{json, Value};
use std::collections::HashMap;

use super::{OpenAIContent, OpenAIContentBlock, OpenAIRequest};
use crate::models::GenerationConfig;
use crate::proxy::mappers::common::{
    build_generation_config, build_upstream_body, cached_thought_part, function_declarations,
    is_gemini_model, merge_system_texts, parse_data_url, resolve_thinking_budget,
    system_instruction_value, GenerationParams,
};
use crate::proxy::mappers::tool_names::ToolNameCache;

pub struct OpenAiContext<'a> {
    pub project_id: Option<&'a str>,
    pub upstream_session_id: &'a str,
    pub session_fingerprint: &'a str,
    pub generation: &'a GenerationConfig,
    pub cache_tool_signatures: bool,
}

/// OpenAI chat request → canonical upstream request.
pub fn transform_openai_request(
    req: &OpenAIRequest,
    ctx: &OpenAiContext<'_>,
) -> Result<Value, String> {
    let names = ToolNameCache::global();

    // Contiguous head run of system messages merges into systemInstruction.
    let mut head_system: Vec<String> = Vec::new();
    let mut rest = req.messages.as_slice();
    while let Some(first) = rest.first() {
        if first.role == "system" || first.role == "developer" {
            if let Some(content) = &first.content {
                head_system.push(content.text());
            }
            rest = &rest[1..];
        } else {
            break;
        }
    }

    let mut contents: Vec<Value> = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();
    let mut images_used = 0usize;
    let cached_signature = cached_thought_part(ctx.session_fingerprint, &req.model);

    for message in rest {
        match message.role.as_str() {
            "user" => {
                let mut parts: Vec<Value> = Vec::new();
                match &message.content {
                    Some(OpenAIContent::String(text)) => {
                        parts.push(json!({ "text": text }));
                    }
                    Some(OpenAIContent::Array(blocks)) => {
                        for block in blocks {
                            match block {
                                OpenAIContentBlock::Text { text } => {
                                    parts.push(json!({ "text": text }));
                                }
                                OpenAIContentBlock::ImageUrl { image_url } => {
                                    if images_used >= ctx.generation.max_inline_images {
                                        tracing::warn!(
                                            "[W-IMAGE-CAP] dropping inline image beyond cap of {}",
                                            ctx.generation.max_inline_images
                                        );
                                        continue;
                                    }
                                    let Some((mime, data)) = parse_data_url(&image_url.url)
                                    else {
                                        return Err(format!(
                                            "unsupported image url (expected data URL): {}",
                                            &image_url.url[..image_url.url.len().min(48)]
                                        ));
                                    };
                                    images_used += 1;
                                    parts.push(json!({
                                        "inlineData": { "mimeType": mime, "data": data }
                                    }));
                                }
                            }
                        }
                    }
                    None => {}
                }
                if parts.is_empty() {
                    parts.push(json!({ "text": " " }));
                }
                contents.push(json!({ "role": "user", "parts": parts }));
            }
            "assistant" => {
                let mut parts: Vec<Value> = Vec::new();
                let tool_calls = message.tool_calls.as_deref().unwrap_or(&[]);
                if !tool_calls.is_empty() {
                    if let Some(thought) = cached_signature.clone() {
                        parts.push(thought);
                    }
                }
                if let Some(content) = &message.content {
                    let text = content.text();
                    if !text.is_empty() {
                        parts.push(json!({ "text": text }));
                    }
                }
                for call in tool_calls {
                    let func = call.get("function").unwrap_or(call);
                    let name = func.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
                    let upstream_name = names.to_upstream(name);
                    if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                        call_names.insert(id.to_string(), upstream_name.clone());
                    }
                    let args: Value = func
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_else(|| json!({}));
                    let mut part = json!({
                        "functionCall": { "name": upstream_name, "args": args }
                    });
                    if ctx.cache_tool_signatures {
                        if let Some(sig) = cached_signature
                            .as_ref()
                            .and_then(|t| t.get("thoughtSignature"))
                        {
                            part["thoughtSignature"] = sig.clone();
                        }
                    }
                    parts.push(part);
                }
                if parts.is_empty() {
                    parts.push(json!({ "text": " " }));
                }
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            "tool" => {
                let upstream_name = message
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| call_names.get(id).cloned())
                    .or_else(|| message.name.as_deref().map(|n| names.to_upstream(n)))
                    .unwrap_or_else(|| "unknown".to_string());
                let output = message
                    .content
                    .as_ref()
                    .map(|c| c.text())
                    .unwrap_or_default();
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": upstream_name,
                            "response": { "output": output }
                        }
                    }]
                }));
            }
            // A system message after non-system history is out of the head
            // run; carry it as user text to keep ordering intact.
            "system" | "developer" => {
                let text = message
                    .content
                    .as_ref()
                    .map(|c| c.text())
                    .unwrap_or_default();
                contents.push(json!({ "role": "user", "parts": [{ "text": text }] }));
            }
            other => {
                return Err(format!("unsupported message role: {}", other));
            }
        }
    }
    if contents.is_empty() {
        contents.push(json!({ "role": "user", "parts": [{ "text": " " }] }));
    }

    let system_instruction =
        merge_system_texts(&head_system, ctx.generation).map(|t| system_instruction_value(&t));

    let tools = req
        .tools
        .as_deref()
        .and_then(function_declarations);

    let response_mime_type = req
        .response_format
        .as_ref()
        .and_then(|f| f.get("type"))
        .and_then(|t| t.as_str())
        .filter(|t| *t == "json_object" && is_gemini_model(&req.model))
        .map(|_| "application/json".to_string());

    let thinking_budget = resolve_thinking_budget(
        req.reasoning_effort.as_deref(),
        req.thinking_budget,
        ctx.generation.default_thinking_budget,
    );

    let generation_config = build_generation_config(&GenerationParams {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
        thinking_budget,
        response_mime_type,
    });

    Ok(build_upstream_body(
        &req.model,
        ctx.project_id,
        ctx.upstream_session_id,
        contents,
        system_instruction,
        tools,
        generation_config,
    ))
}
