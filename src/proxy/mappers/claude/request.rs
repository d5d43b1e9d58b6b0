use serde_json::{json, Value};
use std::collections::HashMap;

use super::{ClaudeRequest, ContentBlock, MessageContent};
use crate::models::GenerationConfig;
use crate::proxy::mappers::common::{
    build_generation_config, build_upstream_body, cached_thought_part, function_declarations,
    merge_system_texts, resolve_thinking_budget, system_instruction_value, GenerationParams,
};
use crate::proxy::mappers::tool_names::ToolNameCache;

pub struct ClaudeContext<'a> {
    pub project_id: Option<&'a str>,
    pub upstream_session_id: &'a str,
    pub session_fingerprint: &'a str,
    pub generation: &'a GenerationConfig,
    pub cache_tool_signatures: bool,
}

fn system_head_texts(system: &Option<Value>) -> Vec<String> {
    match system {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()).map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn tool_result_output(content: &Option<Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Claude messages request → canonical upstream request.
pub fn transform_claude_request(
    req: &ClaudeRequest,
    ctx: &ClaudeContext<'_>,
) -> Result<Value, String> {
    let names = ToolNameCache::global();
    let mut contents: Vec<Value> = Vec::new();
    let mut tool_use_names: HashMap<String, String> = HashMap::new();
    let mut images_used = 0usize;
    let cached_signature = cached_thought_part(ctx.session_fingerprint, &req.model);

    for message in &req.messages {
        let role = match message.role.as_str() {
            "user" => "user",
            "assistant" => "model",
            other => return Err(format!("unsupported message role: {}", other)),
        };
        let mut parts: Vec<Value> = Vec::new();

        match &message.content {
            MessageContent::String(text) => {
                parts.push(json!({ "text": text }));
            }
            MessageContent::Array(blocks) => {
                let has_tool_use = blocks
                    .iter()
                    .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
                let has_inline_thinking = blocks
                    .iter()
                    .any(|b| matches!(b, ContentBlock::Thinking { .. }));
                if role == "model" && has_tool_use && !has_inline_thinking {
                    if let Some(thought) = cached_signature.clone() {
                        parts.push(thought);
                    }
                }
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            parts.push(json!({ "text": text }));
                        }
                        ContentBlock::Image { source } => {
                            if images_used >= ctx.generation.max_inline_images {
                                tracing::warn!(
                                    "[W-IMAGE-CAP] dropping inline image beyond cap of {}",
                                    ctx.generation.max_inline_images
                                );
                                continue;
                            }
                            let mime = source
                                .get("media_type")
                                .and_then(|v| v.as_str())
                                .unwrap_or("image/png");
                            let Some(data) = source.get("data").and_then(|v| v.as_str()) else {
                                return Err("image block missing base64 data".to_string());
                            };
                            images_used += 1;
                            parts.push(json!({
                                "inlineData": { "mimeType": mime, "data": data }
                            }));
                        }
                        ContentBlock::Thinking {
                            thinking,
                            signature,
                        } => {
                            let mut part = json!({ "text": thinking, "thought": true });
                            let sig = signature.clone().or_else(|| {
                                cached_signature
                                    .as_ref()
                                    .and_then(|t| t.get("thoughtSignature"))
                                    .and_then(|s| s.as_str())
                                    .map(str::to_string)
                            });
                            if let Some(sig) = sig {
                                part["thoughtSignature"] = json!(sig);
                            }
                            parts.push(part);
                        }
                        ContentBlock::RedactedThinking { .. } => {
                            // Redacted traces cannot be replayed upstream.
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            let upstream_name = names.to_upstream(name);
                            tool_use_names.insert(id.clone(), upstream_name.clone());
                            let mut part = json!({
                                "functionCall": { "name": upstream_name, "args": input }
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
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            let upstream_name = tool_use_names
                                .get(tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| "unknown".to_string());
                            parts.push(json!({
                                "functionResponse": {
                                    "name": upstream_name,
                                    "response": { "output": tool_result_output(content) }
                                }
                            }));
                        }
                    }
                }
            }
        }
        if parts.is_empty() {
            parts.push(json!({ "text": " " }));
        }
        contents.push(json!({ "role": role, "parts": parts }));
    }
    if contents.is_empty() {
        contents.push(json!({ "role": "user", "parts": [{ "text": " " }] }));
    }

    let head = system_head_texts(&req.system);
    let system_instruction =
        merge_system_texts(&head, ctx.generation).map(|t| system_instruction_value(&t));

    let tools = req.tools.as_deref().and_then(function_declarations);

    let explicit_budget = req.thinking.as_ref().and_then(|t| {
        if t.kind.eq_ignore_ascii_case("disabled") {
            Some(0)
        } else {
            t.budget_tokens
        }
    });
    let thinking_budget = resolve_thinking_budget(
        None,
        explicit_budget,
        ctx.generation.default_thinking_budget,
    );

    let generation_config = build_generation_config(&GenerationParams {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_output_tokens: req.max_tokens,
        thinking_budget,
        response_mime_type: None,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(gen: &'a GenerationConfig) -> ClaudeContext<'a> {
        ClaudeContext {
            project_id: None,
            upstream_session_id: "s-up",
            session_fingerprint: "sid-claude-test",
            generation: gen,
            cache_tool_signatures: true,
        }
    }

    fn req(body: Value) -> ClaudeRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_string_and_block_array_both_merge() {
        let gen = GenerationConfig::default();
        let r = req(json!({
            "model": "claude-sonnet-4-5",
            "system": "be terse",
            "messages": [{ "role": "user", "content": "hello over there friend" }]
        }));
        let body = transform_claude_request(&r, &ctx(&gen)).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("be terse"));

        let r = req(json!({
            "model": "claude-sonnet-4-5",
            "system": [{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }],
            "messages": [{ "role": "user", "content": "hello over there friend" }]
        }));
        let body = transform_claude_request(&r, &ctx(&gen)).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("a\n\nb"));
    }

    #[test]
    fn tool_use_and_result_round_trip_through_name_cache() {
        let gen = GenerationConfig::default();
        let r = req(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                { "role": "user", "content": "use the odd tool for me now" },
                { "role": "assistant", "content": [
                    { "type": "tool_use", "id": "toolu_1", "name": "srv/run", "input": { "x": 1 } }
                ]},
                { "role": "user", "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_1", "content": "ok" }
                ]}
            ]
        }));
        let body = transform_claude_request(&r, &ctx(&gen)).unwrap();
        let call = &body["contents"][1]["parts"][0]["functionCall"];
        let response = &body["contents"][2]["parts"][0]["functionResponse"];
        assert_eq!(call["name"], response["name"]);
        assert_eq!(call["args"]["x"], json!(1));
        assert_eq!(response["response"]["output"], json!("ok"));
    }

    #[test]
    fn thinking_blocks_become_thought_parts_with_signature() {
        let gen = GenerationConfig::default();
        let r = req(json!({
            "model": "claude-sonnet-4-5",
            "messages": [
                { "role": "user", "content": "continue the plan from before" },
                { "role": "assistant", "content": [
                    { "type": "thinking", "thinking": "step one...", "signature": "sig-inline" },
                    { "type": "text", "text": "Step one done." }
                ]}
            ]
        }));
        let body = transform_claude_request(&r, &ctx(&gen)).unwrap();
        let thought = &body["contents"][1]["parts"][0];
        assert_eq!(thought["thought"], json!(true));
        assert_eq!(thought["thoughtSignature"], json!("sig-inline"));
        assert_eq!(thought["text"], json!("step one..."));
    }

    #[test]
    fn thinking_config_controls_budget() {
        let gen = GenerationConfig::default();
        let r = req(json!({
            "model": "claude-sonnet-4-5",
            "thinking": { "type": "enabled", "budget_tokens": 2048 },
            "messages": [{ "role": "user", "content": "reason about this deeply" }]
        }));
        let body = transform_claude_request(&r, &ctx(&gen)).unwrap();
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            json!(2048)
        );

        let r = req(json!({
            "model": "claude-sonnet-4-5",
            "thinking": { "type": "disabled" },
            "messages": [{ "role": "user", "content": "no reasoning please" }]
        }));
        let body = transform_claude_request(&r, &ctx(&gen)).unwrap();
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["includeThoughts"],
            json!(false)
        );
    }

    #[test]
    fn base64_image_blocks_become_inline_data() {
        let gen = GenerationConfig::default();
        let r = req(json!({
            "model": "claude-sonnet-4-5",
            "messages": [{ "role": "user", "content": [
                { "type": "image", "source": { "type": "base64", "media_type": "image/webp", "data": "QUJD" } },
                { "type": "text", "text": "what is in the image above" }
            ]}]
        }));
        let body = transform_claude_request(&r, &ctx(&gen)).unwrap();
        let part = &body["contents"][0]["parts"][0]["inlineData"];
        assert_eq!(part["mimeType"], json!("image/webp"));
        assert_eq!(part["data"], json!("QUJD"));
    }
}
