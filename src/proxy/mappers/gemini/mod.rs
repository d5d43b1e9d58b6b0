use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::{json, Map, Value};

use crate::models::GenerationConfig;
use crate::proxy::mappers::common::{
    build_upstream_body, heartbeat_period, is_image_model, merge_system_texts,
    system_instruction_value,
};
use crate::proxy::mappers::openai::streaming::{
    drain_sse_lines, unwrap_envelope, RelayOptions, SseStream,
};
use crate::proxy::mappers::tool_names::ToolNameCache;
use crate::proxy::signature_cache::SignatureCache;
use crate::proxy::upstream::client::ByteStream;

pub struct GeminiContext<'a> {
    pub project_id: Option<&'a str>,
    pub upstream_session_id: &'a str,
    pub generation: &'a GenerationConfig,
}

fn system_head_texts(body: &Value) -> Vec<String> {
    let node = body
        .get("systemInstruction")
        .or_else(|| body.get("system_instruction"));
    let Some(node) = node else {
        return Vec::new();
    };
    if let Some(s) = node.as_str() {
        return vec![s.to_string()];
    }
    node.get("parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()).map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn canonicalize_contents(body: &Value, max_images: usize) -> Vec<Value> {
    let names = ToolNameCache::global();
    let mut images_used = 0usize;
    let mut out = Vec::new();
    let Some(contents) = body.get("contents").and_then(|c| c.as_array()) else {
        return vec![json!({ "role": "user", "parts": [{ "text": " " }] })];
    };
    for content in contents {
        let mut entry = content.clone();
        if let Some(parts) = entry.get_mut("parts").and_then(|p| p.as_array_mut()) {
            parts.retain(|part| {
                if part.get("inlineData").is_some() || part.get("inline_data").is_some() {
                    if images_used >= max_images {
                        tracing::warn!(
                            "[W-IMAGE-CAP] dropping inline image beyond cap of {}",
                            max_images
                        );
                        return false;
                    }
                    images_used += 1;
                }
                true
            });
            for part in parts.iter_mut() {
                let name_slot = if part.pointer("/functionCall/name").is_some() {
                    part.pointer_mut("/functionCall/name")
                } else {
                    part.pointer_mut("/functionResponse/name")
                };
                if let Some(name_slot) = name_slot {
                    if let Some(name) = name_slot.as_str() {
                        *name_slot = json!(names.to_upstream(name));
                    }
                }
            }
        }
        out.push(entry);
    }
    if out.is_empty() {
        out.push(json!({ "role": "user", "parts": [{ "text": " " }] }));
    }
    out
}

fn canonicalize_tools(body: &Value) -> Option<Value> {
    let tools = body.get("tools")?.as_array()?;
    let names = ToolNameCache::global();
    let mut out = Vec::new();
    for tool in tools {
        let mut tool = tool.clone();
        if let Some(decls) = tool
            .get_mut("functionDeclarations")
            .and_then(|d| d.as_array_mut())
        {
            for decl in decls.iter_mut() {
                if let Some(name_slot) = decl.get_mut("name") {
                    if let Some(name) = name_slot.as_str() {
                        *name_slot = json!(names.to_upstream(name));
                    }
                }
            }
        }
        out.push(tool);
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Array(out))
    }
}

fn canonicalize_generation_config(body: &Value, generation: &GenerationConfig) -> Value {
    let mut cfg = body
        .get("generationConfig")
        .or_else(|| body.get("generation_config"))
        .and_then(|c| c.as_object())
        .cloned()
        .unwrap_or_else(Map::new);
    let has_budget = cfg
        .get("thinkingConfig")
        .and_then(|t| t.get("thinkingBudget"))
        .is_some();
    if !has_budget {
        cfg.insert(
            "thinkingConfig".to_string(),
            json!({
                "includeThoughts": generation.default_thinking_budget > 0,
                "thinkingBudget": generation.default_thinking_budget
            }),
        );
    }
    Value::Object(cfg)
}

/// Gemini-native request → canonical upstream request. Mostly a
/// passthrough: system merge, tool-name mapping, image cap, defaults.
pub fn transform_gemini_request(
    model: &str,
    body: &Value,
    ctx: &GeminiContext<'_>,
) -> Result<Value, String> {
    if !body.is_object() {
        return Err("request body must be a JSON object".to_string());
    }
    let contents = canonicalize_contents(body, ctx.generation.max_inline_images);
    let head = system_head_texts(body);
    let system_instruction =
        merge_system_texts(&head, ctx.generation).map(|t| system_instruction_value(&t));
    let tools = canonicalize_tools(body);
    let generation_config = canonicalize_generation_config(body, ctx.generation);

    Ok(build_upstream_body(
        model,
        ctx.project_id,
        ctx.upstream_session_id,
        contents,
        system_instruction,
        tools,
        generation_config,
    ))
}

fn reverse_map_names(data: &mut Value) {
    let names = ToolNameCache::global();
    if let Some(candidates) = data.get_mut("candidates").and_then(|c| c.as_array_mut()) {
        for candidate in candidates {
            let Some(parts) = candidate
                .pointer_mut("/content/parts")
                .and_then(|p| p.as_array_mut())
            else {
                continue;
            };
            for part in parts {
                if let Some(name_slot) = part.pointer_mut("/functionCall/name") {
                    if let Some(name) = name_slot.as_str() {
                        *name_slot = json!(names.to_inbound(name));
                    }
                }
            }
        }
    }
}

fn capture_signatures(data: &Value, saw_tools: &mut bool, reasoning: &mut Option<String>, tool: &mut Option<String>, reasoning_text: &mut String) {
    let Some(parts) = data
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
    else {
        return;
    };
    for part in parts {
        let is_tool = part.get("functionCall").is_some();
        if is_tool {
            *saw_tools = true;
        }
        if part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false) {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                reasoning_text.push_str(text);
            }
        }
        if let Some(sig) = part
            .get("thoughtSignature")
            .or_else(|| part.get("thought_signature"))
            .and_then(|s| s.as_str())
        {
            if is_tool {
                *tool = Some(sig.to_string());
            } else {
                *reasoning = Some(sig.to_string());
            }
        }
    }
}

/// Upstream SSE → Gemini SSE: candidates pass through with thought parts
/// preserved and tool names restored; the heartbeat is an empty candidate.
pub fn create_gemini_sse_stream(mut upstream: ByteStream, opts: RelayOptions) -> SseStream {
    let mut buffer = BytesMut::new();
    let image_model = is_image_model(&opts.model);

    let stream = async_stream::stream! {
        let mut saw_tools = false;
        let mut reasoning_signature: Option<String> = None;
        let mut tool_signature: Option<String> = None;
        let mut reasoning_text = String::new();

        let mut heartbeat = tokio::time::interval(heartbeat_period(opts.heartbeat_ms));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset();

        loop {
            tokio::select! {
                item = upstream.next() => {
                    match item {
                        Some(Ok(bytes)) => {
                            buffer.extend_from_slice(&bytes);
                            for payload in drain_sse_lines(&mut buffer) {
                                let Ok(event) = serde_json::from_str::<Value>(&payload) else { continue; };
                                let mut data = unwrap_envelope(event);
                                capture_signatures(
                                    &data,
                                    &mut saw_tools,
                                    &mut reasoning_signature,
                                    &mut tool_signature,
                                    &mut reasoning_text,
                                );
                                reverse_map_names(&mut data);
                                yield Ok::<Bytes, String>(Bytes::from(format!(
                                    "data: {}\n\n",
                                    serde_json::to_string(&data).unwrap_or_default()
                                )));
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("[E-STREAM-RELAY] upstream stream error: {}", e);
                            let error_event = json!({
                                "error": { "code": 502, "message": e.to_string(), "status": "UNAVAILABLE" }
                            });
                            yield Ok::<Bytes, String>(Bytes::from(format!(
                                "data: {}\n\n",
                                serde_json::to_string(&error_event).unwrap_or_default()
                            )));
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok::<Bytes, String>(Bytes::from(format!(
                        "data: {}\n\n",
                        json!({ "candidates": [{ "content": { "parts": [] } }] })
                    )));
                }
            }
        }

        if opts.policy.should_cache(saw_tools, image_model) {
            if let Some(signature) = tool_signature
                .filter(|_| opts.cache_tool_signatures)
                .or(reasoning_signature)
            {
                SignatureCache::global().store(
                    &opts.session_fingerprint,
                    &opts.model,
                    signature,
                    &reasoning_text,
                );
            }
        }
    };
    Box::pin(stream)
}

/// Collects a relayed Gemini stream into one generateContent response.
pub async fn collect_stream_to_response(mut stream: SseStream) -> Result<Value, String> {
    let mut parts: Vec<Value> = Vec::new();
    let mut finish_reason: Option<Value> = None;
    let mut usage: Option<Value> = None;
    let mut text_acc = String::new();
    let mut thought_acc = String::new();

    while let Some(item) = stream.next().await {
        let bytes = item?;
        let text = String::from_utf8_lossy(&bytes).to_string();
        for line in text.lines() {
            let Some(raw) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Value>(raw.trim()) else {
                continue;
            };
            if let Some(error) = event.get("error") {
                return Err(error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("stream error")
                    .to_string());
            }
            if let Some(u) = event.get("usageMetadata") {
                usage = Some(u.clone());
            }
            let Some(candidate) = event.pointer("/candidates/0") else {
                continue;
            };
            if let Some(reason) = candidate.get("finishReason") {
                finish_reason = Some(reason.clone());
            }
            let Some(event_parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array())
            else {
                continue;
            };
            for part in event_parts {
                let is_thought = part
                    .get("thought")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                    if is_thought {
                        thought_acc.push_str(t);
                    } else {
                        text_acc.push_str(t);
                    }
                    continue;
                }
                // Function calls and inline data pass through whole.
                parts.push(part.clone());
            }
        }
    }

    let mut merged: Vec<Value> = Vec::new();
    if !thought_acc.is_empty() {
        merged.push(json!({ "text": thought_acc, "thought": true }));
    }
    if !text_acc.is_empty() {
        merged.push(json!({ "text": text_acc }));
    }
    merged.extend(parts);
    if merged.is_empty() {
        merged.push(json!({ "text": "" }));
    }

    let mut response = json!({
        "candidates": [{
            "content": { "role": "model", "parts": merged },
            "finishReason": finish_reason.unwrap_or(json!("STOP")),
            "index": 0
        }]
    });
    if let Some(u) = usage {
        response["usageMetadata"] = u;
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::images::InlineImageSink;
    use crate::proxy::signature_cache::CachePolicy;
    use std::sync::Arc;

    fn gen() -> GenerationConfig {
        GenerationConfig::default()
    }

    fn relay_opts(fingerprint: &str) -> RelayOptions {
        RelayOptions {
            model: "gemini-3-pro".to_string(),
            session_fingerprint: fingerprint.to_string(),
            heartbeat_ms: 0,
            policy: CachePolicy::Always,
            cache_tool_signatures: true,
            image_sink: Arc::new(InlineImageSink),
        }
    }

    fn upstream_of(events: Vec<Value>) -> ByteStream {
        let items: Vec<Result<Bytes, reqwest::Error>> = events
            .into_iter()
            .map(|e| Ok(Bytes::from(format!("data: {}\n", serde_json::to_string(&e).unwrap()))))
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    #[test]
    fn request_passthrough_keeps_contents_and_applies_defaults() {
        let generation = gen();
        let ctx = GeminiContext {
            project_id: Some("proj"),
            upstream_session_id: "s-g",
            generation: &generation,
        };
        let inbound = json!({
            "contents": [{ "role": "user", "parts": [{ "text": "hello from gemini land" }] }],
            "generationConfig": { "temperature": 0.5 }
        });
        let body = transform_gemini_request("gemini-3-pro", &inbound, &ctx).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["text"], json!("hello from gemini land"));
        assert_eq!(body["generationConfig"]["temperature"], json!(0.5));
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            json!(16_000)
        );
        assert_eq!(body["sessionId"], json!("s-g"));
    }

    #[test]
    fn explicit_thinking_budget_is_not_overridden() {
        let generation = gen();
        let ctx = GeminiContext {
            project_id: None,
            upstream_session_id: "s-g2",
            generation: &generation,
        };
        let inbound = json!({
            "contents": [{ "role": "user", "parts": [{ "text": "short thinking please ok" }] }],
            "generationConfig": { "thinkingConfig": { "includeThoughts": true, "thinkingBudget": 777 } }
        });
        let body = transform_gemini_request("gemini-3-pro", &inbound, &ctx).unwrap();
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            json!(777)
        );
    }

    #[tokio::test]
    async fn stream_preserves_thought_parts() {
        let stream = create_gemini_sse_stream(
            upstream_of(vec![json!({ "response": { "candidates": [{
                "content": { "parts": [
                    { "text": "mull", "thought": true, "thoughtSignature": "sig-g" },
                    { "text": "answer" }
                ]},
                "finishReason": "STOP"
            }]}})]),
            relay_opts("sid-gem"),
        );
        let collected: Vec<_> = stream.collect::<Vec<_>>().await;
        let text = collected
            .into_iter()
            .map(|b| String::from_utf8(b.unwrap().to_vec()).unwrap())
            .collect::<String>();
        assert!(text.contains("\"thought\":true"));
        assert!(text.contains("answer"));
        let (sig, _) = SignatureCache::global().get("sid-gem", "gemini-3-pro").unwrap();
        assert_eq!(sig, "sig-g");
    }

    #[tokio::test]
    async fn collector_merges_parts_and_keeps_usage() {
        let stream = create_gemini_sse_stream(
            upstream_of(vec![
                json!({ "candidates": [{ "content": { "parts": [{ "text": "one " }] } }] }),
                json!({ "candidates": [{
                    "content": { "parts": [{ "text": "two" }] },
                    "finishReason": "STOP"
                }], "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6 }}),
            ]),
            relay_opts("sid-gem-col"),
        );
        let out = collect_stream_to_response(stream).await.unwrap();
        assert_eq!(
            out["candidates"][0]["content"]["parts"][0]["text"],
            json!("one two")
        );
        assert_eq!(out["candidates"][0]["finishReason"], json!("STOP"));
        assert_eq!(out["usageMetadata"]["totalTokenCount"], json!(6));
    }
}
