use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

use super::{map_finish_reason, OpenAIUsage};
use crate::proxy::images::ImageSink;
use crate::proxy::mappers::common::{heartbeat_period, is_image_model};
use crate::proxy::mappers::tool_names::ToolNameCache;
use crate::proxy::signature_cache::{CachePolicy, SignatureCache};
use crate::proxy::upstream::client::ByteStream;

pub type SseStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

#[derive(Clone)]
pub struct RelayOptions {
    pub model: String,
    pub session_fingerprint: String,
    pub heartbeat_ms: u64,
    pub policy: CachePolicy,
    pub cache_tool_signatures: bool,
    pub image_sink: Arc<dyn ImageSink>,
}

fn stable_tool_call_id(func_call: &Value) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    serde_json::to_string(func_call)
        .unwrap_or_default()
        .hash(&mut hasher);
    format!("call_{:x}", hasher.finish())
}

/// Splits buffered upstream bytes into complete `data:` payload lines.
pub fn drain_sse_lines(buffer: &mut BytesMut) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line_raw = buffer.split_to(pos + 1);
        if let Ok(line_str) = std::str::from_utf8(&line_raw) {
            let line = line_str.trim();
            if line.is_empty() || !line.starts_with("data:") {
                // Comment lines (": heartbeat") and bare event names are
                // ignored by the relay.
                continue;
            }
            let payload = line["data:".len()..].trim();
            if payload == "[DONE]" {
                continue;
            }
            out.push(payload.to_string());
        }
    }
    out
}

/// Unwraps the upstream response envelope when present.
pub fn unwrap_envelope(mut event: Value) -> Value {
    match event.get_mut("response").map(|v| v.take()) {
        Some(inner) if !inner.is_null() => inner,
        _ => event,
    }
}

/// Upstream SSE → OpenAI `chat.completion.chunk` SSE.
pub fn create_openai_sse_stream(mut upstream: ByteStream, opts: RelayOptions) -> SseStream {
    let mut buffer = BytesMut::new();
    let stream_id = format!("chatcmpl-{}", Uuid::new_v4());
    let created_ts = Utc::now().timestamp();
    let image_model = is_image_model(&opts.model);

    let stream = async_stream::stream! {
        let names = ToolNameCache::global();
        let mut emitted_tool_calls = std::collections::HashSet::new();
        let mut tool_call_indices: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        let mut final_usage: Option<OpenAIUsage> = None;
        let mut error_occurred = false;
        let mut reasoning_signature: Option<String> = None;
        let mut tool_signature: Option<String> = None;
        let mut reasoning_text = String::new();
        let mut saw_tool_calls = false;

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
                                let data = unwrap_envelope(event);
                                if let Some(u) = data.get("usageMetadata") {
                                    final_usage = Some(OpenAIUsage::from_usage_metadata(u));
                                }
                                let Some(candidates) = data.get("candidates").and_then(|c| c.as_array()) else { continue; };
                                for (idx, candidate) in candidates.iter().enumerate() {
                                    let parts = candidate
                                        .get("content")
                                        .and_then(|c| c.get("parts"))
                                        .and_then(|p| p.as_array());
                                    let mut content_out = String::new();
                                    let mut thought_out = String::new();

                                    if let Some(parts_list) = parts {
                                        for part in parts_list {
                                            let is_thought = part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false);
                                            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                                if is_thought {
                                                    thought_out.push_str(text);
                                                    reasoning_text.push_str(text);
                                                } else {
                                                    content_out.push_str(text);
                                                }
                                            }
                                            if let Some(sig) = part
                                                .get("thoughtSignature")
                                                .or_else(|| part.get("thought_signature"))
                                                .and_then(|s| s.as_str())
                                            {
                                                if part.get("functionCall").is_some() {
                                                    tool_signature = Some(sig.to_string());
                                                } else {
                                                    reasoning_signature = Some(sig.to_string());
                                                }
                                            }
                                            if let Some(img) = part.get("inlineData") {
                                                let mime = img.get("mimeType").and_then(|v| v.as_str()).unwrap_or("image/png");
                                                let data_b64 = img.get("data").and_then(|v| v.as_str()).unwrap_or("");
                                                if !data_b64.is_empty() {
                                                    match opts.image_sink.save_image(mime, data_b64) {
                                                        Ok(url) => content_out.push_str(&format!("![image]({})", url)),
                                                        Err(e) => tracing::warn!("[W-IMAGE-SINK] save failed: {}", e),
                                                    }
                                                }
                                            }
                                            if let Some(func_call) = part.get("functionCall") {
                                                saw_tool_calls = true;
                                                let call_key = serde_json::to_string(func_call).unwrap_or_default();
                                                if !emitted_tool_calls.contains(&call_key) {
                                                    emitted_tool_calls.insert(call_key.clone());
                                                    let next_index = tool_call_indices.len() as u32;
                                                    let tool_call_index = *tool_call_indices
                                                        .entry(call_key.clone())
                                                        .or_insert(next_index);
                                                    let upstream_name = func_call.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
                                                    let name = names.to_inbound(upstream_name);
                                                    let args = func_call.get("args").cloned().unwrap_or_else(|| json!({}));
                                                    let args_str = serde_json::to_string(&args).unwrap_or_default();
                                                    let call_id = stable_tool_call_id(func_call);

                                                    let tool_chunk = json!({
                                                        "id": &stream_id,
                                                        "object": "chat.completion.chunk",
                                                        "created": created_ts,
                                                        "model": &opts.model,
                                                        "choices": [{
                                                            "index": idx as u32,
                                                            "delta": {
                                                                "role": "assistant",
                                                                "tool_calls": [{
                                                                    "index": tool_call_index,
                                                                    "id": call_id,
                                                                    "type": "function",
                                                                    "function": { "name": name, "arguments": args_str }
                                                                }]
                                                            },
                                                            "finish_reason": Value::Null
                                                        }]
                                                    });
                                                    yield Ok::<Bytes, String>(Bytes::from(format!(
                                                        "data: {}\n\n",
                                                        serde_json::to_string(&tool_chunk).unwrap_or_default()
                                                    )));
                                                }
                                            }
                                        }
                                    }

                                    let upstream_finish = candidate
                                        .get("finishReason")
                                        .and_then(|f| f.as_str())
                                        .map(map_finish_reason);
                                    let finish_reason = if saw_tool_calls && upstream_finish.is_some() {
                                        Some("tool_calls")
                                    } else {
                                        upstream_finish
                                    };

                                    if !thought_out.is_empty() {
                                        let reasoning_chunk = json!({
                                            "id": &stream_id,
                                            "object": "chat.completion.chunk",
                                            "created": created_ts,
                                            "model": &opts.model,
                                            "choices": [{
                                                "index": idx as u32,
                                                "delta": { "role": "assistant", "content": Value::Null, "reasoning_content": thought_out },
                                                "finish_reason": Value::Null
                                            }]
                                        });
                                        yield Ok::<Bytes, String>(Bytes::from(format!(
                                            "data: {}\n\n",
                                            serde_json::to_string(&reasoning_chunk).unwrap_or_default()
                                        )));
                                    }

                                    if !content_out.is_empty() || finish_reason.is_some() {
                                        let mut chunk = json!({
                                            "id": &stream_id,
                                            "object": "chat.completion.chunk",
                                            "created": created_ts,
                                            "model": &opts.model,
                                            "choices": [{
                                                "index": idx as u32,
                                                "delta": { "content": content_out },
                                                "finish_reason": finish_reason
                                            }]
                                        });
                                        if finish_reason.is_some() {
                                            if let Some(ref usage) = final_usage {
                                                chunk["usage"] = serde_json::to_value(usage).unwrap_or_default();
                                            }
                                        }
                                        yield Ok::<Bytes, String>(Bytes::from(format!(
                                            "data: {}\n\n",
                                            serde_json::to_string(&chunk).unwrap_or_default()
                                        )));
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("[E-STREAM-RELAY] upstream stream error: {}", e);
                            let error_chunk = json!({
                                "id": &stream_id, "object": "chat.completion.chunk",
                                "created": created_ts, "model": &opts.model, "choices": [],
                                "error": { "type": "upstream_error", "message": e.to_string(), "code": "stream_error" }
                            });
                            yield Ok(Bytes::from(format!(
                                "data: {}\n\n",
                                serde_json::to_string(&error_chunk).unwrap_or_default()
                            )));
                            yield Ok(Bytes::from("data: [DONE]\n\n"));
                            error_occurred = true;
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok::<Bytes, String>(Bytes::from(": heartbeat\n\n"));
                }
            }
        }

        // Write-back: tool signatures win over reasoning signatures.
        if opts.policy.should_cache(saw_tool_calls, image_model) {
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

        if !error_occurred {
            yield Ok::<Bytes, String>(Bytes::from("data: [DONE]\n\n"));
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::images::InlineImageSink;

    fn opts(model: &str, fingerprint: &str) -> RelayOptions {
        RelayOptions {
            model: model.to_string(),
            session_fingerprint: fingerprint.to_string(),
            heartbeat_ms: 0,
            policy: CachePolicy::Always,
            cache_tool_signatures: true,
            image_sink: Arc::new(InlineImageSink),
        }
    }

    fn data_line(json: Value) -> Bytes {
        Bytes::from(format!("data: {}\n", serde_json::to_string(&json).unwrap()))
    }

    fn upstream_of(events: Vec<Value>) -> ByteStream {
        let items: Vec<Result<Bytes, reqwest::Error>> =
            events.into_iter().map(|e| Ok(data_line(e))).collect();
        Box::pin(futures::stream::iter(items))
    }

    async fn collect_payloads(mut stream: SseStream) -> (Vec<Value>, usize) {
        let mut payloads = Vec::new();
        let mut done_count = 0;
        while let Some(item) = stream.next().await {
            let bytes = item.expect("stream item");
            let text = String::from_utf8(bytes.to_vec()).expect("utf8");
            for line in text.lines() {
                let Some(raw) = line.strip_prefix("data: ") else { continue };
                if raw.trim() == "[DONE]" {
                    done_count += 1;
                    continue;
                }
                if let Ok(v) = serde_json::from_str::<Value>(raw) {
                    payloads.push(v);
                }
            }
        }
        (payloads, done_count)
    }

    #[tokio::test]
    async fn exactly_one_terminal_event() {
        let stream = create_openai_sse_stream(
            upstream_of(vec![json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "Hello" }] },
                    "finishReason": "STOP"
                }]
            })]),
            opts("gemini-3-pro", "sid-term"),
        );
        let (payloads, done) = collect_payloads(stream).await;
        assert_eq!(done, 1);
        assert_eq!(
            payloads[0]["choices"][0]["delta"]["content"],
            json!("Hello")
        );
        assert_eq!(payloads[0]["choices"][0]["finish_reason"], json!("stop"));
    }

    #[tokio::test]
    async fn reasoning_parts_surface_as_reasoning_content() {
        let stream = create_openai_sse_stream(
            upstream_of(vec![
                json!({ "response": { "candidates": [{
                    "content": { "parts": [
                        { "text": "pondering", "thought": true, "thoughtSignature": "sig-r1" }
                    ]}
                }]}}),
                json!({ "candidates": [{
                    "content": { "parts": [{ "text": "answer" }] },
                    "finishReason": "STOP"
                }]}),
            ]),
            opts("gemini-3-pro", "sid-reason"),
        );
        let (payloads, _) = collect_payloads(stream).await;
        assert_eq!(
            payloads[0]["choices"][0]["delta"]["reasoning_content"],
            json!("pondering")
        );
        // Signature written back under (session, model).
        let (sig, text) = SignatureCache::global()
            .get("sid-reason", "gemini-3-pro")
            .expect("signature cached");
        assert_eq!(sig, "sig-r1");
        assert_eq!(text, "pondering");
    }

    #[tokio::test]
    async fn tool_signature_takes_precedence_over_reasoning() {
        let stream = create_openai_sse_stream(
            upstream_of(vec![json!({ "candidates": [{
                "content": { "parts": [
                    { "text": "t", "thought": true, "thoughtSignature": "sig-think" },
                    { "functionCall": { "name": "probe", "args": {} }, "thoughtSignature": "sig-tool" }
                ]},
                "finishReason": "STOP"
            }]})]),
            opts("gemini-3-pro", "sid-prec"),
        );
        let _ = collect_payloads(stream).await;
        let (sig, _) = SignatureCache::global()
            .get("sid-prec", "gemini-3-pro")
            .unwrap();
        assert_eq!(sig, "sig-tool");
    }

    #[tokio::test]
    async fn tool_calls_get_stable_indices_and_finish_reason() {
        let stream = create_openai_sse_stream(
            upstream_of(vec![
                json!({ "candidates": [{ "content": { "parts": [
                    { "functionCall": { "name": "first_tool", "args": { "a": 1 } } }
                ]}}]}),
                json!({ "candidates": [{
                    "content": { "parts": [
                        { "functionCall": { "name": "second_tool", "args": { "b": 2 } } }
                    ]},
                    "finishReason": "STOP"
                }]}),
            ]),
            opts("gemini-3-pro", "sid-tools"),
        );
        let (payloads, _) = collect_payloads(stream).await;
        let mut indices = Vec::new();
        let mut finish = None;
        for p in &payloads {
            if let Some(calls) = p
                .pointer("/choices/0/delta/tool_calls")
                .and_then(|c| c.as_array())
            {
                indices.push(calls[0]["index"].as_u64().unwrap());
            }
            if let Some(f) = p.pointer("/choices/0/finish_reason").and_then(|f| f.as_str()) {
                finish = Some(f.to_string());
            }
        }
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(finish.as_deref(), Some("tool_calls"));
    }

    #[tokio::test]
    async fn inline_images_become_markdown_content() {
        let stream = create_openai_sse_stream(
            upstream_of(vec![json!({ "candidates": [{
                "content": { "parts": [
                    { "inlineData": { "mimeType": "image/png", "data": "QUJD" } }
                ]},
                "finishReason": "STOP"
            }]})]),
            opts("gemini-3-pro-image", "sid-img"),
        );
        let (payloads, _) = collect_payloads(stream).await;
        let content = payloads[0]["choices"][0]["delta"]["content"].as_str().unwrap();
        assert!(content.starts_with("![image](data:image/png;base64,"));
    }

    #[tokio::test]
    async fn usage_metadata_lands_on_final_chunk() {
        let stream = create_openai_sse_stream(
            upstream_of(vec![json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "x" }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15 }
            })]),
            opts("gemini-3-pro", "sid-usage"),
        );
        let (payloads, _) = collect_payloads(stream).await;
        let last = payloads.last().unwrap();
        assert_eq!(last["usage"]["prompt_tokens"], json!(10));
        assert_eq!(last["usage"]["total_tokens"], json!(15));
    }

    #[tokio::test]
    async fn never_policy_skips_signature_writeback() {
        let mut o = opts("gemini-3-pro", "sid-never");
        o.policy = CachePolicy::Never;
        let stream = create_openai_sse_stream(
            upstream_of(vec![json!({ "candidates": [{
                "content": { "parts": [{ "text": "t", "thought": true, "thoughtSignature": "sig-x" }] },
                "finishReason": "STOP"
            }]})]),
            o,
        );
        let _ = collect_payloads(stream).await;
        assert!(SignatureCache::global().get("sid-never", "gemini-3-pro").is_none());
    }
}
