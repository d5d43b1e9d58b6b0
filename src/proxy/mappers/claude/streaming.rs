use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use super::map_stop_reason;
use crate::proxy::mappers::common::{heartbeat_period, is_image_model};
use crate::proxy::mappers::openai::streaming::{
    drain_sse_lines, unwrap_envelope, RelayOptions, SseStream,
};
use crate::proxy::mappers::tool_names::ToolNameCache;
use crate::proxy::signature_cache::SignatureCache;
use crate::proxy::upstream::client::ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    None,
    Thinking,
    Text,
}

fn emit(event_type: &str, data: Value) -> Bytes {
    Bytes::from(format!(
        "event: {}\ndata: {}\n\n",
        event_type,
        serde_json::to_string(&data).unwrap_or_default()
    ))
}

fn stable_tool_use_id(func_call: &Value) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    serde_json::to_string(func_call)
        .unwrap_or_default()
        .hash(&mut hasher);
    format!("toolu_{:x}", hasher.finish())
}

/// Block state machine for one in-flight Claude response. Each upstream
/// event is fed in and the dialect events it produces are buffered in
/// arrival order.
struct ClaudeStreamState {
    message_id: String,
    model: String,
    block: BlockKind,
    block_index: usize,
    message_start_sent: bool,
    used_tools: bool,
    emitted_tool_calls: std::collections::HashSet<String>,
    pending_signature: Option<String>,
    reasoning_signature: Option<String>,
    tool_signature: Option<String>,
    reasoning_text: String,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    out: Vec<Bytes>,
}

impl ClaudeStreamState {
    fn new(model: String) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model,
            block: BlockKind::None,
            block_index: 0,
            message_start_sent: false,
            used_tools: false,
            emitted_tool_calls: std::collections::HashSet::new(),
            pending_signature: None,
            reasoning_signature: None,
            tool_signature: None,
            reasoning_text: String::new(),
            stop_reason: None,
            input_tokens: 0,
            output_tokens: 0,
            out: Vec::new(),
        }
    }

    fn ensure_message_start(&mut self) {
        if self.message_start_sent {
            return;
        }
        self.message_start_sent = true;
        let ev = emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": &self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": &self.model,
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": 0 }
                }
            }),
        );
        self.out.push(ev);
    }

    fn close_block(&mut self) {
        match self.block {
            BlockKind::None => return,
            BlockKind::Thinking => {
                if let Some(sig) = self.pending_signature.take() {
                    self.out.push(emit(
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": { "type": "signature_delta", "signature": sig }
                        }),
                    ));
                }
            }
            BlockKind::Text => {}
        }
        self.out.push(emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        self.block = BlockKind::None;
        self.block_index += 1;
    }

    fn open_block(&mut self, kind: BlockKind, content_block: Value) {
        self.out.push(emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.block = kind;
    }

    fn handle_function_call(&mut self, func_call: &Value, signature: Option<String>) {
        self.used_tools = true;
        if let Some(sig) = signature {
            self.tool_signature = Some(sig);
        }
        let call_key = serde_json::to_string(func_call).unwrap_or_default();
        if !self.emitted_tool_calls.insert(call_key) {
            return;
        }
        self.close_block();
        let upstream_name = func_call
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let name = ToolNameCache::global().to_inbound(upstream_name);
        let args = func_call.get("args").cloned().unwrap_or_else(|| json!({}));
        let tool_id = stable_tool_use_id(func_call);
        self.out.push(emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": { "type": "tool_use", "id": tool_id, "name": name, "input": {} }
            }),
        ));
        self.out.push(emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": {
                    "type": "input_json_delta",
                    "partial_json": serde_json::to_string(&args).unwrap_or_default()
                }
            }),
        ));
        self.out.push(emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        self.block_index += 1;
    }

    fn handle_thought_text(&mut self, text: &str, signature: Option<String>) {
        if let Some(sig) = signature {
            self.pending_signature = Some(sig.clone());
            self.reasoning_signature = Some(sig);
        }
        if text.is_empty() {
            return;
        }
        self.reasoning_text.push_str(text);
        if self.block != BlockKind::Thinking {
            self.close_block();
            self.open_block(
                BlockKind::Thinking,
                json!({ "type": "thinking", "thinking": "" }),
            );
        }
        self.out.push(emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": { "type": "thinking_delta", "thinking": text }
            }),
        ));
    }

    fn handle_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.block != BlockKind::Text {
            self.close_block();
            self.open_block(BlockKind::Text, json!({ "type": "text", "text": "" }));
        }
        self.out.push(emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": { "type": "text_delta", "text": text }
            }),
        ));
    }

    fn ingest(&mut self, data: &Value, image_sink: &dyn crate::proxy::images::ImageSink) {
        if let Some(u) = data.get("usageMetadata") {
            self.input_tokens = u
                .get("promptTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(self.input_tokens);
            self.output_tokens = u
                .get("candidatesTokenCount")
                .and_then(|v| v.as_u64())
                .unwrap_or(self.output_tokens);
        }
        let Some(candidate) = data.pointer("/candidates/0") else {
            return;
        };
        self.ensure_message_start();

        if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
            for part in parts {
                let is_thought = part
                    .get("thought")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let signature = part
                    .get("thoughtSignature")
                    .or_else(|| part.get("thought_signature"))
                    .and_then(|s| s.as_str())
                    .map(str::to_string);

                if let Some(func_call) = part.get("functionCall") {
                    self.handle_function_call(func_call, signature);
                    continue;
                }
                if is_thought {
                    let text = part.get("text").and_then(|t| t.as_str()).unwrap_or("");
                    self.handle_thought_text(text, signature);
                    continue;
                }
                let mut text_out = part
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string();
                if let Some(img) = part.get("inlineData") {
                    let mime = img
                        .get("mimeType")
                        .and_then(|v| v.as_str())
                        .unwrap_or("image/png");
                    let data_b64 = img.get("data").and_then(|v| v.as_str()).unwrap_or("");
                    if !data_b64.is_empty() {
                        match image_sink.save_image(mime, data_b64) {
                            Ok(url) => text_out.push_str(&format!("![image]({})", url)),
                            Err(e) => tracing::warn!("[W-IMAGE-SINK] save failed: {}", e),
                        }
                    }
                }
                self.handle_text(&text_out);
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(|f| f.as_str()) {
            self.stop_reason = Some(map_stop_reason(reason, self.used_tools).to_string());
        }
    }

    fn finish(&mut self, errored: bool) {
        self.ensure_message_start();
        self.close_block();
        if !errored {
            self.out.push(emit(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": self.stop_reason.clone().unwrap_or_else(|| "end_turn".to_string()),
                        "stop_sequence": Value::Null
                    },
                    "usage": { "input_tokens": self.input_tokens, "output_tokens": self.output_tokens }
                }),
            ));
        }
        self.out
            .push(emit("message_stop", json!({ "type": "message_stop" })));
    }

    fn drain(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.out)
    }
}

/// Upstream SSE → Claude messages event stream: `message_start`, block
/// start/delta/stop triples, `message_delta`, exactly one `message_stop`.
pub fn create_claude_sse_stream(mut upstream: ByteStream, opts: RelayOptions) -> SseStream {
    let mut buffer = BytesMut::new();
    let image_model = is_image_model(&opts.model);

    let stream = async_stream::stream! {
        let mut state = ClaudeStreamState::new(opts.model.clone());
        let mut error_occurred = false;

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
                                state.ingest(&data, opts.image_sink.as_ref());
                                for ev in state.drain() {
                                    yield Ok::<Bytes, String>(ev);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("[E-STREAM-RELAY] upstream stream error: {}", e);
                            state.ensure_message_start();
                            state.out.push(emit("error", json!({
                                "type": "error",
                                "error": { "type": "upstream_error", "message": e.to_string() }
                            })));
                            for ev in state.drain() {
                                yield Ok::<Bytes, String>(ev);
                            }
                            error_occurred = true;
                            break;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Ok::<Bytes, String>(emit("ping", json!({ "type": "ping" })));
                }
            }
        }

        state.finish(error_occurred);
        for ev in state.drain() {
            yield Ok::<Bytes, String>(ev);
        }

        // Write-back: tool signatures win over reasoning signatures.
        if opts.policy.should_cache(state.used_tools, image_model) {
            if let Some(signature) = state
                .tool_signature
                .clone()
                .filter(|_| opts.cache_tool_signatures)
                .or_else(|| state.reasoning_signature.clone())
            {
                SignatureCache::global().store(
                    &opts.session_fingerprint,
                    &opts.model,
                    signature,
                    &state.reasoning_text,
                );
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::images::InlineImageSink;
    use crate::proxy::signature_cache::CachePolicy;
    use std::sync::Arc;

    fn opts(fingerprint: &str) -> RelayOptions {
        RelayOptions {
            model: "claude-sonnet-4-5".to_string(),
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

    async fn collect_events(mut stream: SseStream) -> Vec<(String, Value)> {
        let mut events = Vec::new();
        let mut pending_type: Option<String> = None;
        while let Some(item) = stream.next().await {
            let text = String::from_utf8(item.unwrap().to_vec()).unwrap();
            for line in text.lines() {
                if let Some(t) = line.strip_prefix("event: ") {
                    pending_type = Some(t.to_string());
                } else if let Some(d) = line.strip_prefix("data: ") {
                    if let (Some(t), Ok(v)) = (pending_type.take(), serde_json::from_str::<Value>(d)) {
                        events.push((t, v));
                    }
                }
            }
        }
        events
    }

    #[tokio::test]
    async fn lifecycle_events_are_ordered_with_one_message_stop() {
        let stream = create_claude_sse_stream(
            upstream_of(vec![
                json!({ "candidates": [{ "content": { "parts": [
                    { "text": "chewing on it", "thought": true, "thoughtSignature": "sig-c" }
                ]}}]}),
                json!({ "candidates": [{
                    "content": { "parts": [{ "text": "Done." }] },
                    "finishReason": "STOP"
                }], "usageMetadata": { "promptTokenCount": 8, "candidatesTokenCount": 3 }}),
            ]),
            opts("sid-claude-life"),
        );
        let events = collect_events(stream).await;
        let types: Vec<&str> = events.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta", // signature_delta closing the thinking block
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let stops = types.iter().filter(|t| **t == "message_stop").count();
        assert_eq!(stops, 1);
        let (_, delta) = events.iter().find(|(t, _)| t == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], json!("end_turn"));
        assert_eq!(delta["usage"]["output_tokens"], json!(3));
        // The signature landed in the cache under (session, model).
        let (sig, text) = SignatureCache::global()
            .get("sid-claude-life", "claude-sonnet-4-5")
            .unwrap();
        assert_eq!(sig, "sig-c");
        assert_eq!(text, "chewing on it");
    }

    #[tokio::test]
    async fn tool_use_blocks_carry_recovered_names() {
        let stream = create_claude_sse_stream(
            upstream_of(vec![json!({ "candidates": [{
                "content": { "parts": [
                    { "functionCall": { "name": "probe_tool", "args": { "q": "x" } } }
                ]},
                "finishReason": "STOP"
            }]})]),
            opts("sid-claude-tools"),
        );
        let events = collect_events(stream).await;
        let (_, start) = events
            .iter()
            .find(|(t, v)| t == "content_block_start" && v["content_block"]["type"] == json!("tool_use"))
            .unwrap();
        assert_eq!(start["content_block"]["name"], json!("probe_tool"));
        let (_, delta) = events
            .iter()
            .find(|(t, v)| t == "content_block_delta" && v["delta"]["type"] == json!("input_json_delta"))
            .unwrap();
        assert_eq!(delta["delta"]["partial_json"], json!("{\"q\":\"x\"}"));
        let (_, md) = events.iter().find(|(t, _)| t == "message_delta").unwrap();
        assert_eq!(md["delta"]["stop_reason"], json!("tool_use"));
    }

    #[tokio::test]
    async fn duplicated_function_calls_emit_once() {
        let call = json!({ "functionCall": { "name": "probe_tool", "args": { "q": "x" } } });
        let stream = create_claude_sse_stream(
            upstream_of(vec![
                json!({ "candidates": [{ "content": { "parts": [call.clone()] } }] }),
                json!({ "candidates": [{ "content": { "parts": [call] }, "finishReason": "STOP" }] }),
            ]),
            opts("sid-claude-dup"),
        );
        let events = collect_events(stream).await;
        let tool_starts = events
            .iter()
            .filter(|(t, v)| t == "content_block_start" && v["content_block"]["type"] == json!("tool_use"))
            .count();
        assert_eq!(tool_starts, 1);
    }

    #[tokio::test]
    async fn stream_error_still_terminates_with_message_stop() {
        let failing: ByteStream = Box::pin(futures::stream::once(async {
            Err::<Bytes, reqwest::Error>(make_reqwest_error().await)
        }));
        let stream = create_claude_sse_stream(failing, opts("sid-claude-err"));
        let events = collect_events(stream).await;
        let types: Vec<&str> = events.iter().map(|(t, _)| t.as_str()).collect();
        assert!(types.contains(&"error"));
        assert_eq!(types.last(), Some(&"message_stop"));
    }

    async fn make_reqwest_error() -> reqwest::Error {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(1))
            .build()
            .unwrap()
            .get("http://127.0.0.1:9")
            .send()
            .await
            .unwrap_err()
    }
}
