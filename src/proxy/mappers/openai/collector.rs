use futures::StreamExt;
use serde_json::{json, Value};

use super::streaming::SseStream;

/// Collects a relayed OpenAI SSE stream into one `chat.completion` object.
/// Serves the non-stream shim: the upstream is always streamed, slow unary
/// requests otherwise hit upstream timeouts.
pub async fn collect_stream_to_json(mut stream: SseStream) -> Result<Value, String> {
    let mut id = String::new();
    let mut model = String::new();
    let mut created = 0i64;
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<Value> = None;

    while let Some(item) = stream.next().await {
        let bytes = item?;
        let text = String::from_utf8_lossy(&bytes);
        for line in text.lines() {
            let Some(raw) = line.strip_prefix("data: ") else {
                continue;
            };
            let raw = raw.trim();
            if raw == "[DONE]" {
                continue;
            }
            let Ok(chunk) = serde_json::from_str::<Value>(raw) else {
                continue;
            };
            if let Some(error) = chunk.get("error") {
                return Err(error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("stream error")
                    .to_string());
            }
            if id.is_empty() {
                if let Some(v) = chunk.get("id").and_then(|v| v.as_str()) {
                    id = v.to_string();
                }
            }
            if model.is_empty() {
                if let Some(v) = chunk.get("model").and_then(|v| v.as_str()) {
                    model = v.to_string();
                }
            }
            if created == 0 {
                created = chunk.get("created").and_then(|v| v.as_i64()).unwrap_or(0);
            }
            if let Some(u) = chunk.get("usage") {
                if !u.is_null() {
                    usage = Some(u.clone());
                }
            }
            let Some(choice) = chunk.pointer("/choices/0") else {
                continue;
            };
            if let Some(f) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                finish_reason = Some(f.to_string());
            }
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            if let Some(c) = delta.get("content").and_then(|c| c.as_str()) {
                content.push_str(c);
            }
            if let Some(r) = delta.get("reasoning_content").and_then(|r| r.as_str()) {
                reasoning.push_str(r);
            }
            if let Some(calls) = delta.get("tool_calls").and_then(|c| c.as_array()) {
                for call in calls {
                    let mut call = call.clone();
                    if let Some(obj) = call.as_object_mut() {
                        obj.remove("index");
                    }
                    tool_calls.push(call);
                }
            }
        }
    }

    let mut message = json!({ "role": "assistant", "content": content });
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }

    Ok(json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason.unwrap_or_else(|| "stop".to_string()),
        }],
        "usage": usage.unwrap_or_else(|| json!({
            "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0
        })),
    }))
}
