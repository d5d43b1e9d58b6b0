use futures::StreamExt;
use serde_json::{json, Value};

use crate::proxy::mappers::openai::streaming::SseStream;

/// Collects a relayed Claude event stream into one messages-API response.
/// Serves the non-stream shim for `/v1/messages`.
pub async fn collect_stream_to_message(mut stream: SseStream) -> Result<Value, String> {
    let mut message = json!({
        "id": "",
        "type": "message",
        "role": "assistant",
        "content": [],
        "model": "",
        "stop_reason": "end_turn",
        "stop_sequence": Value::Null,
        "usage": { "input_tokens": 0, "output_tokens": 0 }
    });
    let mut blocks: Vec<Value> = Vec::new();
    let mut pending_type: Option<String> = None;

    while let Some(item) = stream.next().await {
        let bytes = item?;
        let text = String::from_utf8_lossy(&bytes).to_string();
        for line in text.lines() {
            if let Some(t) = line.strip_prefix("event: ") {
                pending_type = Some(t.trim().to_string());
                continue;
            }
            let Some(raw) = line.strip_prefix("data: ") else {
                continue;
            };
            let Some(event_type) = pending_type.take() else {
                continue;
            };
            let Ok(data) = serde_json::from_str::<Value>(raw) else {
                continue;
            };
            match event_type.as_str() {
                "message_start" => {
                    if let Some(m) = data.get("message") {
                        message["id"] = m.get("id").cloned().unwrap_or(json!(""));
                        message["model"] = m.get("model").cloned().unwrap_or(json!(""));
                        if let Some(usage) = m.get("usage") {
                            message["usage"]["input_tokens"] =
                                usage.get("input_tokens").cloned().unwrap_or(json!(0));
                        }
                    }
                }
                "content_block_start" => {
                    if let Some(block) = data.get("content_block") {
                        blocks.push(block.clone());
                    }
                }
                "content_block_delta" => {
                    let Some(last) = blocks.last_mut() else {
                        continue;
                    };
                    let Some(delta) = data.get("delta") else {
                        continue;
                    };
                    match delta.get("type").and_then(|t| t.as_str()) {
                        Some("text_delta") => {
                            if let (Some(slot), Some(t)) = (
                                last.get_mut("text"),
                                delta.get("text").and_then(|t| t.as_str()),
                            ) {
                                *slot = json!(format!(
                                    "{}{}",
                                    slot.as_str().unwrap_or(""),
                                    t
                                ));
                            }
                        }
                        Some("thinking_delta") => {
                            if let (Some(slot), Some(t)) = (
                                last.get_mut("thinking"),
                                delta.get("thinking").and_then(|t| t.as_str()),
                            ) {
                                *slot = json!(format!(
                                    "{}{}",
                                    slot.as_str().unwrap_or(""),
                                    t
                                ));
                            }
                        }
                        Some("signature_delta") => {
                            if let Some(sig) = delta.get("signature") {
                                last["signature"] = sig.clone();
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(fragment) =
                                delta.get("partial_json").and_then(|p| p.as_str())
                            {
                                let existing = last
                                    .get("_partial_json")
                                    .and_then(|p| p.as_str())
                                    .unwrap_or("")
                                    .to_string();
                                last["_partial_json"] = json!(existing + fragment);
                            }
                        }
                        _ => {}
                    }
                }
                "message_delta" => {
                    if let Some(reason) = data.pointer("/delta/stop_reason") {
                        message["stop_reason"] = reason.clone();
                    }
                    if let Some(output) = data.pointer("/usage/output_tokens") {
                        message["usage"]["output_tokens"] = output.clone();
                    }
                }
                "error" => {
                    return Err(data
                        .pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("stream error")
                        .to_string());
                }
                _ => {}
            }
        }
    }

    // Streamed tool inputs re-parse into structured input values.
    for block in blocks.iter_mut() {
        if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
            if let Some(fragment) = block.get("_partial_json").and_then(|p| p.as_str()) {
                if let Ok(input) = serde_json::from_str::<Value>(fragment) {
                    block["input"] = input;
                }
            }
        }
        if let Some(obj) = block.as_object_mut() {
            obj.remove("_partial_json");
        }
    }
    message["content"] = Value::Array(blocks);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn stream_of(events: Vec<(&str, Value)>) -> SseStream {
        let items: Vec<Result<Bytes, String>> = events
            .into_iter()
            .map(|(t, d)| {
                Ok(Bytes::from(format!(
                    "event: {}\ndata: {}\n\n",
                    t,
                    serde_json::to_string(&d).unwrap()
                )))
            })
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn assembles_thinking_text_and_tool_blocks() {
        let events = vec![
            (
                "message_start",
                json!({ "type": "message_start", "message": {
                    "id": "msg_1", "model": "claude-sonnet-4-5",
                    "usage": { "input_tokens": 12, "output_tokens": 0 }
                }}),
            ),
            (
                "content_block_start",
                json!({ "type": "content_block_start", "index": 0,
                        "content_block": { "type": "thinking", "thinking": "" } }),
            ),
            (
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 0,
                        "delta": { "type": "thinking_delta", "thinking": "hmm" } }),
            ),
            (
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 0,
                        "delta": { "type": "signature_delta", "signature": "sig-z" } }),
            ),
            ("content_block_stop", json!({ "type": "content_block_stop", "index": 0 })),
            (
                "content_block_start",
                json!({ "type": "content_block_start", "index": 1,
                        "content_block": { "type": "text", "text": "" } }),
            ),
            (
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 1,
                        "delta": { "type": "text_delta", "text": "Hi " } }),
            ),
            (
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 1,
                        "delta": { "type": "text_delta", "text": "there" } }),
            ),
            ("content_block_stop", json!({ "type": "content_block_stop", "index": 1 })),
            (
                "content_block_start",
                json!({ "type": "content_block_start", "index": 2,
                        "content_block": { "type": "tool_use", "id": "toolu_1", "name": "t", "input": {} } }),
            ),
            (
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 2,
                        "delta": { "type": "input_json_delta", "partial_json": "{\"a\":" } }),
            ),
            (
                "content_block_delta",
                json!({ "type": "content_block_delta", "index": 2,
                        "delta": { "type": "input_json_delta", "partial_json": "1}" } }),
            ),
            ("content_block_stop", json!({ "type": "content_block_stop", "index": 2 })),
            (
                "message_delta",
                json!({ "type": "message_delta",
                        "delta": { "stop_reason": "tool_use", "stop_sequence": null },
                        "usage": { "input_tokens": 12, "output_tokens": 9 } }),
            ),
            ("message_stop", json!({ "type": "message_stop" })),
        ];
        let message = collect_stream_to_message(stream_of(events)).await.unwrap();
        assert_eq!(message["id"], json!("msg_1"));
        let content = message["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(content[0]["thinking"], json!("hmm"));
        assert_eq!(content[0]["signature"], json!("sig-z"));
        assert_eq!(content[1]["text"], json!("Hi there"));
        assert_eq!(content[2]["input"]["a"], json!(1));
        assert!(content[2].get("_partial_json").is_none());
        assert_eq!(message["stop_reason"], json!("tool_use"));
        assert_eq!(message["usage"]["output_tokens"], json!(9));
    }

    #[tokio::test]
    async fn error_event_aborts_collection() {
        let events = vec![(
            "error",
            json!({ "type": "error", "error": { "type": "upstream_error", "message": "broke" } }),
        )];
        let err = collect_stream_to_message(stream_of(events)).await.unwrap_err();
        assert_eq!(err, "broke");
    }
}
