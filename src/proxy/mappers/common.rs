use serde_json::{json, Map, Value};

use crate::models::GenerationConfig;
use crate::proxy::signature_cache::SignatureCache;

/// Thinking budgets the effort labels map onto.
pub const THINKING_BUDGET_LOW: i64 = 1024;
pub const THINKING_BUDGET_MEDIUM: i64 = 16_000;
pub const THINKING_BUDGET_HIGH: i64 = 32_000;

pub fn is_gemini_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("gemini")
}

pub fn is_image_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    lower.contains("-image") || lower.contains("banana")
}

/// Concatenates the contiguous head run of inbound system text with the
/// operator-configured instruction and the optional official prompt. Empty
/// strings disable their half; `None` means no systemInstruction at all.
pub fn merge_system_texts(inbound_head: &[String], gen: &GenerationConfig) -> Option<String> {
    let mut operator_parts: Vec<&str> = Vec::new();
    let official = gen.official_prompt.trim();
    let instruction = gen.system_instruction.trim();
    let official_first = gen.official_prompt_position.eq_ignore_ascii_case("before");
    if official_first && !official.is_empty() {
        operator_parts.push(official);
    }
    if !instruction.is_empty() {
        operator_parts.push(instruction);
    }
    if !official_first && !official.is_empty() {
        operator_parts.push(official);
    }

    let mut sections: Vec<String> = operator_parts.iter().map(|s| s.to_string()).collect();
    sections.extend(
        inbound_head
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    );
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

pub fn system_instruction_value(text: &str) -> Value {
    json!({ "role": "user", "parts": [{ "text": text }] })
}

/// Effort labels map to fixed budgets; explicit budgets override; zero
/// disables thinking outright.
pub fn resolve_thinking_budget(
    effort: Option<&str>,
    explicit: Option<i64>,
    default_budget: i64,
) -> i64 {
    if let Some(budget) = explicit {
        return budget.max(0);
    }
    match effort.map(|e| e.trim().to_ascii_lowercase()) {
        Some(ref e) if e == "low" => THINKING_BUDGET_LOW,
        Some(ref e) if e == "medium" => THINKING_BUDGET_MEDIUM,
        Some(ref e) if e == "high" => THINKING_BUDGET_HIGH,
        _ => default_budget,
    }
}

pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub max_output_tokens: Option<i64>,
    pub thinking_budget: i64,
    pub response_mime_type: Option<String>,
}

pub fn build_generation_config(params: &GenerationParams) -> Value {
    let mut cfg = Map::new();
    if let Some(t) = params.temperature {
        cfg.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = params.top_p {
        cfg.insert("topP".to_string(), json!(p));
    }
    if let Some(k) = params.top_k {
        cfg.insert("topK".to_string(), json!(k));
    }
    if let Some(m) = params.max_output_tokens {
        cfg.insert("maxOutputTokens".to_string(), json!(m));
    }
    if params.thinking_budget > 0 {
        cfg.insert(
            "thinkingConfig".to_string(),
            json!({ "includeThoughts": true, "thinkingBudget": params.thinking_budget }),
        );
    } else {
        cfg.insert(
            "thinkingConfig".to_string(),
            json!({ "includeThoughts": false, "thinkingBudget": 0 }),
        );
    }
    if let Some(mime) = &params.response_mime_type {
        cfg.insert("responseMimeType".to_string(), json!(mime));
    }
    Value::Object(cfg)
}

/// Assembles the flat upstream request body.
pub fn build_upstream_body(
    model: &str,
    project_id: Option<&str>,
    session_id: &str,
    contents: Vec<Value>,
    system_instruction: Option<Value>,
    tools: Option<Value>,
    generation_config: Value,
) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(model));
    if let Some(project) = project_id {
        body.insert("project".to_string(), json!(project));
    }
    body.insert("sessionId".to_string(), json!(session_id));
    body.insert("contents".to_string(), Value::Array(contents));
    if let Some(system) = system_instruction {
        body.insert("systemInstruction".to_string(), system);
    }
    if let Some(tools) = tools {
        body.insert("tools".to_string(), tools);
    }
    body.insert("generationConfig".to_string(), generation_config);
    Value::Object(body)
}

/// Cached thought part for reattachment on the next turn of a session, so
/// the upstream can resume its hidden reasoning trace.
pub fn cached_thought_part(session_fingerprint: &str, model: &str) -> Option<Value> {
    let (signature, text) = SignatureCache::global().get(session_fingerprint, model)?;
    Some(json!({
        "text": text,
        "thought": true,
        "thoughtSignature": signature,
    }))
}

/// Splits a data URL into (mime, base64 payload).
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta);
    if mime.is_empty() {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

/// Converts OpenAI-style function declarations into the upstream tools
/// array, renaming through the reversible cache.
pub fn function_declarations(tools: &[Value]) -> Option<Value> {
    let cache = super::tool_names::ToolNameCache::global();
    let mut declarations = Vec::new();
    for tool in tools {
        let func = tool.get("function").unwrap_or(tool);
        let Some(name) = func.get("name").and_then(|v| v.as_str()) else {
            continue;
        };
        let mut decl = Map::new();
        decl.insert("name".to_string(), json!(cache.to_upstream(name)));
        if let Some(desc) = func.get("description").and_then(|v| v.as_str()) {
            decl.insert("description".to_string(), json!(desc));
        }
        let params = func
            .get("parameters")
            .or_else(|| func.get("input_schema"))
            .cloned()
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
        decl.insert("parameters".to_string(), sanitize_schema(params));
        declarations.push(Value::Object(decl));
    }
    if declarations.is_empty() {
        None
    } else {
        Some(json!([{ "functionDeclarations": declarations }]))
    }
}

/// The upstream's schema dialect rejects a handful of JSON-Schema keywords
/// common in the wild; strip them recursively rather than bouncing requests.
fn sanitize_schema(mut schema: Value) -> Value {
    const DROP: &[&str] = &[
        "$schema",
        "additionalProperties",
        "exclusiveMaximum",
        "exclusiveMinimum",
        "uniqueItems",
        "const",
    ];
    if let Some(obj) = schema.as_object_mut() {
        for key in DROP {
            obj.remove(*key);
        }
        for (_, value) in obj.iter_mut() {
            if value.is_object() || value.is_array() {
                *value = sanitize_schema(value.take());
            }
        }
    } else if let Some(arr) = schema.as_array_mut() {
        for value in arr.iter_mut() {
            if value.is_object() || value.is_array() {
                *value = sanitize_schema(value.take());
            }
        }
    }
    schema
}

/// Heartbeat cadence; zero disables by stretching the period out of reach.
pub fn heartbeat_period(interval_ms: u64) -> std::time::Duration {
    if interval_ms == 0 {
        std::time::Duration::from_secs(365 * 24 * 3600)
    } else {
        std::time::Duration::from_millis(interval_ms)
    }
}
