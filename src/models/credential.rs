use serde::{Deserialize, Serialize};

/// One persisted upstream identity: a long-lived refresh secret plus the
/// short-lived access secret it currently maps to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Salted hash of the refresh secret; stable across restarts.
    pub id: String,
    pub refresh_secret: String,
    #[serde(default)]
    pub access_secret: String,
    #[serde(default)]
    pub access_expiry_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_true")]
    pub has_quota: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    pub created_at: i64,
}

fn default_true() -> bool {
    true
}

impl Credential {
    pub fn new(id: String, refresh_secret: String) -> Self {
        Self {
            id,
            refresh_secret,
            access_secret: String::new(),
            access_expiry_ms: 0,
            project_id: None,
            email: None,
            has_quota: true,
            enabled: true,
            disabled_reason: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn access_expired_within(&self, buffer_secs: i64) -> bool {
        self.access_secret.is_empty()
            || self.access_expiry_ms <= (chrono::Utc::now().timestamp() + buffer_secs) * 1000
    }
}

/// Accepted import payloads. Admin import hands the core arbitrary JSON;
/// anything that does not match one of these shapes is rejected with the
/// offending field names instead of being half-guessed.
#[derive(Debug, Clone)]
pub enum ImportShape {
    /// A full record previously exported by this service.
    Record(Credential),
    /// `{"refresh_token": "...", "project_id"?, "email"?}`
    RefreshToken {
        refresh_token: String,
        project_id: Option<String>,
        email: Option<String>,
    },
    /// A bare refresh-secret string.
    Bare(String),
}

impl ImportShape {
    pub fn parse(value: &serde_json::Value) -> Result<Self, String> {
        if let Some(s) = value.as_str() {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err("empty refresh secret string".to_string());
            }
            return Ok(ImportShape::Bare(trimmed.to_string()));
        }
        let obj = value
            .as_object()
            .ok_or_else(|| format!("unsupported import payload: {}", type_name(value)))?;
        if obj.contains_key("refresh_secret") && obj.contains_key("id") {
            let record: Credential = serde_json::from_value(value.clone())
                .map_err(|e| format!("malformed credential record: {}", e))?;
            return Ok(ImportShape::Record(record));
        }
        if let Some(token) = obj.get("refresh_token").and_then(|v| v.as_str()) {
            if token.trim().is_empty() {
                return Err("refresh_token is empty".to_string());
            }
            return Ok(ImportShape::RefreshToken {
                refresh_token: token.trim().to_string(),
                project_id: obj
                    .get("project_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                email: obj.get("email").and_then(|v| v.as_str()).map(str::to_string),
            });
        }
        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        Err(format!(
            "unrecognized import shape; expected a record, {{refresh_token}}, or a bare string (got keys: {:?})",
            keys
        ))
    }

    pub fn refresh_secret(&self) -> &str {
        match self {
            ImportShape::Record(c) => &c.refresh_secret,
            ImportShape::RefreshToken { refresh_token, .. } => refresh_token,
            ImportShape::Bare(s) => s,
        }
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
