use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stable session fingerprints so consecutive turns of one conversation hit
/// the same signature-cache slot regardless of inbound dialect.
///
/// Only the first substantive user message is hashed; model names and
/// timestamps are deliberately left out so every turn of the same
/// conversation maps to the same ID.
pub struct SessionFingerprint;

const MIN_ANCHOR_LEN: usize = 10;

impl SessionFingerprint {
    fn finish(hasher: Sha256) -> String {
        let hash = format!("{:x}", hasher.finalize());
        format!("sid-{}", &hash[..16])
    }

    fn is_anchor(text: &str) -> bool {
        let clean = text.trim();
        clean.len() > MIN_ANCHOR_LEN && !clean.contains("<system-reminder>")
    }

    /// Fingerprint from an ordered (role, text) message view. Each dialect
    /// handler flattens its own message type into this shape.
    pub fn from_messages<'a, I>(messages: I) -> String
    where
        I: IntoIterator<Item = (&'a str, String)> + Clone,
    {
        let mut hasher = Sha256::new();
        let mut anchored = false;
        for (role, text) in messages.clone() {
            if role != "user" {
                continue;
            }
            if Self::is_anchor(&text) {
                hasher.update(text.trim().as_bytes());
                anchored = true;
                break;
            }
        }
        if !anchored {
            // Probe-sized conversations fall back to hashing the last message.
            if let Some((role, text)) = messages.into_iter().last() {
                hasher.update(role.as_bytes());
                hasher.update(text.as_bytes());
            }
        }
        Self::finish(hasher)
    }

    /// Fingerprint from a raw Gemini-native `contents` array.
    pub fn from_gemini_contents(body: &Value) -> String {
        let mut hasher = Sha256::new();
        let mut anchored = false;
        if let Some(contents) = body.get("contents").and_then(|v| v.as_array()) {
            for content in contents {
                if content.get("role").and_then(|v| v.as_str()) != Some("user") {
                    continue;
                }
                let Some(parts) = content.get("parts").and_then(|v| v.as_array()) else {
                    continue;
                };
                let combined: String = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join(" ");
                if Self::is_anchor(&combined) {
                    hasher.update(combined.trim().as_bytes());
                    anchored = true;
                    break;
                }
            }
        }
        if !anchored {
            hasher.update(body.to_string().as_bytes());
        }
        Self::finish(hasher)
    }
}

/// Random per-credential session identifier carried in upstream requests so
/// the upstream correlates a run of calls. Re-minted on every reload.
pub fn mint_upstream_session_id() -> String {
    format!("s-{}", uuid::Uuid::new_v4())
}
