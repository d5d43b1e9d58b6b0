use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

const SIGNATURE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const CACHE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Always,
    ToolsOrImage,
    Never,
}

impl CachePolicy {
    pub fn from_mode(mode: &str) -> Self {
        match mode.trim().to_ascii_lowercase().as_str() {
            "always" => CachePolicy::Always,
            "never" => CachePolicy::Never,
            _ => CachePolicy::ToolsOrImage,
        }
    }

    pub fn should_cache(&self, saw_tool_calls: bool, is_image_model: bool) -> bool {
        match self {
            CachePolicy::Always => true,
            CachePolicy::Never => false,
            CachePolicy::ToolsOrImage => saw_tool_calls || is_image_model,
        }
    }
}

#[derive(Clone, Debug)]
struct SignatureEntry {
    signature: String,
    thought_text: String,
    stored_at: SystemTime,
}

impl SignatureEntry {
    fn is_expired(&self) -> bool {
        self.stored_at.elapsed().unwrap_or(Duration::ZERO) > SIGNATURE_TTL
    }
}

/// Most recent upstream thought signature per (session, model), together with
/// one non-empty placeholder of the reasoning text it accompanied. Last
/// writer wins; reattachment happens in the request mappers.
pub struct SignatureCache {
    entries: Mutex<HashMap<(String, String), SignatureEntry>>,
}

impl SignatureCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static SignatureCache {
        static INSTANCE: OnceLock<SignatureCache> = OnceLock::new();
        INSTANCE.get_or_init(SignatureCache::new)
    }

    pub fn store(&self, session_id: &str, model_id: &str, signature: String, thought_text: &str) {
        if signature.is_empty() {
            return;
        }
        // The upstream rejects a reattached signature without at least one
        // character of thought text alongside it.
        let text = if thought_text.is_empty() {
            " ".to_string()
        } else {
            thought_text.to_string()
        };
        if let Ok(mut cache) = self.entries.lock() {
            tracing::debug!(
                "[SignatureCache] store {}/{} (len={})",
                session_id,
                model_id,
                signature.len()
            );
            cache.insert(
                (session_id.to_string(), model_id.to_string()),
                SignatureEntry {
                    signature,
                    thought_text: text,
                    stored_at: SystemTime::now(),
                },
            );
            if cache.len() > CACHE_LIMIT {
                let before = cache.len();
                cache.retain(|_, v| !v.is_expired());
                if cache.len() == before {
                    // TTL alone did not shed anything; drop the oldest half.
                    let mut stamps: Vec<_> =
                        cache.iter().map(|(k, v)| (k.clone(), v.stored_at)).collect();
                    stamps.sort_by_key(|(_, at)| *at);
                    for (key, _) in stamps.into_iter().take(before / 2) {
                        cache.remove(&key);
                    }
                }
            }
        }
    }

    pub fn get(&self, session_id: &str, model_id: &str) -> Option<(String, String)> {
        if let Ok(cache) = self.entries.lock() {
            if let Some(entry) = cache.get(&(session_id.to_string(), model_id.to_string())) {
                if !entry.is_expired() {
                    return Some((entry.signature.clone(), entry.thought_text.clone()));
                }
            }
        }
        None
    }

    /// Cleanup hook for the periodic memory-tidy timer.
    pub fn tidy(&self) {
        if let Ok(mut cache) = self.entries.lock() {
            let before = cache.len();
            cache.retain(|_, v| !v.is_expired());
            if before != cache.len() {
                tracing::debug!(
                    "[SignatureCache] tidy: {} -> {} entries",
                    before,
                    cache.len()
                );
            }
        }
    }

    #[cfg(test)]
    pub fn clear(&self) {
        if let Ok(mut cache) = self.entries.lock() {
            cache.clear();
        }
    }
}
