use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

const MAX_NAME_LEN: usize = 63;

/// Reversible mapping between inbound tool names and upstream-safe ones.
/// The upstream only accepts `[A-Za-z0-9_.-]` names starting with a letter
/// or underscore; inbound dialects allow more. Whatever we rename on the way
/// in is recovered byte-for-byte on the way out.
pub struct ToolNameCache {
    forward: Mutex<HashMap<String, String>>,
    reverse: Mutex<HashMap<String, String>>,
}

impl ToolNameCache {
    fn new() -> Self {
        Self {
            forward: Mutex::new(HashMap::new()),
            reverse: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static ToolNameCache {
        static INSTANCE: OnceLock<ToolNameCache> = OnceLock::new();
        INSTANCE.get_or_init(ToolNameCache::new)
    }

    fn sanitize_raw(name: &str) -> String {
        let mut out = String::with_capacity(name.len().min(MAX_NAME_LEN));
        for (i, ch) in name.chars().enumerate() {
            if out.len() >= MAX_NAME_LEN {
                break;
            }
            let valid = ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-';
            if i == 0 {
                if ch.is_ascii_alphabetic() || ch == '_' {
                    out.push(ch);
                } else {
                    out.push('_');
                    if valid {
                        out.push(ch);
                    }
                }
            } else if valid {
                out.push(ch);
            } else {
                out.push('_');
            }
        }
        if out.is_empty() {
            out.push('_');
        }
        out
    }

    /// Maps an inbound name to its upstream form, remembering the pair.
    pub fn to_upstream(&self, inbound: &str) -> String {
        if let Ok(forward) = self.forward.lock() {
            if let Some(existing) = forward.get(inbound) {
                return existing.clone();
            }
        }
        let mut candidate = Self::sanitize_raw(inbound);
        let mut forward = self.forward.lock().expect("tool name forward lock");
        let mut reverse = self.reverse.lock().expect("tool name reverse lock");
        // A different inbound name may already own this upstream form.
        let mut suffix = 1usize;
        while reverse
            .get(&candidate)
            .map(|owner| owner != inbound)
            .unwrap_or(false)
        {
            let tag = format!("_{}", suffix);
            let base_len = MAX_NAME_LEN.saturating_sub(tag.len());
            let mut base = Self::sanitize_raw(inbound);
            base.truncate(base_len);
            candidate = format!("{}{}", base, tag);
            suffix += 1;
        }
        forward.insert(inbound.to_string(), candidate.clone());
        reverse.insert(candidate.clone(), inbound.to_string());
        candidate
    }

    /// Recovers the inbound name an upstream functionCall refers to. Names
    /// never renamed pass through unchanged.
    pub fn to_inbound(&self, upstream: &str) -> String {
        if let Ok(reverse) = self.reverse.lock() {
            if let Some(original) = reverse.get(upstream) {
                return original.clone();
            }
        }
        upstream.to_string()
    }

    /// Cleanup hook for the periodic memory-tidy timer: the cache is
    /// bounded by the set of distinct tool names seen, which resets rarely.
    pub fn tidy(&self, max_entries: usize) {
        let mut forward = self.forward.lock().expect("tool name forward lock");
        if forward.len() > max_entries {
            forward.clear();
            self.reverse.lock().expect("tool name reverse lock").clear();
            tracing::debug!("[ToolNameCache] cleared after exceeding {} entries", max_entries);
        }
    }
}
