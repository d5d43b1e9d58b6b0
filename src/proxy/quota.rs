use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;

/// UI grouping only; every group reads the same underlying per-model entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelGroup {
    Claude,
    Gemini,
    Banana,
    Other,
}

impl ModelGroup {
    /// Case-insensitive substring matchers. The image-family matcher runs
    /// before the gemini matcher so `gemini-3-pro-image` lands in Banana.
    pub fn classify(model_id: &str) -> Self {
        let lower = model_id.to_ascii_lowercase();
        if lower.contains("claude") {
            ModelGroup::Claude
        } else if lower.contains("banana") || lower.contains("-image") {
            ModelGroup::Banana
        } else if lower.contains("gemini") {
            ModelGroup::Gemini
        } else {
            ModelGroup::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelGroup::Claude => "claude",
            ModelGroup::Gemini => "gemini",
            ModelGroup::Banana => "banana",
            ModelGroup::Other => "other",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuotaEntry {
    pub remaining_fraction: f64,
    pub reset_time: Option<String>,
    pub observed_at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-credential, per-model remaining-quota cache with periodic flush to a
/// side file. Absence of an entry means "assume quota".
pub struct QuotaLedger {
    entries: DashMap<String, HashMap<String, QuotaEntry>>,
    request_counters: DashMap<(String, ModelGroup), u32>,
    idle_ttl_ms: i64,
    flush_path: Option<PathBuf>,
}

impl QuotaLedger {
    pub fn new(idle_ttl_secs: u64, flush_path: Option<PathBuf>) -> Self {
        let ledger = Self {
            entries: DashMap::new(),
            request_counters: DashMap::new(),
            idle_ttl_ms: (idle_ttl_secs * 1000) as i64,
            flush_path,
        };
        ledger.load_from_disk();
        ledger
    }

    fn load_from_disk(&self) {
        let Some(path) = &self.flush_path else {
            return;
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return;
        };
        let Ok(doc) = serde_json::from_str::<serde_json::Value>(&raw) else {
            tracing::warn!("[W-QUOTA-FILE] quota file unreadable, starting empty");
            return;
        };
        let Some(quotas) = doc.get("quotas").and_then(|q| q.as_object()) else {
            return;
        };
        for (cred_id, record) in quotas {
            let observed = record
                .get("lastUpdated")
                .and_then(|v| v.as_i64())
                .unwrap_or_else(now_ms);
            let Some(models) = record.get("models").and_then(|m| m.as_object()) else {
                continue;
            };
            let mut per_model = HashMap::new();
            for (model, entry) in models {
                let remaining = entry.get("r").and_then(|v| v.as_f64()).unwrap_or(1.0);
                let reset = entry
                    .get("t")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                per_model.insert(
                    model.clone(),
                    QuotaEntry {
                        remaining_fraction: remaining,
                        reset_time: reset,
                        observed_at_ms: observed,
                    },
                );
            }
            self.entries.insert(cred_id.clone(), per_model);
        }
    }

    pub fn upsert(
        &self,
        cred_id: &str,
        model_id: &str,
        remaining_fraction: f64,
        reset_time: Option<String>,
    ) {
        let mut per_model = self.entries.entry(cred_id.to_string()).or_default();
        per_model.insert(
            model_id.to_string(),
            QuotaEntry {
                remaining_fraction: remaining_fraction.clamp(0.0, 1.0),
                reset_time,
                observed_at_ms: now_ms(),
            },
        );
    }

    pub fn snapshot(&self, cred_id: &str) -> HashMap<String, QuotaEntry> {
        self.entries
            .get(cred_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// True when nothing is known for the pair, or the last observation still
    /// showed headroom.
    pub fn has_quota_for(&self, cred_id: &str, model_id: &str) -> bool {
        match self.entries.get(cred_id) {
            Some(per_model) => match per_model.get(model_id) {
                Some(entry) => entry.remaining_fraction > 0.0,
                None => true,
            },
            None => true,
        }
    }

    /// Distinct model IDs observed across every credential's entries, in
    /// stable order. Feeds the caller-facing model catalogs.
    pub fn known_models(&self) -> Vec<String> {
        let mut out = std::collections::BTreeSet::new();
        for item in self.entries.iter() {
            for model in item.value().keys() {
                out.insert(model.clone());
            }
        }
        out.into_iter().collect()
    }

    pub fn record_request(&self, cred_id: &str, group: ModelGroup) {
        *self
            .request_counters
            .entry((cred_id.to_string(), group))
            .or_insert(0) += 1;
    }

    pub fn request_count(&self, cred_id: &str, group: ModelGroup) -> u32 {
        self.request_counters
            .get(&(cred_id.to_string(), group))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// UI figure only. The per-request cost constant mirrors the upstream's
    /// observed behavior; nothing schedules on this number.
    pub fn estimate_requests_remaining(
        &self,
        cred_id: &str,
        group: ModelGroup,
        min_remaining_fraction: f64,
    ) -> u32 {
        let remaining_pct = min_remaining_fraction.clamp(0.0, 1.0) * 100.0;
        let capacity = (remaining_pct / 0.6667).floor() as i64;
        let used = self.request_count(cred_id, group) as i64;
        (capacity - used).max(0) as u32
    }

    /// Drops entries that have not been observed within the idle TTL.
    pub fn prune(&self) {
        let cutoff = now_ms() - self.idle_ttl_ms;
        self.entries.retain(|_, per_model| {
            per_model.retain(|_, entry| entry.observed_at_ms >= cutoff);
            !per_model.is_empty()
        });
    }

    pub fn reset_counters(&self, cred_id: &str) {
        self.request_counters
            .retain(|(cred, _), _| cred != cred_id);
    }

    /// Serializes the documented side-file shape and writes it atomically.
    pub fn flush(&self) -> Result<(), String> {
        let Some(path) = &self.flush_path else {
            return Ok(());
        };
        let mut quotas = serde_json::Map::new();
        for item in self.entries.iter() {
            let mut models = serde_json::Map::new();
            let mut last_updated = 0i64;
            for (model, entry) in item.value() {
                last_updated = last_updated.max(entry.observed_at_ms);
                models.insert(
                    model.clone(),
                    json!({ "r": entry.remaining_fraction, "t": entry.reset_time }),
                );
            }
            quotas.insert(
                item.key().clone(),
                json!({ "lastUpdated": last_updated, "models": models }),
            );
        }
        let doc = json!({
            "meta": { "lastCleanup": now_ms(), "ttl": self.idle_ttl_ms },
            "quotas": quotas,
        });
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc).unwrap_or_default())
            .map_err(|e| format!("quota flush write failed: {}", e))?;
        std::fs::rename(&tmp, path).map_err(|e| format!("quota flush rename failed: {}", e))
    }
}

/// Read-only view the credential pool selects against.
pub trait QuotaView: Send + Sync {
    fn has_quota_for(&self, cred_id: &str, model_id: &str) -> bool;
}

impl QuotaView for QuotaLedger {
    fn has_quota_for(&self, cred_id: &str, model_id: &str) -> bool {
        QuotaLedger::has_quota_for(self, cred_id, model_id)
    }
}
