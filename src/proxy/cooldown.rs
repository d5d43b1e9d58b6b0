use dashmap::DashMap;
use std::time::Duration;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Timed exclusion of a (credential, model) pair after an upstream rate or
/// capacity signal. Purely in-memory; entries decay by comparison, eviction
/// happens on the periodic sweep.
#[derive(Default)]
pub struct CooldownLedger {
    entries: DashMap<(String, String), i64>,
}

impl CooldownLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Never shortens: a later deadline wins, an earlier one is ignored.
    pub fn mark(&self, cred_id: &str, model_id: &str, duration: Duration) {
        let deadline = now_ms() + duration.as_millis() as i64;
        let key = (cred_id.to_string(), model_id.to_string());
        let mut entry = self.entries.entry(key).or_insert(0);
        if deadline > *entry {
            *entry = deadline;
            tracing::debug!(
                "Cooldown set: {}/{} for {}ms",
                cred_id,
                model_id,
                duration.as_millis()
            );
        }
    }

    pub fn available(&self, cred_id: &str, model_id: &str) -> bool {
        match self
            .entries
            .get(&(cred_id.to_string(), model_id.to_string()))
        {
            Some(deadline) => now_ms() >= *deadline,
            None => true,
        }
    }

    pub fn clear(&self, cred_id: &str, model_id: Option<&str>) {
        match model_id {
            Some(model) => {
                self.entries
                    .remove(&(cred_id.to_string(), model.to_string()));
            }
            None => self.entries.retain(|(cred, _), _| cred != cred_id),
        }
    }

    /// Drops expired entries; called from the periodic tidy task.
    pub fn sweep(&self) {
        let now = now_ms();
        self.entries.retain(|_, deadline| *deadline > now);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Read-only view the credential pool selects against.
pub trait CooldownView: Send + Sync {
    fn available(&self, cred_id: &str, model_id: &str) -> bool;
}

impl CooldownView for CooldownLedger {
    fn available(&self, cred_id: &str, model_id: &str) -> bool {
        CooldownLedger::available(self, cred_id, model_id)
    }
}
