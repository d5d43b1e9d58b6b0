mod refresh;
mod store;
mod types;

pub use store::CredentialStore;
pub use types::PooledCredential;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{Credential, OAuthConfig};
use crate::proxy::cooldown::CooldownView;
use crate::proxy::quota::QuotaView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    RoundRobin,
    RequestCount(u32),
    QuotaExhausted,
}

impl RotationStrategy {
    pub fn from_config(strategy: &str, requests_per_credential: u32) -> Self {
        match strategy.trim().to_ascii_lowercase().as_str() {
            "request_count" => RotationStrategy::RequestCount(requests_per_credential.max(1)),
            "quota_exhausted" => RotationStrategy::QuotaExhausted,
            _ => RotationStrategy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub credential: PooledCredential,
    /// True when no credential passed the model filter and the pool fell
    /// back to the unfiltered order. Best-effort requests are not retried
    /// on rate-limit.
    pub best_effort: bool,
}

#[derive(Default)]
struct SelectionState {
    cursor: usize,
    counters: HashMap<String, u32>,
}

/// Rotation, lazy refresh and lifecycle for the credential fleet. Depends on
/// read-only quota/cooldown views, never on the concrete ledgers.
pub struct CredentialPool {
    store: Arc<CredentialStore>,
    entries: RwLock<Vec<PooledCredential>>,
    state: Mutex<SelectionState>,
    strategy: RwLock<RotationStrategy>,
    quota: Arc<dyn QuotaView>,
    cooldown: Arc<dyn CooldownView>,
    oauth: OAuthConfig,
    refresh_early_secs: i64,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CredentialPool {
    pub fn new(
        store: Arc<CredentialStore>,
        quota: Arc<dyn QuotaView>,
        cooldown: Arc<dyn CooldownView>,
        oauth: OAuthConfig,
        strategy: RotationStrategy,
    ) -> Self {
        let entries = store
            .read_all()
            .iter()
            .map(PooledCredential::from_record)
            .collect();
        let refresh_early_secs = oauth.refresh_early_secs;
        Self {
            store,
            entries: RwLock::new(entries),
            state: Mutex::new(SelectionState::default()),
            strategy: RwLock::new(strategy),
            quota,
            cooldown,
            oauth,
            refresh_early_secs,
            refresh_locks: DashMap::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn list(&self) -> Vec<PooledCredential> {
        self.entries.read().await.clone()
    }

    pub async fn get_by_id(&self, cred_id: &str) -> Option<PooledCredential> {
        self.entries
            .read()
            .await
            .iter()
            .find(|c| c.id == cred_id)
            .cloned()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub async fn strategy(&self) -> RotationStrategy {
        *self.strategy.read().await
    }

    /// Changing the strategy (or N) at runtime resets cursor and counters.
    pub async fn set_strategy(&self, strategy: RotationStrategy) {
        *self.strategy.write().await = strategy;
        let mut state = self.state.lock().await;
        state.cursor = 0;
        state.counters.clear();
        info!("Rotation strategy changed to {:?}", strategy);
    }

    fn passes_model_filter(&self, cred: &PooledCredential, model: Option<&str>) -> bool {
        match model {
            Some(m) => {
                self.quota.has_quota_for(&cred.id, m) && self.cooldown.available(&cred.id, m)
            }
            None => true,
        }
    }

    /// Picks the next credential per the active strategy. Enabled-only;
    /// model-filtered when a model is given, with the documented best-effort
    /// fallback when the filter empties the pool.
    pub async fn select(&self, model: Option<&str>) -> AppResult<Selection> {
        let strategy = *self.strategy.read().await;
        if strategy == RotationStrategy::QuotaExhausted {
            return self.select_quota_exhausted(model).await;
        }
        let entries = self.entries.read().await;
        let enabled: Vec<&PooledCredential> = entries.iter().filter(|c| c.enabled).collect();
        if enabled.is_empty() {
            return Err(AppError::Credential("no enabled credentials".to_string()));
        }
        let mut state = self.state.lock().await;

        match strategy {
            RotationStrategy::RoundRobin => {
                let len = enabled.len();
                for offset in 0..len {
                    let idx = (state.cursor + offset) % len;
                    if self.passes_model_filter(enabled[idx], model) {
                        state.cursor = (state.cursor + offset + 1) % len;
                        return Ok(Selection {
                            credential: enabled[idx].clone(),
                            best_effort: false,
                        });
                    }
                }
                let idx = state.cursor % len;
                state.cursor = (state.cursor + 1) % len;
                Ok(Selection {
                    credential: enabled[idx].clone(),
                    best_effort: true,
                })
            }
            RotationStrategy::RequestCount(n) => {
                let len = enabled.len();
                let primary = state.cursor % len;
                let mut chosen: Option<usize> = None;
                for offset in 0..len {
                    let idx = (primary + offset) % len;
                    if self.passes_model_filter(enabled[idx], model) {
                        chosen = Some(idx);
                        break;
                    }
                }
                let (idx, best_effort) = match chosen {
                    Some(idx) => (idx, false),
                    None => (primary, true),
                };
                let cred = enabled[idx].clone();
                let counter = state.counters.entry(cred.id.clone()).or_insert(0);
                *counter += 1;
                if *counter >= n {
                    *counter = 0;
                    if idx == primary {
                        state.cursor = (primary + 1) % len;
                    }
                }
                Ok(Selection {
                    credential: cred,
                    best_effort,
                })
            }
            // Handled before the locks are taken.
            RotationStrategy::QuotaExhausted => unreachable!("routed above"),
        }
    }

    async fn select_quota_exhausted(&self, model: Option<&str>) -> AppResult<Selection> {
        {
            let entries = self.entries.read().await;
            let enabled: Vec<&PooledCredential> = entries.iter().filter(|c| c.enabled).collect();
            if enabled.is_empty() {
                return Err(AppError::Credential("no enabled credentials".to_string()));
            }
            let with_quota: Vec<&PooledCredential> =
                enabled.iter().copied().filter(|c| c.has_quota).collect();
            if !with_quota.is_empty() {
                if let Some(cred) = with_quota
                    .iter()
                    .find(|c| self.passes_model_filter(c, model))
                {
                    return Ok(Selection {
                        credential: (*cred).clone(),
                        best_effort: false,
                    });
                }
                return Ok(Selection {
                    credential: with_quota[0].clone(),
                    best_effort: true,
                });
            }
        }
        // Every credential observed exhaustion: assume the upstream rolled
        // its quota window and rebuild the rotation from scratch.
        info!("quota_exhausted rotation emptied; resetting has_quota on all credentials");
        self.reset_all_has_quota().await?;
        let entries = self.entries.read().await;
        let first = entries
            .iter()
            .find(|c| c.enabled)
            .cloned()
            .ok_or_else(|| AppError::Credential("no enabled credentials".to_string()))?;
        let best_effort = !self.passes_model_filter(&first, model);
        Ok(Selection {
            credential: first,
            best_effort,
        })
    }

    async fn reset_all_has_quota(&self) -> AppResult<()> {
        let records: Vec<Credential> = {
            let mut entries = self.entries.write().await;
            for cred in entries.iter_mut() {
                cred.has_quota = true;
            }
            entries
                .iter()
                .map(|c| c.to_record(chrono::Utc::now().timestamp()))
                .collect()
        };
        self.store.merge_active(&records, None)
    }

    /// Select + lazy refresh: the returned credential always carries an
    /// access secret valid beyond the safety buffer, or the pool has run out
    /// of usable credentials for this call.
    pub async fn get(&self, model: Option<&str>) -> AppResult<Selection> {
        let attempts = self.len().await.max(1);
        let mut last_err: Option<String> = None;
        for _ in 0..attempts {
            let selection = self.select(model).await?;
            if !selection
                .credential
                .needs_refresh(self.refresh_early_secs)
            {
                return Ok(selection);
            }
            match self.ensure_fresh(&selection.credential.id).await {
                Ok(credential) => {
                    return Ok(Selection {
                        credential,
                        best_effort: selection.best_effort,
                    })
                }
                Err(e) => {
                    warn!(
                        "[W-POOL-REFRESH] {} unusable this round: {}",
                        selection.credential.display(),
                        e
                    );
                    last_err = Some(e.to_string());
                }
            }
        }
        Err(AppError::Credential(format!(
            "no credential with a usable access token: {}",
            last_err.unwrap_or_else(|| "pool empty".to_string())
        )))
    }

    /// Drops per-credential counters and indices, re-reads the store and
    /// re-mints upstream session IDs.
    pub async fn reload(&self) -> AppResult<usize> {
        let records = self.store.reload()?;
        let fresh: Vec<PooledCredential> =
            records.iter().map(PooledCredential::from_record).collect();
        let count = fresh.len();
        *self.entries.write().await = fresh;
        let mut state = self.state.lock().await;
        state.cursor = 0;
        state.counters.clear();
        info!("Credential pool reloaded: {} credentials", count);
        Ok(count)
    }

    pub async fn disable(&self, cred_id: &str, reason: &str) -> AppResult<()> {
        let record = {
            let mut entries = self.entries.write().await;
            let Some(cred) = entries.iter_mut().find(|c| c.id == cred_id) else {
                return Ok(());
            };
            cred.enabled = false;
            let mut record = cred.to_record(chrono::Utc::now().timestamp());
            record.disabled_reason = Some(reason.to_string());
            record
        };
        warn!(
            "[W-CREDENTIAL-DISABLED] {} disabled: {}",
            &cred_id[..cred_id.len().min(8)],
            reason
        );
        self.store.merge_active(&[], Some(&record))
    }

    pub async fn set_has_quota(&self, cred_id: &str, has_quota: bool) -> AppResult<()> {
        let record = {
            let mut entries = self.entries.write().await;
            let Some(cred) = entries.iter_mut().find(|c| c.id == cred_id) else {
                return Ok(());
            };
            cred.has_quota = has_quota;
            cred.to_record(chrono::Utc::now().timestamp())
        };
        self.store.merge_active(&[], Some(&record))
    }

    /// Forces a refresh before the credential's next use. In-memory only:
    /// the persisted expiry is corrected by the refresh that follows.
    pub async fn mark_access_expired(&self, cred_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(cred) = entries.iter_mut().find(|c| c.id == cred_id) {
            cred.access_expiry_ms = 0;
        }
    }

    pub async fn set_project_id(&self, cred_id: &str, project_id: &str) -> AppResult<()> {
        let record = {
            let mut entries = self.entries.write().await;
            let Some(cred) = entries.iter_mut().find(|c| c.id == cred_id) else {
                return Ok(());
            };
            cred.project_id = Some(project_id.to_string());
            cred.to_record(chrono::Utc::now().timestamp())
        };
        self.store.merge_active(&[], Some(&record))
    }

    /// Imports a new credential. Two credentials with the same refresh
    /// secret are forbidden; the salted ID makes that a simple ID collision.
    pub async fn add_credential(
        &self,
        refresh_secret: &str,
        project_id: Option<String>,
        email: Option<String>,
    ) -> AppResult<String> {
        let id = self.store.compute_id(refresh_secret);
        {
            let entries = self.entries.read().await;
            if entries.iter().any(|c| c.id == id) {
                return Err(AppError::Credential(
                    "credential with identical refresh secret already exists".to_string(),
                ));
            }
        }
        let mut record = Credential::new(id.clone(), refresh_secret.to_string());
        record.project_id = project_id;
        record.email = email;
        self.store.merge_active(&[], Some(&record))?;
        self.entries
            .write()
            .await
            .push(PooledCredential::from_record(&record));
        Ok(id)
    }

    /// Administrative import entry point: accepts any of the documented
    /// payload shapes, rejects anything else with the offending field names.
    pub async fn import_value(&self, value: &serde_json::Value) -> AppResult<String> {
        let shape = crate::models::ImportShape::parse(value).map_err(AppError::Credential)?;
        match shape {
            crate::models::ImportShape::Record(record) => {
                self.add_credential(&record.refresh_secret, record.project_id, record.email)
                    .await
            }
            crate::models::ImportShape::RefreshToken {
                refresh_token,
                project_id,
                email,
            } => self.add_credential(&refresh_token, project_id, email).await,
            crate::models::ImportShape::Bare(secret) => {
                self.add_credential(&secret, None, None).await
            }
        }
    }

    pub async fn remove_credential(&self, cred_id: &str) -> AppResult<()> {
        let mut list = self.store.read_all();
        list.retain(|c| c.id != cred_id);
        self.store.write_all(list)?;
        self.entries.write().await.retain(|c| c.id != cred_id);
        self.refresh_locks.remove(cred_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cooldown::CooldownLedger;
    use crate::proxy::quota::QuotaLedger;
    use std::time::Duration;

    async fn pool_with(
        secrets: &[&str],
        strategy: RotationStrategy,
    ) -> (CredentialPool, Arc<QuotaLedger>, Arc<CooldownLedger>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path()).unwrap());
        let records: Vec<Credential> = secrets
            .iter()
            .map(|s| {
                let mut c = Credential::new(store.compute_id(s), s.to_string());
                c.access_secret = "ya29.valid".to_string();
                c.access_expiry_ms = (chrono::Utc::now().timestamp() + 3600) * 1000;
                c
            })
            .collect();
        store.write_all(records).unwrap();
        let quota = Arc::new(QuotaLedger::new(3600, None));
        let cooldown = Arc::new(CooldownLedger::new());
        let pool = CredentialPool::new(
            store,
            quota.clone(),
            cooldown.clone(),
            OAuthConfig::default(),
            strategy,
        );
        (pool, quota, cooldown, dir)
    }

    #[tokio::test]
    async fn round_robin_visits_every_credential() {
        let (pool, _, _, _dir) = pool_with(&["a", "b", "c"], RotationStrategy::RoundRobin).await;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(pool.select(None).await.unwrap().credential.id);
        }
        assert_eq!(seen[0], seen[3]);
        assert_eq!(seen[1], seen[4]);
        assert_eq!(seen[2], seen[5]);
        let unique: std::collections::HashSet<_> = seen.iter().take(3).collect();
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn request_count_advances_every_n_calls() {
        let (pool, _, _, _dir) =
            pool_with(&["a", "b"], RotationStrategy::RequestCount(3)).await;
        let mut ids = Vec::new();
        for _ in 0..7 {
            ids.push(pool.select(None).await.unwrap().credential.id);
        }
        // 3 on the first, 3 on the second, then back to the first.
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[1], ids[2]);
        assert_ne!(ids[2], ids[3]);
        assert_eq!(ids[3], ids[5]);
        assert_eq!(ids[6], ids[0]);
    }

    #[tokio::test]
    async fn model_filter_skips_cooled_credentials() {
        let (pool, _, cooldown, _dir) =
            pool_with(&["a", "b"], RotationStrategy::RoundRobin).await;
        let first = pool.select(None).await.unwrap().credential.id;
        cooldown.mark(&first, "gemini-3-pro", Duration::from_secs(60));
        for _ in 0..4 {
            let sel = pool.select(Some("gemini-3-pro")).await.unwrap();
            assert_ne!(sel.credential.id, first);
            assert!(!sel.best_effort);
        }
    }

    #[tokio::test]
    async fn all_filtered_out_falls_back_best_effort() {
        let (pool, _, cooldown, _dir) =
            pool_with(&["a", "b"], RotationStrategy::RoundRobin).await;
        for cred in pool.list().await {
            cooldown.mark(&cred.id, "gemini-3-pro", Duration::from_secs(60));
        }
        let sel = pool.select(Some("gemini-3-pro")).await.unwrap();
        assert!(sel.best_effort);
        // Cooldowns stay in place.
        assert!(!cooldown.available(&sel.credential.id, "gemini-3-pro"));
    }

    #[tokio::test]
    async fn quota_exhausted_rotation_self_heals() {
        let (pool, _, _, _dir) =
            pool_with(&["a", "b"], RotationStrategy::QuotaExhausted).await;
        let first = pool.select(None).await.unwrap().credential.id;
        pool.set_has_quota(&first, false).await.unwrap();
        let second = pool.select(None).await.unwrap().credential.id;
        assert_ne!(first, second);
        pool.set_has_quota(&second, false).await.unwrap();
        // Both exhausted: the pool assumes the window rolled and resets.
        let healed = pool.select(None).await.unwrap().credential.id;
        assert_eq!(healed, first);
        assert!(pool.list().await.iter().all(|c| c.has_quota));
    }

    #[tokio::test]
    async fn disabled_credentials_are_never_selected() {
        let (pool, _, _, _dir) = pool_with(&["a", "b"], RotationStrategy::RoundRobin).await;
        let victim = pool.select(None).await.unwrap().credential.id;
        pool.disable(&victim, "test").await.unwrap();
        for _ in 0..4 {
            assert_ne!(pool.select(None).await.unwrap().credential.id, victim);
        }
    }

    #[tokio::test]
    async fn reload_remints_session_ids_and_resets_cursor() {
        let (pool, _, _, _dir) = pool_with(&["a", "b"], RotationStrategy::RoundRobin).await;
        let before: Vec<String> = pool.list().await.iter().map(|c| c.session_id.clone()).collect();
        let _ = pool.select(None).await.unwrap();
        pool.reload().await.unwrap();
        let after: Vec<String> = pool.list().await.iter().map(|c| c.session_id.clone()).collect();
        assert!(before.iter().all(|sid| !after.contains(sid)));
    }

    #[tokio::test]
    async fn import_accepts_documented_shapes_and_rejects_unknown() {
        let (pool, _, _, _dir) = pool_with(&[], RotationStrategy::RoundRobin).await;
        let id = pool
            .import_value(&serde_json::json!("1//0bare-secret"))
            .await
            .unwrap();
        assert!(!id.is_empty());
        pool.import_value(&serde_json::json!({
            "refresh_token": "1//0obj-secret",
            "email": "x@y.test"
        }))
        .await
        .unwrap();
        assert_eq!(pool.len().await, 2);
        let err = pool
            .import_value(&serde_json::json!({ "access": "nope" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("access"));
    }

    #[tokio::test]
    async fn duplicate_refresh_secret_is_rejected() {
        let (pool, _, _, _dir) = pool_with(&["a"], RotationStrategy::RoundRobin).await;
        let err = pool
            .add_credential("a", None, None)
            .await
            .expect_err("duplicate must be rejected");
        assert!(err.to_string().contains("identical refresh secret"));
    }

    #[tokio::test]
    async fn strategy_change_resets_counters() {
        let (pool, _, _, _dir) =
            pool_with(&["a", "b"], RotationStrategy::RequestCount(3)).await;
        let _ = pool.select(None).await.unwrap();
        let _ = pool.select(None).await.unwrap();
        pool.set_strategy(RotationStrategy::RequestCount(3)).await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(pool.select(None).await.unwrap().credential.id);
        }
        assert_eq!(ids[0], ids[2]);
    }
}
