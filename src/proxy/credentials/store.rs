use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine as _;

use crate::error::{AppError, AppResult};
use crate::models::Credential;
use crate::utils::crypto;

const ACCOUNTS_FILE: &str = "accounts";
const SALT_FILE: &str = "accounts.salt";

/// Encrypted-at-rest credential list plus the ID salt, behind an in-memory
/// cached view. Writes are serialized and land via temp-file-then-rename so
/// concurrent readers never observe a torn blob.
pub struct CredentialStore {
    path: PathBuf,
    salt: Vec<u8>,
    cache: Mutex<Vec<Credential>>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// A blob that exists but cannot be decrypted is fatal: silently starting
    /// with zero credentials would look like data loss to the operator.
    pub fn open(data_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(ACCOUNTS_FILE);
        let salt = Self::load_or_create_salt(&data_dir.join(SALT_FILE))?;
        let initial = if path.exists() {
            Self::read_blob(&path)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            salt,
            cache: Mutex::new(initial),
            write_lock: Mutex::new(()),
        })
    }

    fn load_or_create_salt(salt_path: &Path) -> AppResult<Vec<u8>> {
        if salt_path.exists() {
            let encoded = std::fs::read_to_string(salt_path)?;
            return base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| AppError::Store(format!("salt file corrupt: {}", e)));
        }
        let salt = crypto::generate_salt();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&salt);
        let tmp = salt_path.with_extension("salt.tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, salt_path)?;
        tracing::info!("Credential ID salt created at {:?}", salt_path);
        Ok(salt)
    }

    fn read_blob(path: &Path) -> AppResult<Vec<Credential>> {
        let encrypted = std::fs::read_to_string(path)?;
        if encrypted.trim().is_empty() {
            return Ok(Vec::new());
        }
        let plaintext = crypto::decrypt_string(encrypted.trim()).map_err(|e| {
            AppError::Store(format!(
                "[E-STORE-DECRYPT] credential blob cannot be decrypted: {}. \
                 Verify ENCRYPTION_KEY matches the key the blob was written with.",
                e
            ))
        })?;
        serde_json::from_str(&plaintext)
            .map_err(|e| AppError::Store(format!("credential blob malformed: {}", e)))
    }

    fn write_blob(&self, list: &[Credential]) -> AppResult<()> {
        let _guard = self.write_lock.lock().expect("store write lock");
        let plaintext = serde_json::to_string(list)
            .map_err(|e| AppError::Store(format!("serialize failed: {}", e)))?;
        let encrypted =
            crypto::encrypt_string(&plaintext).map_err(AppError::Store)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, encrypted)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get_salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn compute_id(&self, refresh_secret: &str) -> String {
        crypto::salted_id(&self.salt, refresh_secret)
    }

    pub fn read_all(&self) -> Vec<Credential> {
        self.cache.lock().expect("store cache lock").clone()
    }

    /// Re-reads the on-disk blob, refreshing the cached view. Used by hot
    /// reload so external writers (admin import) become visible.
    pub fn reload(&self) -> AppResult<Vec<Credential>> {
        let list = if self.path.exists() {
            Self::read_blob(&self.path)?
        } else {
            Vec::new()
        };
        *self.cache.lock().expect("store cache lock") = list.clone();
        Ok(list)
    }

    /// Replaces the whole list. Duplicate refresh secrets collapse onto one
    /// record (last wins) so the unique-ID invariant holds on disk.
    pub fn write_all(&self, list: Vec<Credential>) -> AppResult<()> {
        let mut by_id: HashMap<String, Credential> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for cred in list {
            if !by_id.contains_key(&cred.id) {
                order.push(cred.id.clone());
            }
            by_id.insert(cred.id.clone(), cred);
        }
        let deduped: Vec<Credential> = order
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect();
        self.write_blob(&deduped)?;
        *self.cache.lock().expect("store cache lock") = deduped;
        Ok(())
    }

    /// Interleaves the pool's in-memory working copies with the canonical
    /// on-disk list: records named in `active` take the working-copy values
    /// for mutable fields, records unknown to the pool pass through, and an
    /// optional single update is applied last. Applying the same input twice
    /// equals applying it once.
    pub fn merge_active(
        &self,
        active: &[Credential],
        single_updated: Option<&Credential>,
    ) -> AppResult<()> {
        let mut canonical = if self.path.exists() {
            Self::read_blob(&self.path)?
        } else {
            Vec::new()
        };
        let active_by_id: HashMap<&str, &Credential> =
            active.iter().map(|c| (c.id.as_str(), c)).collect();

        for record in canonical.iter_mut() {
            if let Some(working) = active_by_id.get(record.id.as_str()) {
                record.access_secret = working.access_secret.clone();
                record.access_expiry_ms = working.access_expiry_ms;
                record.project_id = working.project_id.clone();
                record.email = working.email.clone();
                record.has_quota = working.has_quota;
                record.enabled = working.enabled;
                record.disabled_reason = working.disabled_reason.clone();
            }
        }
        // Working copies missing from disk (fresh imports) are appended.
        for working in active {
            if !canonical.iter().any(|c| c.id == working.id) {
                canonical.push(working.clone());
            }
        }
        if let Some(updated) = single_updated {
            match canonical.iter_mut().find(|c| c.id == updated.id) {
                Some(slot) => *slot = updated.clone(),
                None => canonical.push(updated.clone()),
            }
        }

        self.write_blob(&canonical)?;
        *self.cache.lock().expect("store cache lock") = canonical;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(store: &CredentialStore, secret: &str) -> Credential {
        Credential::new(store.compute_id(secret), secret.to_string())
    }

    #[test]
    fn salt_is_created_once_and_ids_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let id1 = {
            let store = CredentialStore::open(dir.path()).unwrap();
            store.compute_id("1//0secret")
        };
        let store = CredentialStore::open(dir.path()).unwrap();
        assert_eq!(store.compute_id("1//0secret"), id1);
        assert_ne!(store.compute_id("1//0other"), id1);
    }

    #[test]
    fn write_read_roundtrip_is_encrypted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        let cred = mk(&store, "1//0secret");
        store.write_all(vec![cred.clone()]).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(ACCOUNTS_FILE)).unwrap();
        assert!(!raw.contains("1//0secret"));

        let reopened = CredentialStore::open(dir.path()).unwrap();
        let list = reopened.read_all();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].refresh_secret, "1//0secret");
        assert_eq!(list[0].id, cred.id);
    }

    #[test]
    fn duplicate_refresh_secrets_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        let a = mk(&store, "1//0same");
        let b = mk(&store, "1//0same");
        store.write_all(vec![a, b]).unwrap();
        assert_eq!(store.read_all().len(), 1);
    }

    #[test]
    fn merge_active_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        let mut a = mk(&store, "1//0a");
        let b = mk(&store, "1//0b");
        store.write_all(vec![a.clone(), b.clone()]).unwrap();

        a.access_secret = "ya29.new".to_string();
        a.enabled = false;
        let active = vec![a.clone()];

        store.merge_active(&active, None).unwrap();
        let first = store.read_all();
        store.merge_active(&active, None).unwrap();
        let second = store.read_all();

        assert_eq!(first.len(), second.len());
        let merged = second.iter().find(|c| c.id == a.id).unwrap();
        assert_eq!(merged.access_secret, "ya29.new");
        assert!(!merged.enabled);
        // The record the pool never touched survives untouched.
        assert!(second.iter().any(|c| c.id == b.id && c.enabled));
    }

    #[test]
    fn merge_active_applies_single_update_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path()).unwrap();
        let a = mk(&store, "1//0a");
        store.write_all(vec![a.clone()]).unwrap();

        let mut updated = a.clone();
        updated.project_id = Some("proj-42".to_string());
        store.merge_active(&[], Some(&updated)).unwrap();

        let list = store.read_all();
        assert_eq!(list[0].project_id.as_deref(), Some("proj-42"));
    }

    #[test]
    fn corrupt_blob_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CredentialStore::open(dir.path()).unwrap();
            store.write_all(vec![mk(&store, "1//0a")]).unwrap();
        }
        std::fs::write(dir.path().join(ACCOUNTS_FILE), "AAAAgarbage").unwrap();
        assert!(CredentialStore::open(dir.path()).is_err());
    }
}
