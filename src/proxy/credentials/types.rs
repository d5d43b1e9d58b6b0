use crate::models::Credential;

/// In-memory working copy of one pooled credential. The upstream session ID
/// lives only here: it is re-minted on every pool (re)load and never
/// persisted.
#[derive(Debug, Clone)]
pub struct PooledCredential {
    pub id: String,
    pub refresh_secret: String,
    pub access_secret: String,
    pub access_expiry_ms: i64,
    pub project_id: Option<String>,
    pub email: Option<String>,
    pub has_quota: bool,
    pub enabled: bool,
    pub session_id: String,
}

impl PooledCredential {
    pub fn from_record(record: &Credential) -> Self {
        Self {
            id: record.id.clone(),
            refresh_secret: record.refresh_secret.clone(),
            access_secret: record.access_secret.clone(),
            access_expiry_ms: record.access_expiry_ms,
            project_id: record.project_id.clone(),
            email: record.email.clone(),
            has_quota: record.has_quota,
            enabled: record.enabled,
            session_id: crate::proxy::session::mint_upstream_session_id(),
        }
    }

    pub fn to_record(&self, created_at: i64) -> Credential {
        Credential {
            id: self.id.clone(),
            refresh_secret: self.refresh_secret.clone(),
            access_secret: self.access_secret.clone(),
            access_expiry_ms: self.access_expiry_ms,
            project_id: self.project_id.clone(),
            email: self.email.clone(),
            has_quota: self.has_quota,
            enabled: self.enabled,
            disabled_reason: None,
            created_at,
        }
    }

    pub fn needs_refresh(&self, buffer_secs: i64) -> bool {
        self.access_secret.is_empty()
            || self.access_expiry_ms <= (chrono::Utc::now().timestamp() + buffer_secs) * 1000
    }

    /// Label safe for logs: email when known, truncated ID otherwise.
    pub fn display(&self) -> String {
        match &self.email {
            Some(email) => email.clone(),
            None => format!("cred-{}", &self.id[..self.id.len().min(8)]),
        }
    }
}
