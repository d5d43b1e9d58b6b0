use serde::{Deserialize, Serialize};

use crate::constants::OAUTH_TOKEN_URL;
use crate::models::OAuthConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Outcome of one refresh attempt, classified so the pool can decide whether
/// the credential should survive the failure.
#[derive(Debug)]
pub enum RefreshError {
    /// 400/403 from the token endpoint: the grant is dead, disable.
    Rejected { status: u16, body: String },
    /// Anything else: transient, keep the credential.
    Transient(String),
}

impl std::fmt::Display for RefreshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshError::Rejected { status, body } => {
                write!(f, "refresh rejected ({}): {}", status, body)
            }
            RefreshError::Transient(msg) => write!(f, "refresh failed: {}", msg),
        }
    }
}

pub async fn refresh_access_token(
    oauth: &OAuthConfig,
    refresh_secret: &str,
) -> Result<TokenResponse, RefreshError> {
    let client = crate::utils::http::get_long_client();

    let mut params: Vec<(&str, String)> = vec![
        ("client_id", oauth.client_id.clone()),
        ("refresh_token", refresh_secret.to_string()),
        ("grant_type", "refresh_token".to_string()),
    ];
    if !oauth.client_secret.is_empty() {
        params.push(("client_secret", oauth.client_secret.clone()));
    }

    let response = client
        .post(OAUTH_TOKEN_URL)
        .form(&params)
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                RefreshError::Transient(format!(
                    "unable to reach the authorization server: {}",
                    e
                ))
            } else {
                RefreshError::Transient(e.to_string())
            }
        })?;

    let status = response.status();
    if status.is_success() {
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| RefreshError::Transient(format!("refresh body parse failed: {}", e)))?;
        tracing::debug!("Token refreshed, expires in {}s", token.expires_in);
        Ok(token)
    } else {
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            400 | 403 => Err(RefreshError::Rejected {
                status: status.as_u16(),
                body,
            }),
            code => Err(RefreshError::Transient(format!("HTTP {}: {}", code, body))),
        }
    }
}

/// Caller-side expiry stamp: the token endpoint reports a relative lifetime.
pub fn expiry_ms_from_now(expires_in_secs: i64) -> i64 {
    (chrono::Utc::now().timestamp() + expires_in_secs) * 1000
}
