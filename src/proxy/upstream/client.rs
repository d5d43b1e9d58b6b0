use bytes::Bytes;
use futures::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::pin::Pin;
use tokio::time::Duration;

use crate::models::UpstreamConfig;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// 429: retry on another credential after cooling this one down.
    RetryableRateLimit,
    /// 503 carrying the capacity-exhausted marker: retry like a rate limit.
    CapacityExhausted,
    /// 403 permission-denied: the credential is dead for this upstream.
    NoPermission,
    /// Remaining 403 bodies: the request itself is oversized.
    ContextTooLong,
    /// 401 or a missing/expired access secret.
    AuthNeeded,
    Other,
}

#[derive(Debug)]
pub struct UpstreamError {
    pub status_code: u16,
    pub body_text: String,
    pub kind: UpstreamErrorKind,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream {} ({:?}): {}", self.status_code, self.kind, self.body_text)
    }
}

impl UpstreamError {
    pub fn transport(message: String) -> Self {
        Self {
            status_code: 0,
            body_text: message,
            kind: UpstreamErrorKind::Other,
        }
    }

    pub fn classify(status: u16, body: &str) -> UpstreamErrorKind {
        match status {
            429 => UpstreamErrorKind::RetryableRateLimit,
            503 if body.contains("MODEL_CAPACITY_EXHAUSTED") => {
                UpstreamErrorKind::CapacityExhausted
            }
            403 => {
                let lower = body.to_ascii_lowercase();
                if lower.contains("permission_denied")
                    || lower.contains("caller does not have permission")
                {
                    UpstreamErrorKind::NoPermission
                } else {
                    UpstreamErrorKind::ContextTooLong
                }
            }
            401 => UpstreamErrorKind::AuthNeeded,
            _ => UpstreamErrorKind::Other,
        }
    }

    pub fn from_response(status: StatusCode, body: String) -> Self {
        let kind = Self::classify(status.as_u16(), &body);
        Self {
            status_code: status.as_u16(),
            body_text: body,
            kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            UpstreamErrorKind::RetryableRateLimit | UpstreamErrorKind::CapacityExhausted
        )
    }

    /// 429 bodies that carry the explicit quota marker flip the credential's
    /// coarse has_quota flag rather than just cooling it down.
    pub fn is_quota_exhausted(&self) -> bool {
        self.status_code == 429 && self.body_text.contains("QUOTA_EXHAUSTED")
    }
}

static RETRY_DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:retryDelay["':\s]+|retry in\s+)(\d+(?:\.\d+)?)s"#).expect("retry delay regex")
});

/// Extracts an upstream-suggested retry delay from a 429 body, in ms.
pub fn parse_retry_delay_ms(body: &str) -> Option<u64> {
    RETRY_DELAY_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
}

/// Which HTTP engine carries the request. The fingerprinting dialer is an
/// external capability; when it is not compiled in or fails to initialize,
/// the standard client serves the identical interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialerBackend {
    Fingerprint,
    Standard,
}

pub struct UpstreamClient {
    client: Client,
    backend: DialerBackend,
    base_url: String,
    user_agent: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self::with_base_url(config, format!("{}/v1internal", config.host()))
    }

    pub fn with_base_url(config: &UpstreamConfig, base_url: String) -> Self {
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| crate::constants::USER_AGENT.clone());

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .read_timeout(Duration::from_secs(config.idle_timeout_secs))
            .user_agent(user_agent.clone());

        let proxy_url = config
            .proxy
            .clone()
            .or_else(crate::utils::http::proxy_url_from_env);
        if let Some(url) = proxy_url {
            match reqwest::Proxy::all(&url) {
                Ok(proxy) => {
                    builder = builder.proxy(proxy);
                    tracing::info!("UpstreamClient enabled proxy: {}", url);
                }
                Err(e) => tracing::error!("[E-PROXY-URL] invalid proxy url {}: {}", url, e),
            }
        }

        let client = builder
            .build()
            .expect("Failed to create upstream HTTP client");
        // The fingerprinting dialer registers itself out of band; absent
        // that, the standard client is the active backend.
        Self {
            client,
            backend: DialerBackend::Standard,
            base_url,
            user_agent,
        }
    }

    pub fn backend(&self) -> DialerBackend {
        self.backend
    }

    fn build_url(&self, method: &str, query_string: Option<&str>) -> String {
        match query_string {
            Some(qs) => format!("{}:{}?{}", self.base_url, method, qs),
            None => format!("{}:{}", self.base_url, method),
        }
    }

    async fn post(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query_string: Option<&str>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = self.build_url(method, query_string);
        self.client
            .post(&url)
            .bearer_auth(access_token)
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent)
            .header("Accept-Encoding", "gzip")
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(format!("request to {} failed: {}", url, e)))
    }

    /// Single-shot call; the parsed JSON body on success, a classified error
    /// otherwise.
    pub async fn call_unary(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
    ) -> Result<Value, UpstreamError> {
        let response = self.post(method, access_token, body, None).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_response(status, text));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::transport(format!("response parse failed: {}", e)))
    }

    /// SSE call; the raw byte stream on success (status already verified),
    /// a classified error otherwise.
    pub async fn call_stream(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
    ) -> Result<ByteStream, UpstreamError> {
        let response = self
            .post(method, access_token, body, Some("alt=sse"))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_response(status, text));
        }
        Ok(Box::pin(response.bytes_stream()))
    }
}
