use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::proxy::credentials::{PooledCredential, Selection};
use crate::proxy::mappers::openai::streaming::SseStream;
use crate::proxy::quota::{ModelGroup, QuotaLedger};
use crate::proxy::state::AppState;
use crate::proxy::upstream::catalog;
use crate::proxy::upstream::client::{parse_retry_delay_ms, ByteStream, UpstreamError};
use crate::proxy::upstream::UpstreamErrorKind;

/// Base catalog; the quota path augments it with whatever the upstream
/// reports per credential.
pub const SUPPORTED_MODELS: &[&str] = &[
    "gemini-3-pro",
    "gemini-3-flash",
    "gemini-3-pro-image",
    "claude-sonnet-4-5",
    "claude-opus-4-5",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Claude,
    Gemini,
}

#[derive(Debug)]
pub struct PipelineError {
    pub status: StatusCode,
    pub error_type: String,
    pub message: String,
    pub code: String,
}

impl PipelineError {
    pub fn new(status: StatusCode, error_type: &str, message: String, code: &str) -> Self {
        Self {
            status,
            error_type: error_type.to_string(),
            message,
            code: code.to_string(),
        }
    }

    pub fn bad_request(message: String) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            message,
            "bad_inbound_request",
        )
    }

    pub fn no_credentials(message: String) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            message,
            "no_credentials_available",
        )
    }

    fn from_upstream(error: &UpstreamError) -> Self {
        match error.kind {
            UpstreamErrorKind::RetryableRateLimit => Self::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                error.body_text.clone(),
                "upstream_rate_limit",
            ),
            UpstreamErrorKind::CapacityExhausted => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded_error",
                error.body_text.clone(),
                "upstream_capacity",
            ),
            UpstreamErrorKind::NoPermission => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                error.body_text.clone(),
                "upstream_no_permission",
            ),
            UpstreamErrorKind::ContextTooLong => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                error.body_text.clone(),
                "upstream_context_too_long",
            ),
            _ => Self::new(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                error.body_text.clone(),
                "upstream_other",
            ),
        }
    }

    /// Every terminal state emits one fully-formed dialect response.
    pub fn into_response(self, dialect: Dialect) -> Response {
        let body = match dialect {
            Dialect::OpenAi => json!({
                "error": {
                    "message": self.message,
                    "type": self.error_type,
                    "code": self.code,
                }
            }),
            Dialect::Claude => json!({
                "type": "error",
                "error": { "type": self.error_type, "message": self.message }
            }),
            Dialect::Gemini => json!({
                "error": {
                    "code": self.status.as_u16(),
                    "message": self.message,
                    "status": self.error_type.to_uppercase(),
                }
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

enum Reaction {
    Retry,
    Fail(PipelineError),
}

/// Classified reaction to one failed upstream attempt: cools down or
/// disables the credential as the taxonomy dictates and decides whether the
/// attempt loop may continue.
async fn react_to_upstream_error(
    state: &AppState,
    selection: &Selection,
    model: &str,
    error: &UpstreamError,
) -> Reaction {
    let cred = &selection.credential;
    match error.kind {
        UpstreamErrorKind::RetryableRateLimit | UpstreamErrorKind::CapacityExhausted => {
            let default_ms = state.config.quota.cooldown_secs * 1000;
            let cooldown_ms = parse_retry_delay_ms(&error.body_text)
                .map(|hint| hint.min(default_ms))
                .unwrap_or(default_ms);
            state
                .cooldown
                .mark(&cred.id, model, Duration::from_millis(cooldown_ms));
            if error.is_quota_exhausted() {
                if let Err(e) = state.pool.set_has_quota(&cred.id, false).await {
                    warn!("[W-QUOTA-FLAG] persisting has_quota failed: {}", e);
                }
            }
            if selection.best_effort {
                // Best-effort attempts are not retried on rate signals.
                return Reaction::Fail(PipelineError::from_upstream(error));
            }
            Reaction::Retry
        }
        UpstreamErrorKind::NoPermission => {
            let reason = format!(
                "upstream permission denied: {}",
                &error.body_text[..error.body_text.len().min(200)]
            );
            if let Err(e) = state.pool.disable(&cred.id, &reason).await {
                warn!("[W-CREDENTIAL-DISABLE] persisting disable failed: {}", e);
            }
            Reaction::Fail(PipelineError::from_upstream(error))
        }
        UpstreamErrorKind::AuthNeeded => {
            state.pool.mark_access_expired(&cred.id).await;
            Reaction::Fail(PipelineError::from_upstream(error))
        }
        UpstreamErrorKind::ContextTooLong => Reaction::Fail(PipelineError::from_upstream(error)),
        UpstreamErrorKind::Other => {
            if error.status_code == 0 {
                // Transient transport fault: re-select and retry.
                Reaction::Retry
            } else {
                Reaction::Fail(PipelineError::from_upstream(error))
            }
        }
    }
}

pub struct Dispatched {
    pub stream: ByteStream,
    pub selection: Selection,
}

/// Credentials imported as bare refresh secrets carry no project; the
/// upstream rejects generation calls without one. First successful
/// discovery is persisted on the credential.
async fn ensure_project_id(state: &AppState, selection: &mut Selection) {
    if selection.credential.project_id.is_some() {
        return;
    }
    match catalog::discover_project_id(&state.upstream, &selection.credential.access_secret).await
    {
        Ok(project) => {
            info!(
                "Discovered project {} for {}",
                project,
                selection.credential.display()
            );
            if let Err(e) = state
                .pool
                .set_project_id(&selection.credential.id, &project)
                .await
            {
                warn!("[W-PROJECT-PERSIST] persisting project id failed: {}", e);
            }
            selection.credential.project_id = Some(project);
        }
        Err(e) => {
            warn!(
                "[W-PROJECT-DISCOVERY] {} has no project and discovery failed: {}",
                selection.credential.display(),
                e
            );
        }
    }
}

type BodyBuilder<'a> = &'a (dyn Fn(&PooledCredential) -> Result<Value, String> + Send + Sync);

/// The attempt loop shared by every dialect handler: select a credential,
/// build the upstream body for it, dispatch, classify failures, re-enter the
/// pool on the retryable ones. One attempt counter covers all error kinds.
pub async fn dispatch_stream(
    state: &AppState,
    model: &str,
    build: BodyBuilder<'_>,
) -> Result<Dispatched, PipelineError> {
    let max_attempts = state.config.upstream.max_retries.max(1);
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..max_attempts {
        let mut selection = state
            .pool
            .get(Some(model))
            .await
            .map_err(|e| PipelineError::no_credentials(e.to_string()))?;
        if selection.best_effort {
            info!(
                "Best-effort dispatch: no credential passes the model filter for {}",
                model
            );
        }
        ensure_project_id(state, &mut selection).await;
        info!(
            "Dispatching via {} (attempt {}/{})",
            selection.credential.display(),
            attempt + 1,
            max_attempts
        );

        let body = build(&selection.credential).map_err(PipelineError::bad_request)?;
        match state
            .upstream
            .call_stream(
                "streamGenerateContent",
                &selection.credential.access_secret,
                &body,
            )
            .await
        {
            Ok(stream) => return Ok(Dispatched { stream, selection }),
            Err(error) => {
                warn!(
                    "Upstream attempt {}/{} via {} failed: {}",
                    attempt + 1,
                    max_attempts,
                    selection.credential.display(),
                    error
                );
                match react_to_upstream_error(state, &selection, model, &error).await {
                    Reaction::Retry => {
                        last_error = Some(PipelineError::from_upstream(&error));
                        continue;
                    }
                    Reaction::Fail(e) => return Err(e),
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| PipelineError::no_credentials("all attempts exhausted".to_string())))
}

/// Unary variant of the same loop, for callers that bypass the stream shim.
pub async fn dispatch_unary(
    state: &AppState,
    model: &str,
    build: BodyBuilder<'_>,
) -> Result<(Value, Selection), PipelineError> {
    let max_attempts = state.config.upstream.max_retries.max(1);
    let mut last_error: Option<PipelineError> = None;

    for attempt in 0..max_attempts {
        let mut selection = state
            .pool
            .get(Some(model))
            .await
            .map_err(|e| PipelineError::no_credentials(e.to_string()))?;
        ensure_project_id(state, &mut selection).await;
        let body = build(&selection.credential).map_err(PipelineError::bad_request)?;
        match state
            .upstream
            .call_unary(
                "generateContent",
                &selection.credential.access_secret,
                &body,
            )
            .await
        {
            Ok(response) => return Ok((response, selection)),
            Err(error) => {
                warn!(
                    "Upstream unary attempt {}/{} via {} failed: {}",
                    attempt + 1,
                    max_attempts,
                    selection.credential.display(),
                    error
                );
                match react_to_upstream_error(state, &selection, model, &error).await {
                    Reaction::Retry => {
                        last_error = Some(PipelineError::from_upstream(&error));
                        continue;
                    }
                    Reaction::Fail(e) => return Err(e),
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| PipelineError::no_credentials("all attempts exhausted".to_string())))
}

/// Counts the request against the credential's model group only when the
/// dialect stream runs to completion. A caller abort drops the wrapper
/// before the tail runs and nothing is recorded.
pub fn with_completion_record(
    inner: SseStream,
    quota: Arc<QuotaLedger>,
    cred_id: String,
    model: String,
) -> SseStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        while let Some(item) = inner.next().await {
            yield item;
        }
        quota.record_request(&cred_id, ModelGroup::classify(&model));
    })
}

/// Wraps a unary upstream JSON response as a one-event SSE stream so the
/// per-dialect stream converters and collectors serve the unary path too.
pub fn unary_as_stream(response: Value) -> ByteStream {
    let line = Bytes::from(format!(
        "data: {}\n\n",
        serde_json::to_string(&response).unwrap_or_default()
    ));
    Box::pin(futures::stream::once(async move {
        Ok::<Bytes, reqwest::Error>(line)
    }))
}

/// Static base list plus every model the upstream has reported through
/// `fetchAvailableModels` (snapshotted in the quota ledger).
pub fn catalog_model_ids(quota: &QuotaLedger) -> Vec<String> {
    let mut ids: Vec<String> = SUPPORTED_MODELS.iter().map(|s| s.to_string()).collect();
    for model in quota.known_models() {
        if !ids.iter().any(|id| id == &model) {
            ids.push(model);
        }
    }
    ids
}

pub fn openai_models_response(quota: &QuotaLedger) -> Value {
    let data: Vec<Value> = catalog_model_ids(quota)
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1706745600,
                "owned_by": "pontis"
            })
        })
        .collect();
    json!({ "object": "list", "data": data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_error_shapes_match_conventions() {
        let err = PipelineError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "slow down".to_string(),
            "upstream_rate_limit",
        );
        let response = err.into_response(Dialect::OpenAi);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let err = PipelineError::bad_request("nope".to_string());
        let response = err.into_response(Dialect::Claude);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let err = PipelineError::no_credentials("empty".to_string());
        let response = err.into_response(Dialect::Gemini);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn completion_record_fires_only_on_full_drain() {
        let quota = Arc::new(QuotaLedger::new(3600, None));
        let inner: SseStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from("data: {}\n\n")),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ]));
        let mut wrapped = with_completion_record(
            inner,
            quota.clone(),
            "cred-1".to_string(),
            "gemini-3-pro".to_string(),
        );
        // Drop after one item: simulated caller abort.
        let _ = wrapped.next().await;
        drop(wrapped);
        assert_eq!(quota.request_count("cred-1", ModelGroup::Gemini), 0);

        let inner: SseStream = Box::pin(futures::stream::iter(vec![Ok(Bytes::from(
            "data: [DONE]\n\n",
        ))]));
        let mut wrapped = with_completion_record(
            inner,
            quota.clone(),
            "cred-1".to_string(),
            "gemini-3-pro".to_string(),
        );
        while wrapped.next().await.is_some() {}
        assert_eq!(quota.request_count("cred-1", ModelGroup::Gemini), 1);
    }

    #[tokio::test]
    async fn dispatch_discovers_missing_project_before_first_call() {
        use crate::models::{AppConfig, Credential, OAuthConfig, UpstreamConfig};
        use crate::proxy::credentials::{CredentialPool, CredentialStore, RotationStrategy};
        use crate::proxy::images::InlineImageSink;
        use crate::proxy::ip_guard::IpGuard;
        use crate::proxy::upstream::UpstreamClient;
        use axum::{extract::State as AxumState, routing::post, Router};
        use tokio::net::TcpListener;
        use tokio::sync::Mutex as AsyncMutex;

        #[derive(Clone, Default)]
        struct Captured {
            body: Arc<AsyncMutex<Option<Value>>>,
        }

        async fn dispatch_handler(
            AxumState(captured): AxumState<Captured>,
            uri: axum::http::Uri,
            body: String,
        ) -> axum::response::Response {
            use axum::response::IntoResponse;
            if uri.path().ends_with(":loadCodeAssist") {
                return Json(json!({ "cloudaicompanionProject": "proj-disc" })).into_response();
            }
            *captured.body.lock().await = serde_json::from_str(&body).ok();
            (
                [("content-type", "text/event-stream")],
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]},\"finishReason\":\"STOP\"}]}\n\n",
            )
                .into_response()
        }

        let captured = Captured::default();
        let app = Router::new()
            .route("/*rest", post(dispatch_handler))
            .with_state(captured.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path()).unwrap());
        let mut record = Credential::new(store.compute_id("1//0bare"), "1//0bare".to_string());
        record.access_secret = "ya29.valid".to_string();
        record.access_expiry_ms = (chrono::Utc::now().timestamp() + 3600) * 1000;
        store.write_all(vec![record]).unwrap();

        let quota = Arc::new(QuotaLedger::new(3600, None));
        let cooldown = Arc::new(crate::proxy::cooldown::CooldownLedger::new());
        let pool = Arc::new(CredentialPool::new(
            store,
            quota.clone(),
            cooldown.clone(),
            OAuthConfig::default(),
            RotationStrategy::RoundRobin,
        ));
        let state = AppState {
            config: Arc::new(AppConfig::default()),
            pool: pool.clone(),
            quota,
            cooldown,
            guard: Arc::new(IpGuard::new(Default::default(), None)),
            upstream: Arc::new(UpstreamClient::with_base_url(
                &UpstreamConfig::default(),
                format!("http://{}/v1internal", addr),
            )),
            image_sink: Arc::new(InlineImageSink),
            started_at: std::time::Instant::now(),
        };

        let build = |cred: &PooledCredential| -> Result<Value, String> {
            let mut body = json!({ "model": "gemini-3-pro", "contents": [] });
            if let Some(project) = &cred.project_id {
                body["project"] = json!(project);
            }
            Ok(body)
        };
        let dispatched = dispatch_stream(&state, "gemini-3-pro", &build)
            .await
            .expect("dispatch succeeds");
        server.abort();

        // The upstream body carried the freshly discovered project.
        let body = captured.body.lock().await.clone().expect("body captured");
        assert_eq!(body["project"], json!("proj-disc"));
        // And the pool persisted it on the credential.
        let cred = pool
            .get_by_id(&dispatched.selection.credential.id)
            .await
            .unwrap();
        assert_eq!(cred.project_id.as_deref(), Some("proj-disc"));
    }

    #[tokio::test]
    async fn unary_wrapping_produces_single_data_event() {
        let mut stream = unary_as_stream(json!({"response": {"ok": true}}));
        let first = stream.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).starts_with("data: "));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn models_response_includes_upstream_reported_models() {
        let quota = QuotaLedger::new(3600, None);
        quota.upsert("cred-1", "gemini-4-experimental", 0.8, None);
        // Already in the static list: must not duplicate.
        quota.upsert("cred-1", "gemini-3-pro", 0.8, None);

        let v = openai_models_response(&quota);
        assert_eq!(v["object"], json!("list"));
        let ids: Vec<&str> = v["data"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m["id"].as_str())
            .collect();
        assert!(ids.contains(&"gemini-4-experimental"));
        assert_eq!(ids.iter().filter(|id| **id == "gemini-3-pro").count(), 1);
        assert!(ids.len() >= SUPPORTED_MODELS.len() + 1);
    }
}
