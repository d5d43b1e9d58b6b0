use serde_json::{json, Value};

use super::client::{UpstreamClient, UpstreamError};

#[derive(Debug, Clone)]
pub struct ModelQuota {
    pub model_id: String,
    pub remaining_fraction: f64,
    pub reset_time: Option<String>,
}

/// Fetches the per-model catalog with quota figures for one credential.
pub async fn fetch_available_models(
    client: &UpstreamClient,
    access_token: &str,
    project_id: Option<&str>,
) -> Result<Vec<ModelQuota>, UpstreamError> {
    let mut body = json!({});
    if let Some(project) = project_id {
        body["project"] = json!(project);
    }
    let response = client
        .call_unary("fetchAvailableModels", access_token, &body)
        .await?;

    let models = response
        .get("models")
        .or_else(|| response.get("availableModels"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(models
        .iter()
        .filter_map(|m| {
            let model_id = m
                .get("model")
                .or_else(|| m.get("name"))
                .and_then(|v| v.as_str())?
                .to_string();
            let quota = m.get("quotaInfo");
            let remaining = quota
                .and_then(|q| q.get("remainingFraction"))
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            let reset = quota
                .and_then(|q| q.get("resetTime"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(ModelQuota {
                model_id,
                remaining_fraction: remaining,
                reset_time: reset,
            })
        })
        .collect())
}

/// Discovers the upstream project ID for a credential. Tries loadCodeAssist
/// first, onboards when the account has never been provisioned.
pub async fn discover_project_id(
    client: &UpstreamClient,
    access_token: &str,
) -> Result<String, UpstreamError> {
    let body = json!({ "metadata": { "ideType": "IDE_UNSPECIFIED" } });
    let response = client
        .call_unary("loadCodeAssist", access_token, &body)
        .await?;
    if let Some(project) = response
        .get("cloudaicompanionProject")
        .and_then(|v| v.as_str())
    {
        if !project.is_empty() {
            return Ok(project.to_string());
        }
    }

    let tier = default_tier_id(&response);
    let onboard = json!({
        "tierId": tier,
        "metadata": { "ideType": "IDE_UNSPECIFIED" },
    });
    let response = client.call_unary("onboardUser", access_token, &onboard).await?;
    let project = response
        .pointer("/response/cloudaicompanionProject/id")
        .or_else(|| response.pointer("/cloudaicompanionProject/id"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    match project {
        Some(p) if !p.is_empty() => Ok(p),
        _ => {
            // Accounts the upstream refuses to provision still work against
            // the generation endpoints without a project.
            tracing::warn!("[W-PROJECT-DISCOVERY] upstream returned no project id");
            Err(UpstreamError::transport(
                "project discovery returned no id".to_string(),
            ))
        }
    }
}

fn default_tier_id(load_response: &Value) -> String {
    load_response
        .get("allowedTiers")
        .and_then(|v| v.as_array())
        .and_then(|tiers| {
            tiers.iter().find_map(|t| {
                if t.get("isDefault").and_then(|v| v.as_bool()).unwrap_or(false) {
                    t.get("id").and_then(|v| v.as_str()).map(str::to_string)
                } else {
                    None
                }
            })
        })
        .unwrap_or_else(|| "free-tier".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpstreamConfig;
    use axum::{routing::post, Json, Router};
    use tokio::net::TcpListener;

    async fn serve(route: &'static str, body: Value) -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new().route(
            route,
            post(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1internal", addr), server)
    }

    #[tokio::test]
    async fn catalog_parses_quota_info() {
        let (base, server) = serve(
            "/v1internal:fetchAvailableModels",
            json!({
                "models": [
                    {
                        "model": "gemini-3-pro",
                        "quotaInfo": { "remainingFraction": 0.73, "resetTime": "2026-08-02T00:00:00Z" }
                    },
                    { "model": "gemini-3-flash" }
                ]
            }),
        )
        .await;
        let client = UpstreamClient::with_base_url(&UpstreamConfig::default(), base);
        let models = fetch_available_models(&client, "tok", Some("proj"))
            .await
            .unwrap();
        server.abort();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].model_id, "gemini-3-pro");
        assert!((models[0].remaining_fraction - 0.73).abs() < 1e-9);
        assert_eq!(models[0].reset_time.as_deref(), Some("2026-08-02T00:00:00Z"));
        // Missing quotaInfo defaults to full headroom.
        assert!((models[1].remaining_fraction - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn project_discovery_reads_load_code_assist() {
        let (base, server) = serve(
            "/v1internal:loadCodeAssist",
            json!({ "cloudaicompanionProject": "useful-wave-ab12c" }),
        )
        .await;
        let client = UpstreamClient::with_base_url(&UpstreamConfig::default(), base);
        let project = discover_project_id(&client, "tok").await.unwrap();
        server.abort();
        assert_eq!(project, "useful-wave-ab12c");
    }

    #[test]
    fn default_tier_prefers_flagged_entry() {
        let load = json!({
            "allowedTiers": [
                { "id": "legacy", "isDefault": false },
                { "id": "standard", "isDefault": true }
            ]
        });
        assert_eq!(default_tier_id(&load), "standard");
        assert_eq!(default_tier_id(&json!({})), "free-tier");
    }
}
