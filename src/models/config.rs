use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub admin_username: String,
    #[serde(default)]
    pub admin_password: String,
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub signature_cache: SignatureCacheConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub image_base_url: String,
    #[serde(default)]
    pub image_dir: String,
    #[serde(default)]
    pub debug_dump: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8317
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// "production" or "sandbox".
    pub env: String,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub request_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_retries: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            env: "production".to_string(),
            user_agent: None,
            proxy: None,
            request_timeout_secs: 300,
            idle_timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl UpstreamConfig {
    pub fn host(&self) -> &'static str {
        if self.env.eq_ignore_ascii_case("sandbox") {
            crate::constants::UPSTREAM_HOST_SANDBOX
        } else {
            crate::constants::UPSTREAM_HOST_PROD
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_early_secs: i64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            refresh_early_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// "round_robin", "request_count" or "quota_exhausted".
    pub strategy: String,
    pub requests_per_credential: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
            requests_per_credential: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub system_instruction: String,
    pub official_prompt: String,
    /// "before" or "after", relative to the operator instruction.
    pub official_prompt_position: String,
    pub default_thinking_budget: i64,
    pub max_inline_images: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            system_instruction: String::new(),
            official_prompt: String::new(),
            official_prompt_position: "before".to_string(),
            default_thinking_budget: 16_000,
            max_inline_images: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureCacheConfig {
    /// "always", "tools_or_image" or "never".
    pub mode: String,
    pub cache_tool_signatures: bool,
}

impl Default for SignatureCacheConfig {
    fn default() -> Self {
        Self {
            mode: "tools_or_image".to_string(),
            cache_tool_signatures: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// 0 disables heartbeats.
    pub heartbeat_interval_ms: u64,
    pub fake_non_stream: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            fake_non_stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    pub window_secs: u64,
    pub violation_threshold: u32,
    pub temp_block_secs: u64,
    pub cycle_window_secs: u64,
    pub permanent_after_cycles: u32,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window_secs: 600,
            violation_threshold: 10,
            temp_block_secs: 1800,
            cycle_window_secs: 86_400,
            permanent_after_cycles: 5,
            whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub idle_ttl_secs: u64,
    pub cooldown_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 3600,
            cooldown_secs: 60,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: String::new(),
            admin_username: String::new(),
            admin_password: String::new(),
            jwt_secret: String::new(),
            upstream: UpstreamConfig::default(),
            oauth: OAuthConfig::default(),
            rotation: RotationConfig::default(),
            generation: GenerationConfig::default(),
            signature_cache: SignatureCacheConfig::default(),
            streaming: StreamingConfig::default(),
            guard: GuardConfig::default(),
            quota: QuotaConfig::default(),
            image_base_url: String::new(),
            image_dir: String::new(),
            debug_dump: false,
        }
    }
}

fn random_secret(prefix: &str, len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let body: String = (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}{}", prefix, body)
}

impl AppConfig {
    /// Environment variables take precedence over the loaded file. Secrets
    /// that remain empty afterwards are minted and logged exactly once so the
    /// operator can recover them from the startup log.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = key.trim().to_string();
            }
        }
        if let Ok(user) = std::env::var("ADMIN_USERNAME") {
            if !user.trim().is_empty() {
                self.admin_username = user.trim().to_string();
            }
        }
        if let Ok(pass) = std::env::var("ADMIN_PASSWORD") {
            if !pass.trim().is_empty() {
                self.admin_password = pass.trim().to_string();
            }
        }
        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.trim().is_empty() {
                self.jwt_secret = secret.trim().to_string();
            }
        }
        if let Ok(si) = std::env::var("SYSTEM_INSTRUCTION") {
            self.generation.system_instruction = si;
        }
        if let Ok(op) = std::env::var("OFFICIAL_SYSTEM_PROMPT") {
            self.generation.official_prompt = op;
        }
        if let Ok(base) = std::env::var("IMAGE_BASE_URL") {
            if !base.trim().is_empty() {
                self.image_base_url = base.trim().trim_end_matches('/').to_string();
            }
        }
        if let Ok(dump) = std::env::var("DEBUG_DUMP_REQUEST_RESPONSE") {
            self.debug_dump = matches!(
                dump.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if self.upstream.proxy.is_none() {
            for key in ["PROXY", "HTTPS_PROXY", "HTTP_PROXY", "ALL_PROXY"] {
                if let Ok(url) = std::env::var(key) {
                    if !url.trim().is_empty() {
                        self.upstream.proxy = Some(url.trim().to_string());
                        break;
                    }
                }
            }
        }
    }

    pub fn ensure_generated_secrets(&mut self) {
        if self.api_key.is_empty() {
            self.api_key = random_secret("sk-", 40);
            warn!(
                "[W-API-KEY-GENERATED] no caller API key configured; generated one for this run: {}",
                self.api_key
            );
        }
        if self.admin_username.is_empty() {
            self.admin_username = "admin".to_string();
        }
        if self.admin_password.is_empty() {
            self.admin_password = random_secret("", 24);
            warn!(
                "[W-ADMIN-PASSWORD-GENERATED] generated admin password: {}",
                self.admin_password
            );
        }
        if self.jwt_secret.is_empty() {
            self.jwt_secret = random_secret("", 48);
            warn!("[W-JWT-SECRET-GENERATED] generated JWT secret (not echoed)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.port, 8317);
        assert_eq!(cfg.upstream.max_retries, 3);
        assert_eq!(cfg.guard.violation_threshold, 10);
        assert_eq!(cfg.guard.temp_block_secs, 1800);
        assert_eq!(cfg.quota.cooldown_secs, 60);
        assert_eq!(cfg.streaming.heartbeat_interval_ms, 15_000);
        assert_eq!(cfg.generation.default_thinking_budget, 16_000);
    }

    #[test]
    fn generated_secrets_fill_empty_fields_only() {
        let mut cfg = AppConfig {
            api_key: "sk-fixed".to_string(),
            ..AppConfig::default()
        };
        cfg.ensure_generated_secrets();
        assert_eq!(cfg.api_key, "sk-fixed");
        assert!(!cfg.admin_password.is_empty());
        assert!(!cfg.jwt_secret.is_empty());
    }

    #[test]
    fn sandbox_env_selects_sandbox_host() {
        let mut cfg = AppConfig::default();
        cfg.upstream.env = "sandbox".to_string();
        assert!(cfg.upstream.host().contains("sandbox"));
    }
}
