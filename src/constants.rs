use std::sync::LazyLock;

pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub const UPSTREAM_HOST_PROD: &str = "https://cloudcode-pa.googleapis.com";
pub const UPSTREAM_HOST_SANDBOX: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";

/// Paths that resolve without auth and never count as probe violations.
pub const PATH_WHITELIST: &[&str] = &[
    "/favicon.ico",
    "/robots.txt",
    "/ws/logs",
    "/v1/models",
    "/v1/complete",
    "/v1/files",
    "/v1/fine_tuning",
    "/v1/assistants",
    "/v1/threads",
    "/v1/batches",
    "/v1/uploads",
    "/v1/organization",
    "/v1/usage",
    "/v1beta/models",
];

pub const PATH_WHITELIST_PREFIXES: &[&str] = &["/.well-known/"];

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "pontis/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

pub fn is_whitelisted_path(path: &str) -> bool {
    PATH_WHITELIST.contains(&path)
        || PATH_WHITELIST_PREFIXES.iter().any(|p| path.starts_with(p))
}
