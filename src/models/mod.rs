mod config;
mod credential;

pub use config::{
    AppConfig, GenerationConfig, GuardConfig, OAuthConfig, QuotaConfig, RotationConfig,
    SignatureCacheConfig, StreamingConfig, UpstreamConfig,
};
pub use credential::{Credential, ImportShape};
