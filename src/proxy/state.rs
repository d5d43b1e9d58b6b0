use std::sync::Arc;
use std::time::Instant;

use crate::models::AppConfig;
use crate::proxy::cooldown::CooldownLedger;
use crate::proxy::credentials::CredentialPool;
use crate::proxy::images::ImageSink;
use crate::proxy::ip_guard::IpGuard;
use crate::proxy::quota::QuotaLedger;
use crate::proxy::upstream::UpstreamClient;

/// Long-lived components owned by the server root; handlers and middleware
/// reach them through this shared state. Initialization order is explicit:
/// store → pool → ledgers → pipeline → HTTP server (see `server::build`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: Arc<CredentialPool>,
    pub quota: Arc<QuotaLedger>,
    pub cooldown: Arc<CooldownLedger>,
    pub guard: Arc<IpGuard>,
    pub upstream: Arc<UpstreamClient>,
    pub image_sink: Arc<dyn ImageSink>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
