use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;
use crate::proxy::cooldown::CooldownLedger;
use crate::proxy::credentials::{CredentialPool, CredentialStore, RotationStrategy};
use crate::proxy::images::{DiskImageSink, ImageSink, InlineImageSink};
use crate::proxy::ip_guard::IpGuard;
use crate::proxy::quota::QuotaLedger;
use crate::proxy::routes::build_router;
use crate::proxy::state::AppState;
use crate::proxy::upstream::UpstreamClient;

/// Wires the long-lived components in dependency order: store, then the
/// ledgers the pool selects against, then the pool, then transport and
/// state for the HTTP layer.
pub fn build_state(config: AppConfig, data_dir: &Path) -> AppResult<AppState> {
    let store = Arc::new(CredentialStore::open(data_dir)?);
    let quota = Arc::new(QuotaLedger::new(
        config.quota.idle_ttl_secs,
        Some(data_dir.join("quotas")),
    ));
    let cooldown = Arc::new(CooldownLedger::new());
    let guard = Arc::new(IpGuard::new(
        config.guard.clone(),
        Some(data_dir.join("blocked_ips.json")),
    ));
    let strategy = RotationStrategy::from_config(
        &config.rotation.strategy,
        config.rotation.requests_per_credential,
    );
    let pool = Arc::new(CredentialPool::new(
        store,
        quota.clone(),
        cooldown.clone(),
        config.oauth.clone(),
        strategy,
    ));
    let upstream = Arc::new(UpstreamClient::new(&config.upstream));

    let image_sink: Arc<dyn ImageSink> = if config.image_base_url.is_empty() {
        Arc::new(InlineImageSink)
    } else {
        let dir = if config.image_dir.is_empty() {
            data_dir.join("images")
        } else {
            config.image_dir.clone().into()
        };
        Arc::new(DiskImageSink::new(dir, config.image_base_url.clone()))
    };

    Ok(AppState {
        config: Arc::new(config),
        pool,
        quota,
        cooldown,
        guard,
        upstream,
        image_sink,
        started_at: std::time::Instant::now(),
    })
}

/// Binds and serves until the cancellation token fires. Port-in-use and
/// bind-permission failures surface as errors for the caller to exit(1) on.
pub async fn run_server(state: AppState, cancel: CancellationToken) -> AppResult<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        error!("[E-BIND] failed to bind {}: {}", addr, e);
        AppError::Io(e)
    })?;
    info!("Listening on {}", addr);

    let report = state.pool.refresh_expired_wave().await;
    if report.attempted > 0 {
        info!(
            "Boot refresh wave: {} attempted, {} refreshed, {} disabled, {} retained",
            report.attempted, report.refreshed, report.disabled, report.retained
        );
    }
    crate::modules::system::scheduler::start_scheduler(state.clone(), cancel.clone());

    let router = build_router(state.clone());
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await });

    serve
        .await
        .map_err(|e| AppError::Unknown(format!("server error: {}", e)))?;

    if let Err(e) = state.quota.flush() {
        tracing::warn!("[W-QUOTA-FLUSH] final flush failed: {}", e);
    }
    info!("Server stopped cleanly");
    Ok(())
}
