use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proxy::mappers::tool_names::ToolNameCache;
use crate::proxy::signature_cache::SignatureCache;
use crate::proxy::state::AppState;
use crate::proxy::upstream::catalog;

const SWEEP_INTERVAL_SECS: u64 = 60;
const TIDY_INTERVAL_SECS: u64 = 300;
const QUOTA_REFRESH_INTERVAL_SECS: u64 = 600;
const TOOL_NAME_CACHE_LIMIT: usize = 2000;

/// Background maintenance: the minute sweeper for the guard and cooldown
/// ledgers, the memory-tidy timer for the caches, and the periodic quota
/// refresh against the upstream catalog.
pub fn start_scheduler(state: AppState, cancel: CancellationToken) {
    let sweep_state = state.clone();
    let sweep_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sweep_state.guard.sweep();
                    sweep_state.cooldown.sweep();
                }
                _ = sweep_cancel.cancelled() => {
                    debug!("Sweep task stopped");
                    return;
                }
            }
        }
    });

    let tidy_state = state.clone();
    let tidy_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(TIDY_INTERVAL_SECS));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tidy_state.quota.prune();
                    if let Err(e) = tidy_state.quota.flush() {
                        warn!("[W-QUOTA-FLUSH] {}", e);
                    }
                    SignatureCache::global().tidy();
                    ToolNameCache::global().tidy(TOOL_NAME_CACHE_LIMIT);
                }
                _ = tidy_cancel.cancelled() => {
                    debug!("Tidy task stopped");
                    return;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(QUOTA_REFRESH_INTERVAL_SECS));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so boot stays light.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    refresh_all_quotas(&state).await;
                }
                _ = cancel.cancelled() => {
                    debug!("Quota refresh task stopped");
                    return;
                }
            }
        }
    });
    info!("Background scheduler started");
}

/// Pulls the model catalog for every enabled credential and records the
/// reported per-model quota figures. Zero-remaining models flip the coarse
/// has_quota flag and open a cooldown bounded by the reset hint.
pub async fn refresh_all_quotas(state: &AppState) {
    let credentials = state.pool.list().await;
    let mut refreshed = 0usize;
    for cred in credentials.into_iter().filter(|c| c.enabled) {
        let fresh = match state.pool.ensure_fresh(&cred.id).await {
            Ok(c) => c,
            Err(e) => {
                debug!("Skipping quota refresh for {}: {}", cred.display(), e);
                continue;
            }
        };
        match catalog::fetch_available_models(
            &state.upstream,
            &fresh.access_secret,
            fresh.project_id.as_deref(),
        )
        .await
        {
            Ok(models) => {
                let mut any_quota = false;
                for model in &models {
                    state.quota.upsert(
                        &fresh.id,
                        &model.model_id,
                        model.remaining_fraction,
                        model.reset_time.clone(),
                    );
                    if model.remaining_fraction > 0.0 {
                        any_quota = true;
                    } else {
                        state.cooldown.mark(
                            &fresh.id,
                            &model.model_id,
                            Duration::from_secs(state.config.quota.cooldown_secs),
                        );
                    }
                }
                if !models.is_empty() {
                    if let Err(e) = state.pool.set_has_quota(&fresh.id, any_quota).await {
                        warn!("[W-QUOTA-FLAG] persisting has_quota failed: {}", e);
                    }
                }
                refreshed += 1;
            }
            Err(e) => {
                debug!("Quota fetch failed for {}: {}", fresh.display(), e);
            }
        }
    }
    if refreshed > 0 {
        info!("Quota refresh completed for {} credentials", refreshed);
    }
}
