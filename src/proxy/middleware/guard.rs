use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::proxy::ip_guard::BlockReason;
use crate::proxy::state::AppState;

/// Outermost layer: blocked IPs never reach auth or routing.
pub async fn ip_guard_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ip) = super::client_ip::extract_client_ip(&request) else {
        tracing::warn!("[W-GUARD-NO-IP] unable to extract client IP, letting request through");
        return next.run(request).await;
    };

    let status = state.guard.check(&ip);
    if !status.blocked {
        return next.run(request).await;
    }

    match status.reason {
        Some(BlockReason::Permanent) => {
            tracing::warn!("[IpGuard] rejected permanently blocked IP {}", ip);
            (
                StatusCode::FORBIDDEN,
                axum::Json(json!({
                    "error": {
                        "type": "ip_blocked",
                        "message": "Access denied. This address is permanently blocked.",
                        "code": "ip_blocked_permanent"
                    }
                })),
            )
                .into_response()
        }
        _ => {
            tracing::warn!("[IpGuard] rejected temporarily blocked IP {}", ip);
            (
                StatusCode::TOO_MANY_REQUESTS,
                axum::Json(json!({
                    "error": {
                        "type": "ip_blocked",
                        "message": "Too many violations. This address is temporarily blocked.",
                        "code": "ip_blocked_temporary",
                        "expiresAt": status.expires_at_ms
                    }
                })),
            )
                .into_response()
        }
    }
}
