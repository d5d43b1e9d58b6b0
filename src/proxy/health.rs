use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::proxy::state::AppState;

pub async fn health_check_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime": state.uptime_secs(),
    }))
}
