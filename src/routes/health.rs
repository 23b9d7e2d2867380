use crate::auth::middleware::AppState;
use crate::models::HealthResponse;
use axum::{extract::State, Json};

/// GET /api/health: Liveness probe
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let now = state.auth.clock().now();
    let uptime_secs = (now - state.started_at).num_seconds().max(0) as u64;

    Json(HealthResponse {
        status: "ok",
        timestamp: now,
        uptime_secs,
    })
}
