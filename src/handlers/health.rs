use axum::{Json, extract::State, response::IntoResponse};
use std::sync::Arc;
use crate::state::AppState;

// health handler
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.gateway.health().is_healthy() {
        "healthy"
    } else {
        "degraded"
    };
    let uptime = chrono::Utc::now() - state.started_at;

    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_secs": uptime.num_seconds(),
        "backend_url": state.settings.koboldcpp.url,
        "sessions": state.mcp.session_count(),
        "gateway": state.gateway.snapshot(),
    }))
}
