mod health;
mod metrics;
mod mcp;

use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;
use crate::state::AppState;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use mcp::{mcp_close_handler, mcp_handler};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(mcp_handler).delete(mcp_close_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
