//! Health check endpoint
//!
//! Real uptime, queue depth and build identification for diagnostics.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tracing::warn;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the queue cannot be read
    pub status: String,
    /// Module name ("pagecast-svc")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Narration jobs not yet settled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<i64>,
    pub git_hash: String,
    pub build_timestamp: String,
    pub build_profile: String,
    /// Last error message if any (for diagnostics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.clock.now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let queue_depth = match state.queue.depth().await {
        Ok(depth) => Some(depth),
        Err(e) => {
            warn!("Health check could not read queue depth: {}", e);
            None
        }
    };

    let last_error = state.last_error.read().await.clone();

    Json(HealthResponse {
        status: if queue_depth.is_some() { "ok" } else { "degraded" }.to_string(),
        module: "pagecast-svc".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        queue_depth,
        git_hash: env!("GIT_HASH").to_string(),
        build_timestamp: env!("BUILD_TIMESTAMP").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
