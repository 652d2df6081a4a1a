//! Administrative endpoints

use axum::{extract::State, routing::post, Json, Router};
use tracing::warn;

use crate::error::ApiResult;
use crate::services::SweepReport;
use crate::AppState;

/// POST /admin/sweep
///
/// Run one recovery sweep pass now and return what it changed.
pub async fn run_sweep(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    match state.sweep.run_once().await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            warn!("On-demand recovery sweep failed: {}", e);
            state.record_error(format!("Recovery sweep failed: {}", e)).await;
            Err(e.into())
        }
    }
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/admin/sweep", post(run_sweep))
}
