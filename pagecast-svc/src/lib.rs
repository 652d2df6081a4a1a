//! pagecast-svc library interface
//!
//! Exposes the service components and the HTTP router so integration tests
//! can assemble the service without the binary.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use crate::config::ServiceSettings;
use crate::queue::{JobQueue, SqliteJobQueue};
use crate::services::{
    AudioStore, NarrationWorker, Narrator, PageExtractor, ProgressAggregator, RecoverySweep,
    StatusService, UploadCoordinator,
};
use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use pagecast_common::events::EventBus;
use pagecast_common::Clock;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Room for multipart framing and the text fields on top of the document
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub clock: Arc<dyn Clock>,
    pub settings: ServiceSettings,
    pub queue: Arc<dyn JobQueue>,
    pub aggregator: ProgressAggregator,
    pub coordinator: UploadCoordinator,
    pub status: StatusService,
    pub sweep: Arc<RecoverySweep>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    /// Wire the service components around one database and clock
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
        extractor: Arc<dyn PageExtractor>,
    ) -> Self {
        let lock_wait = settings.db_max_lock_wait_ms;
        let queue: Arc<dyn JobQueue> =
            Arc::new(SqliteJobQueue::new(db.clone(), Arc::clone(&clock), lock_wait));
        let aggregator =
            ProgressAggregator::new(db.clone(), event_bus.clone(), Arc::clone(&clock), lock_wait);
        let coordinator = UploadCoordinator::new(
            db.clone(),
            extractor,
            Arc::clone(&queue),
            event_bus.clone(),
            Arc::clone(&clock),
            settings.max_upload_bytes,
            lock_wait,
        );
        let status = StatusService::new(aggregator.clone(), Arc::clone(&clock));
        let sweep = Arc::new(RecoverySweep::new(
            db.clone(),
            Arc::clone(&queue),
            aggregator.clone(),
            event_bus.clone(),
            Arc::clone(&clock),
            settings.clone(),
        ));

        Self {
            startup_time: clock.now(),
            db,
            event_bus,
            clock,
            settings,
            queue,
            aggregator,
            coordinator,
            status,
            sweep,
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Narration job handler sharing this state's database, clock and aggregator
    pub fn narration_worker(
        &self,
        narrator: Arc<dyn Narrator>,
        store: Arc<dyn AudioStore>,
    ) -> NarrationWorker {
        NarrationWorker::new(
            self.db.clone(),
            narrator,
            store,
            self.aggregator.clone(),
            self.event_bus.clone(),
            Arc::clone(&self.clock),
            self.settings.clone(),
        )
    }

    /// Remember an error for `/health`
    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    let body_limit = state
        .settings
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .merge(api::upload_routes())
        .merge(api::book_routes())
        .merge(api::admin_routes())
        .merge(api::health_routes())
        .route("/events", axum::routing::get(api::event_stream))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
