//! Book lookup handlers
//!
//! GET /books/:id, GET /books/:id/status, GET /books/:id/pages

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::db::{books, pages};
use crate::error::{ApiError, ApiResult};
use crate::models::{Book, Page};
use crate::services::BookStatusReport;
use crate::AppState;
use pagecast_common::events::PageStatus;

/// One row of GET /books/:id/pages; page text is omitted
#[derive(Debug, Serialize)]
pub struct PageSummary {
    pub page_number: i64,
    pub processing_status: PageStatus,
    pub audio_ref: Option<String>,
    pub audio_duration: Option<f64>,
    pub attempt_count: i64,
    pub processing_error: Option<String>,
}

impl From<Page> for PageSummary {
    fn from(page: Page) -> Self {
        Self {
            page_number: page.page_number,
            processing_status: page.processing_status,
            audio_ref: page.audio_ref,
            audio_duration: page.audio_duration,
            attempt_count: page.attempt_count,
            processing_error: page.processing_error,
        }
    }
}

/// GET /books/:id/status
///
/// Current derived state plus a time-remaining estimate. Never waits on
/// in-flight narration.
pub async fn get_book_status(
    State(state): State<AppState>,
    Path(book_id): Path<i64>,
) -> ApiResult<Json<BookStatusReport>> {
    state
        .status
        .book_status(book_id)
        .await?
        .map(Json)
        .ok_or_else(|| book_not_found(book_id))
}

/// GET /books/:id
///
/// Status, progress, duration and error are derived from the pages at read
/// time rather than trusted from the stored columns.
pub async fn get_book(
    State(state): State<AppState>,
    Path(book_id): Path<i64>,
) -> ApiResult<Json<Book>> {
    let Some((mut book, aggregate)) = state.aggregator.snapshot(book_id).await? else {
        return Err(book_not_found(book_id));
    };
    aggregate.overlay(&mut book);
    Ok(Json(book))
}

/// GET /books/:id/pages
pub async fn list_book_pages(
    State(state): State<AppState>,
    Path(book_id): Path<i64>,
) -> ApiResult<Json<Vec<PageSummary>>> {
    if books::get_book(&state.db, book_id).await?.is_none() {
        return Err(book_not_found(book_id));
    }

    let pages = pages::list_pages(&state.db, book_id).await?;
    Ok(Json(pages.into_iter().map(PageSummary::from).collect()))
}

fn book_not_found(book_id: i64) -> ApiError {
    ApiError::NotFound(format!("Book {} not found", book_id))
}

pub fn book_routes() -> Router<AppState> {
    Router::new()
        .route("/books/:book_id", get(get_book))
        .route("/books/:book_id/status", get(get_book_status))
        .route("/books/:book_id/pages", get(list_book_pages))
}
