//! Document upload
//!
//! POST /books/upload takes a multipart form (`title`, optional `language`,
//! `document`) and answers with an SSE stream of extraction progress. Every
//! stream ends with a `completed` or `error` event, including uploads that
//! are rejected before extraction starts.

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    response::sse::{Event, Sse},
    routing::post,
    Router,
};
use futures::stream::Stream;
use pagecast_common::sse::upload_sse_stream;
use std::convert::Infallible;
use tracing::debug;

use crate::services::upload_coordinator::{self, UploadError, UploadRequest};
use crate::AppState;

/// POST /books/upload
pub async fn upload_book(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let request = match multipart {
        Ok(multipart) => read_form(multipart).await,
        Err(rejection) => Err(UploadError::Validation(rejection.body_text())),
    };

    let events = match request {
        Ok(request) => state.coordinator.start(request),
        Err(e) => {
            debug!("Upload rejected before extraction: {}", e);
            upload_coordinator::rejected(e)
        }
    };

    upload_sse_stream(events)
}

async fn read_form(mut multipart: Multipart) -> Result<UploadRequest, UploadError> {
    let mut title = None;
    let mut language = None;
    let mut document = None;

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => title = Some(field.text().await.map_err(malformed)?),
            "language" => language = Some(field.text().await.map_err(malformed)?),
            "document" => document = Some(field.bytes().await.map_err(malformed)?.to_vec()),
            other => debug!("Ignoring form field '{}'", other),
        }
    }

    let document =
        document.ok_or_else(|| UploadError::Validation("document is required".to_string()))?;

    Ok(UploadRequest {
        title: title.unwrap_or_default(),
        language,
        document,
    })
}

fn malformed(e: axum::extract::multipart::MultipartError) -> UploadError {
    UploadError::Validation(e.body_text())
}

pub fn upload_routes() -> Router<AppState> {
    Router::new().route("/books/upload", post(upload_book))
}
