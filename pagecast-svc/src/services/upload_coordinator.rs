//! Upload coordinator
//!
//! Validates a document, extracts it page by page while streaming progress
//! to the uploader, then commits the book, its pages and one narration job
//! per page in a single transaction. Any failure before the commit aborts
//! the whole upload with nothing persisted.
//!
//! The coordinator runs in its own task and reports through a bounded
//! channel. If the client disconnects, sends fail silently and the upload
//! still runs to completion.

use crate::db::books;
use crate::models::{NewBook, DEFAULT_LANGUAGE};
use crate::queue::JobQueue;
use crate::services::extractor::{ExtractionError, PageExtractor};
use crate::utils::retry_on_lock;
use pagecast_common::events::{EventBus, PagecastEvent, UploadEvent};
use pagecast_common::Clock;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffered upload events per connection
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Failed to save book: {0}")]
    Persistence(#[from] pagecast_common::Error),
}

impl UploadError {
    /// Terminal stream event for this error
    pub fn to_event(&self) -> UploadEvent {
        let (error, details) = match self {
            UploadError::Validation(details) => ("Validation failed", details.clone()),
            UploadError::Extraction(e) => ("Extraction failed", e.to_string()),
            UploadError::Persistence(e) => ("Failed to save book", e.to_string()),
        };
        UploadEvent::Error {
            error: error.to_string(),
            details,
        }
    }
}

/// A document submitted for narration
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub title: String,
    pub language: Option<String>,
    pub document: Vec<u8>,
}

/// Outcome of a successful upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    pub book_id: i64,
    pub total_pages: usize,
}

/// Status lookup path for a book
pub fn status_url(book_id: i64) -> String {
    format!("/books/{}/status", book_id)
}

#[derive(Clone)]
pub struct UploadCoordinator {
    db: SqlitePool,
    extractor: Arc<dyn PageExtractor>,
    queue: Arc<dyn JobQueue>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    max_upload_bytes: usize,
    max_lock_wait_ms: u64,
}

impl UploadCoordinator {
    pub fn new(
        db: SqlitePool,
        extractor: Arc<dyn PageExtractor>,
        queue: Arc<dyn JobQueue>,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        max_upload_bytes: usize,
        max_lock_wait_ms: u64,
    ) -> Self {
        Self {
            db,
            extractor,
            queue,
            event_bus,
            clock,
            max_upload_bytes,
            max_lock_wait_ms,
        }
    }

    /// Start an upload in the background and return its event stream
    ///
    /// The stream always ends with exactly one `completed` or `error` event.
    pub fn start(&self, request: UploadRequest) -> mpsc::Receiver<UploadEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let coordinator = self.clone();
        tokio::spawn(async move {
            let _ = coordinator.run(request, &tx).await;
        });
        rx
    }

    /// Run an upload to completion, reporting every step on `events`
    ///
    /// The terminal event is sent before returning.
    pub async fn run(
        &self,
        request: UploadRequest,
        events: &mpsc::Sender<UploadEvent>,
    ) -> Result<UploadReceipt, UploadError> {
        let title = request.title.trim().to_string();
        match self.run_inner(&title, request, events).await {
            Ok(receipt) => {
                send(
                    events,
                    UploadEvent::Completed {
                        book_id: receipt.book_id,
                        total_pages: receipt.total_pages,
                        status_url: status_url(receipt.book_id),
                    },
                )
                .await;
                Ok(receipt)
            }
            Err(e) => {
                warn!(title = %title, "Upload aborted: {}", e);
                self.event_bus.emit_lossy(PagecastEvent::UploadFailed {
                    title,
                    error: e.to_string(),
                    timestamp: self.clock.now(),
                });
                send(events, e.to_event()).await;
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        title: &str,
        request: UploadRequest,
        events: &mpsc::Sender<UploadEvent>,
    ) -> Result<UploadReceipt, UploadError> {
        let started = Instant::now();
        validate(title, &request.document, self.max_upload_bytes)?;
        self.extractor.check_format(&request.document)?;

        let raw_pages = self.extractor.split_pages(&request.document).await?;
        if raw_pages.is_empty() {
            return Err(UploadError::Validation("document has no pages".to_string()));
        }
        let total_pages = raw_pages.len();

        info!(title = %title, total_pages, bytes = request.document.len(), "Upload accepted");
        self.event_bus.emit_lossy(PagecastEvent::UploadStarted {
            title: title.to_string(),
            total_pages,
            timestamp: self.clock.now(),
        });
        send(
            events,
            UploadEvent::Status {
                message: format!("Extracting {} pages", total_pages),
            },
        )
        .await;
        send(events, UploadEvent::ProcessingStarted { total_pages }).await;

        let mut texts = Vec::with_capacity(total_pages);
        for (index, raw) in raw_pages.iter().enumerate() {
            let page_number = index + 1;
            let text = self.extractor.extract_page(page_number, raw).await?;
            debug!(page_number, chars = text.chars().count(), "Page extracted");
            send(
                events,
                UploadEvent::page_progress(page_number, total_pages, text.chars().count()),
            )
            .await;
            texts.push(text);
        }

        let new_book = NewBook {
            title: title.to_string(),
            language: normalize_language(request.language.as_deref()),
            pages: texts,
        };

        let now = self.clock.now();
        let (book_id, jobs) = retry_on_lock("create book", self.max_lock_wait_ms, || {
            books::create_with_pages(&self.db, &new_book, now)
        })
        .await?;
        self.queue.notify_work_available();

        info!(
            book_id,
            total_pages,
            jobs = jobs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Book created, narration queued"
        );
        self.event_bus.emit_lossy(PagecastEvent::BookCreated {
            book_id,
            total_pages,
            timestamp: now,
        });

        Ok(UploadReceipt { book_id, total_pages })
    }
}

/// Title, body and size checks, run before anything is extracted
pub fn validate(title: &str, document: &[u8], max_upload_bytes: usize) -> Result<(), UploadError> {
    if title.trim().is_empty() {
        return Err(UploadError::Validation("title is required".to_string()));
    }
    if document.is_empty() {
        return Err(UploadError::Validation("document is empty".to_string()));
    }
    if document.len() > max_upload_bytes {
        return Err(UploadError::Validation(format!(
            "document is {} bytes, limit is {}",
            document.len(),
            max_upload_bytes
        )));
    }
    Ok(())
}

fn normalize_language(language: Option<&str>) -> String {
    language
        .map(|l| l.trim().to_ascii_lowercase())
        .filter(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string())
}

/// Stream an upload that failed before it reached the coordinator
pub fn rejected(error: UploadError) -> mpsc::Receiver<UploadEvent> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(error.to_event());
    rx
}

async fn send(events: &mpsc::Sender<UploadEvent>, event: UploadEvent) {
    if events.send(event).await.is_err() {
        debug!("Upload client disconnected; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_rules() {
        assert!(validate("Moby Dick", b"Call me Ishmael.", 1024).is_ok());
        assert!(matches!(validate("  ", b"text", 1024), Err(UploadError::Validation(_))));
        assert!(matches!(validate("Title", b"", 1024), Err(UploadError::Validation(_))));
        assert!(matches!(validate("Title", &[b'a'; 11], 10), Err(UploadError::Validation(_))));
        assert!(validate("Title", &[b'a'; 10], 10).is_ok());
    }

    #[test]
    fn test_language_defaults_to_english() {
        assert_eq!(normalize_language(None), "english");
        assert_eq!(normalize_language(Some("  ")), "english");
        assert_eq!(normalize_language(Some("French")), "french");
    }

    #[test]
    fn test_error_event_carries_summary_and_details() {
        let event = UploadError::Extraction(ExtractionError::Decode {
            page: 2,
            reason: "invalid utf-8".to_string(),
        })
        .to_event();
        match event {
            UploadEvent::Error { error, details } => {
                assert_eq!(error, "Extraction failed");
                assert!(details.contains("Page 2"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_stream_has_single_error_event() {
        let mut rx = rejected(UploadError::Validation("title is required".to_string()));
        let event = rx.recv().await.unwrap();
        assert!(event.is_terminal());
        assert_eq!(event.event_type(), "error");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_status_url() {
        assert_eq!(status_url(7), "/books/7/status");
    }
}
