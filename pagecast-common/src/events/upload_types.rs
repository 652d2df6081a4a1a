//! Upload stream event definitions
//!
//! The synchronous upload connection carries a closed, ordered sequence of
//! these events. Every well-formed stream ends with exactly one terminal
//! event (`Completed` or `Error`); a stream that closes without one must be
//! treated by the client as a failed upload.

use serde::{Deserialize, Serialize};

/// Event pushed to the uploading client while its document is extracted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// Free-form status line (validation passed, saving, ...)
    Status { message: String },

    /// Extraction is about to start
    ProcessingStarted { total_pages: usize },

    /// One page was extracted
    PageProgress {
        current_page: usize,
        total_pages: usize,
        progress_percent: u8,
        extracted_chars: usize,
    },

    /// Book and pages committed, narration jobs enqueued
    Completed {
        book_id: i64,
        total_pages: usize,
        status_url: String,
    },

    /// Upload aborted; nothing was persisted
    Error { error: String, details: String },
}

impl UploadEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            UploadEvent::Status { .. } => "status",
            UploadEvent::ProcessingStarted { .. } => "processing_started",
            UploadEvent::PageProgress { .. } => "page_progress",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Error { .. } => "error",
        }
    }

    /// True for `Completed` and `Error`
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadEvent::Completed { .. } | UploadEvent::Error { .. })
    }

    /// Build a `PageProgress` event, rounding the percentage to the nearest integer
    ///
    /// Three pages report 33, 67, 100.
    pub fn page_progress(current_page: usize, total_pages: usize, extracted_chars: usize) -> Self {
        let progress_percent = if total_pages == 0 {
            100
        } else {
            ((current_page as f64 * 100.0 / total_pages as f64).round() as u64).min(100) as u8
        };
        UploadEvent::PageProgress {
            current_page,
            total_pages,
            progress_percent,
            extracted_chars,
        }
    }
}
