//! Book and Page records

use chrono::{DateTime, Utc};
use pagecast_common::events::{BookStatus, PageStatus};
use serde::{Deserialize, Serialize};

/// Default narration language for uploads that do not name one
pub const DEFAULT_LANGUAGE: &str = "english";

/// Error text recorded on pages that had nothing to narrate
pub const NO_TEXT_CONTENT: &str = "No text content";

/// An uploaded document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    /// Narration language; selects the voice
    pub language: String,
    pub total_pages: i64,
    pub processing_status: BookStatus,
    /// Derived by the progress aggregator, never incremented directly
    pub processing_progress: u8,
    /// Sum of page audio durations in seconds, set once the book completes
    pub total_duration: Option<f64>,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One page of a book and its narration state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub book_id: i64,
    /// 1-based, contiguous within the book
    pub page_number: i64,
    pub text_content: String,
    /// Durable storage reference for the narrated audio
    pub audio_ref: Option<String>,
    /// Audio length in seconds
    pub audio_duration: Option<f64>,
    pub processing_status: PageStatus,
    pub attempt_count: i64,
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Page {
    /// True when there is nothing to narrate
    pub fn is_blank(&self) -> bool {
        self.text_content.trim().is_empty()
    }
}

/// Input for creating a book together with its pages
#[derive(Debug, Clone)]
pub struct NewBook {
    pub title: String,
    pub language: String,
    /// Extracted text, index 0 is page 1
    pub pages: Vec<String>,
}
