//! Event types for the Pagecast event system
//!
//! Provides shared event definitions and the EventBus used to fan lifecycle
//! notifications out to SSE subscribers and loggers.

mod book_types;
mod upload_types;

pub use book_types::{BookStatus, PageStatus, UnknownStatus};
pub use upload_types::UploadEvent;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Service-wide lifecycle events
///
/// Broadcast via EventBus and serialized for the `/events` SSE feed. The
/// per-connection upload stream uses [`UploadEvent`] instead; the coordinator
/// mirrors the milestones of that stream here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PagecastEvent {
    /// Upload accepted, extraction starting
    UploadStarted {
        title: String,
        total_pages: usize,
        timestamp: DateTime<Utc>,
    },

    /// Upload aborted before anything was persisted
    UploadFailed {
        title: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Book and pages committed and narration jobs enqueued
    BookCreated {
        book_id: i64,
        total_pages: usize,
        timestamp: DateTime<Utc>,
    },

    /// A page reached `completed`
    PageNarrated {
        book_id: i64,
        page_number: i64,
        /// Audio duration in seconds (0 for pages without text)
        audio_duration: f64,
        timestamp: DateTime<Utc>,
    },

    /// A narration attempt failed and the page was re-queued
    PageRetryScheduled {
        book_id: i64,
        page_number: i64,
        attempt: i64,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A page exhausted its attempts
    PageFailed {
        book_id: i64,
        page_number: i64,
        attempts: i64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Derived book state was recomputed
    BookProgressChanged {
        book_id: i64,
        status: BookStatus,
        progress: u8,
        timestamp: DateTime<Utc>,
    },

    /// Recovery sweep finished a pass
    SweepCompleted {
        pages_requeued: usize,
        pages_failed: usize,
        books_failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl PagecastEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            PagecastEvent::UploadStarted { .. } => "UploadStarted",
            PagecastEvent::UploadFailed { .. } => "UploadFailed",
            PagecastEvent::BookCreated { .. } => "BookCreated",
            PagecastEvent::PageNarrated { .. } => "PageNarrated",
            PagecastEvent::PageRetryScheduled { .. } => "PageRetryScheduled",
            PagecastEvent::PageFailed { .. } => "PageFailed",
            PagecastEvent::BookProgressChanged { .. } => "BookProgressChanged",
            PagecastEvent::SweepCompleted { .. } => "SweepCompleted",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for application-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use pagecast_common::events::{EventBus, PagecastEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(PagecastEvent::BookCreated {
///     book_id: 7,
///     total_pages: 3,
///     timestamp: chrono::Utc::now(),
/// });
///
/// let received = rx.try_recv().unwrap();
/// assert_eq!(received.event_type(), "BookCreated");
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PagecastEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// `capacity` is the number of events buffered before the oldest are
    /// dropped for lagging subscribers.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<PagecastEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PagecastEvent,
    ) -> Result<usize, broadcast::error::SendError<PagecastEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PagecastEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
