//! Book-level progress derived from page states
//!
//! [`aggregate`] is a pure function of a book's page set. The stored
//! `processing_progress` / `processing_status` columns are only ever written
//! from such an aggregate, computed inside the same transaction that read
//! the pages, so concurrent page completions cannot lose updates.
//!
//! Page transitions out of `processing` go through
//! [`ProgressAggregator::settle_page`], which commits the page write and the
//! book's new derived state together.

use crate::db::books::{self, DerivedState};
use crate::db::pages::{self, PageSnapshot, Transition};
use crate::models::Book;
use crate::utils::retry_on_lock;
use pagecast_common::events::{BookStatus, EventBus, PageStatus, PagecastEvent};
use pagecast_common::{Clock, Result};
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info};

/// Page counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl PageCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Pending or processing
    pub fn in_flight(&self) -> usize {
        self.pending + self.processing
    }
}

/// Everything derivable from a book's pages
#[derive(Debug, Clone, PartialEq)]
pub struct BookAggregate {
    pub counts: PageCounts,
    pub total_pages: usize,
    /// floor(100 × completed / total)
    pub progress_percent: u8,
    pub audio_ready: bool,
    pub status: BookStatus,
    /// Completed pages that have stored audio
    pub pages_with_audio: usize,
    /// Sum of page durations, seconds
    pub total_duration: f64,
}

/// floor(100 × completed / total); an empty book counts as done
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed.min(total) * 100) / total) as u8
}

/// Derive book state from its pages
pub fn aggregate(pages: &[PageSnapshot]) -> BookAggregate {
    let mut counts = PageCounts::default();
    let mut pages_with_audio = 0;
    let mut total_duration = 0.0;

    for page in pages {
        match page.status {
            PageStatus::Pending => counts.pending += 1,
            PageStatus::Processing => counts.processing += 1,
            PageStatus::Completed => {
                counts.completed += 1;
                if page.audio_ref.is_some() {
                    pages_with_audio += 1;
                }
            }
            PageStatus::Failed => counts.failed += 1,
        }
        total_duration += page.audio_duration.unwrap_or(0.0);
    }

    let total_pages = pages.len();
    let audio_ready = counts.completed == total_pages;
    let status = if audio_ready {
        BookStatus::Completed
    } else if counts.failed > 0 && counts.in_flight() == 0 {
        BookStatus::Failed
    } else {
        BookStatus::Processing
    };

    BookAggregate {
        counts,
        total_pages,
        progress_percent: progress_percent(counts.completed, total_pages),
        audio_ready,
        status,
        pages_with_audio,
        total_duration,
    }
}

impl BookAggregate {
    /// Columns to persist on the book row
    pub fn derived_state(&self) -> DerivedState {
        DerivedState {
            status: self.status,
            progress: self.progress_percent,
            total_duration: (self.status == BookStatus::Completed).then_some(self.total_duration),
            processing_error: (self.status == BookStatus::Failed).then(|| {
                format!(
                    "{} of {} pages failed narration",
                    self.counts.failed, self.total_pages
                )
            }),
        }
    }

    /// Replace a book's stored derived columns with this aggregate
    pub fn overlay(&self, book: &mut Book) {
        let derived = self.derived_state();
        book.processing_status = derived.status;
        book.processing_progress = derived.progress;
        book.total_duration = derived.total_duration;
        book.processing_error = derived.processing_error;
    }
}

/// Result of a recompute
#[derive(Debug, Clone, PartialEq)]
pub struct Recomputed {
    pub previous_status: BookStatus,
    pub previous_progress: u8,
    pub aggregate: BookAggregate,
}

impl Recomputed {
    pub fn changed(&self) -> bool {
        self.previous_status != self.aggregate.status
            || self.previous_progress != self.aggregate.progress_percent
    }
}

/// Reads and persists book aggregates
#[derive(Clone)]
pub struct ProgressAggregator {
    db: SqlitePool,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    max_lock_wait_ms: u64,
}

impl ProgressAggregator {
    pub fn new(db: SqlitePool, event_bus: EventBus, clock: Arc<dyn Clock>, max_lock_wait_ms: u64) -> Self {
        Self {
            db,
            event_bus,
            clock,
            max_lock_wait_ms,
        }
    }

    /// Book plus an aggregate of its pages, from one read snapshot
    pub async fn snapshot(&self, book_id: i64) -> Result<Option<(Book, BookAggregate)>> {
        let mut tx = self.db.begin().await?;
        let Some(book) = books::get_book_in(&mut *tx, book_id).await? else {
            return Ok(None);
        };
        let pages = pages::snapshot_for_book(&mut *tx, book_id).await?;
        tx.commit().await?;
        Ok(Some((book, aggregate(&pages))))
    }

    /// Recompute and persist the derived state of a book
    ///
    /// The book row is write-locked before the pages are read, so the
    /// aggregate and the write come from the same serialized view. Returns
    /// None if the book does not exist.
    pub async fn recompute(&self, book_id: i64) -> Result<Option<Recomputed>> {
        let recomputed = retry_on_lock("recompute book progress", self.max_lock_wait_ms, || {
            self.recompute_once(book_id)
        })
        .await?;

        if let Some(result) = &recomputed {
            self.publish(book_id, result);
        }
        Ok(recomputed)
    }

    /// Apply a page transition and recompute its book in one transaction
    ///
    /// Returns None when the transition did not apply (the page moved on
    /// since it was read) or the book is gone; nothing is written then.
    pub async fn settle_page(
        &self,
        book_id: i64,
        page_id: i64,
        transition: Transition<'_>,
    ) -> Result<Option<Recomputed>> {
        let settled = retry_on_lock("settle page", self.max_lock_wait_ms, || {
            self.settle_page_once(book_id, page_id, transition)
        })
        .await?;

        if let Some(result) = &settled {
            self.publish(book_id, result);
        }
        Ok(settled)
    }

    async fn settle_page_once(
        &self,
        book_id: i64,
        page_id: i64,
        transition: Transition<'_>,
    ) -> Result<Option<Recomputed>> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;

        if !books::lock_for_update(&mut *tx, book_id).await? {
            return Ok(None);
        }
        if !pages::apply(&mut *tx, page_id, transition, now).await? {
            return Ok(None);
        }
        let recomputed = Self::recompute_in(&mut *tx, book_id, now).await?;
        tx.commit().await?;
        Ok(recomputed)
    }

    async fn recompute_once(&self, book_id: i64) -> Result<Option<Recomputed>> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await?;

        if !books::lock_for_update(&mut *tx, book_id).await? {
            return Ok(None);
        }
        let recomputed = Self::recompute_in(&mut *tx, book_id, now).await?;
        tx.commit().await?;
        Ok(recomputed)
    }

    /// Aggregate and write, on a connection that already holds the book's lock
    async fn recompute_in(
        conn: &mut SqliteConnection,
        book_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Recomputed>> {
        let Some(book) = books::get_book_in(&mut *conn, book_id).await? else {
            return Ok(None);
        };

        let pages = pages::snapshot_for_book(&mut *conn, book_id).await?;
        let aggregate = aggregate(&pages);
        books::write_derived_state(&mut *conn, book_id, &aggregate.derived_state(), now).await?;

        Ok(Some(Recomputed {
            previous_status: book.processing_status,
            previous_progress: book.processing_progress,
            aggregate,
        }))
    }

    fn publish(&self, book_id: i64, result: &Recomputed) {
        let aggregate = &result.aggregate;
        debug!(
            book_id,
            status = %aggregate.status,
            progress = aggregate.progress_percent,
            completed = aggregate.counts.completed,
            failed = aggregate.counts.failed,
            "Book progress recomputed"
        );

        if !result.changed() {
            return;
        }
        if result.previous_status != aggregate.status && aggregate.status.is_terminal() {
            info!(
                book_id,
                status = %aggregate.status,
                pages_with_audio = aggregate.pages_with_audio,
                total_pages = aggregate.total_pages,
                "Book narration settled"
            );
        }
        self.event_bus.emit_lossy(PagecastEvent::BookProgressChanged {
            book_id,
            status: aggregate.status,
            progress: aggregate.progress_percent,
            timestamp: self.clock.now(),
        });
    }
}
