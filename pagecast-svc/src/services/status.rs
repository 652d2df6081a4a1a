//! Book status snapshots for polling clients

use crate::services::progress_aggregator::{BookAggregate, PageCounts, ProgressAggregator};
use chrono::{DateTime, Utc};
use pagecast_common::events::BookStatus;
use pagecast_common::{Clock, Result};
use serde::{Serialize, Serializer};
use std::sync::Arc;

/// Estimated time until narration settles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRemaining {
    Seconds(u64),
    /// No page has completed yet, so there is no rate to extrapolate
    Unknown,
}

impl Serialize for TimeRemaining {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TimeRemaining::Seconds(secs) => serializer.serialize_u64(*secs),
            TimeRemaining::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

/// `(elapsed / completed) × remaining`, where remaining counts in-flight pages
pub fn estimate_time_remaining(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    counts: &PageCounts,
) -> TimeRemaining {
    if counts.completed == 0 {
        return TimeRemaining::Unknown;
    }
    let elapsed_secs = (now - created_at).num_milliseconds().max(0) as f64 / 1000.0;
    let per_page = elapsed_secs / counts.completed as f64;
    TimeRemaining::Seconds((per_page * counts.in_flight() as f64).round() as u64)
}

/// Response body of the status endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookStatusReport {
    pub book_id: i64,
    pub processing_status: BookStatus,
    pub processing_progress: u8,
    pub total_pages: usize,
    pub pages_status: PageCounts,
    pub audio_ready: bool,
    pub pages_with_audio: usize,
    pub estimated_time_remaining: TimeRemaining,
}

impl BookStatusReport {
    pub fn from_aggregate(
        book_id: i64,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
        aggregate: &BookAggregate,
    ) -> Self {
        Self {
            book_id,
            processing_status: aggregate.status,
            processing_progress: aggregate.progress_percent,
            total_pages: aggregate.total_pages,
            pages_status: aggregate.counts,
            audio_ready: aggregate.audio_ready,
            pages_with_audio: aggregate.pages_with_audio,
            estimated_time_remaining: estimate_time_remaining(created_at, now, &aggregate.counts),
        }
    }
}

/// Stateless status lookup
///
/// Derives everything from the current page rows; never waits on in-flight
/// narration.
#[derive(Clone)]
pub struct StatusService {
    aggregator: ProgressAggregator,
    clock: Arc<dyn Clock>,
}

impl StatusService {
    pub fn new(aggregator: ProgressAggregator, clock: Arc<dyn Clock>) -> Self {
        Self { aggregator, clock }
    }

    /// None if the book does not exist
    pub async fn book_status(&self, book_id: i64) -> Result<Option<BookStatusReport>> {
        let Some((book, aggregate)) = self.aggregator.snapshot(book_id).await? else {
            return Ok(None);
        };
        Ok(Some(BookStatusReport::from_aggregate(
            book.id,
            book.created_at,
            self.clock.now(),
            &aggregate,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn counts(pending: usize, processing: usize, completed: usize, failed: usize) -> PageCounts {
        PageCounts {
            pending,
            processing,
            completed,
            failed,
        }
    }

    #[test]
    fn test_unknown_until_first_completion() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let eta = estimate_time_remaining(start, start + Duration::seconds(90), &counts(3, 1, 0, 0));
        assert_eq!(eta, TimeRemaining::Unknown);
        assert_eq!(serde_json::to_value(eta).unwrap(), serde_json::json!("unknown"));
    }

    #[test]
    fn test_extrapolates_from_completed_rate() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        // 2 pages in 60s → 30s per page, 3 pages left
        let eta = estimate_time_remaining(start, start + Duration::seconds(60), &counts(2, 1, 2, 1));
        assert_eq!(eta, TimeRemaining::Seconds(90));
        assert_eq!(serde_json::to_value(eta).unwrap(), serde_json::json!(90));
    }

    #[test]
    fn test_nothing_left_is_zero() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let eta = estimate_time_remaining(start, start + Duration::seconds(60), &counts(0, 0, 3, 0));
        assert_eq!(eta, TimeRemaining::Seconds(0));
    }
}
