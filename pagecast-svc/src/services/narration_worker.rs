//! Page narration worker
//!
//! Handles `narrate_page` jobs: claims the page, narrates its text, stores
//! the audio, then records the result and the book aggregate in one
//! transaction.
//!
//! Deliveries are at-least-once, so every step is guarded by the page's
//! current status. A page that is already settled (or owned by another
//! delivery) is acknowledged without side effects; a result whose page was
//! reclaimed by the recovery sweep while narration ran is discarded.

use crate::config::ServiceSettings;
use crate::db::pages::{self, Transition};
use crate::models::{NarrationJob, Page, VoiceConfig, NARRATION_JOB_KIND, NO_TEXT_CONTENT};
use crate::queue::{Delivery, JobHandler, JobOutcome};
use crate::services::audio_store::{AudioStore, StorageError};
use crate::services::narrator::{NarrationError, Narrator};
use crate::services::progress_aggregator::ProgressAggregator;
use crate::utils::retry_on_lock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagecast_common::events::{EventBus, PageStatus, PagecastEvent};
use pagecast_common::{Clock, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a narration attempt failed
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Narration(#[from] NarrationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What processing a job did to its page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrationResult {
    /// The page row no longer exists
    PageMissing,
    /// Page was already completed or failed
    AlreadySettled,
    /// Page is processing under another delivery, or the claim lost a race
    NotClaimed,
    Completed,
    /// Attempt failed; the page is pending again and the job is due after the delay
    RetryScheduled(Duration),
    /// Attempts exhausted
    Failed,
    /// The page was reclaimed while this attempt ran; its result was dropped
    Discarded,
}

/// [`JobHandler`] for page narration
pub struct NarrationWorker {
    db: SqlitePool,
    narrator: Arc<dyn Narrator>,
    store: Arc<dyn AudioStore>,
    aggregator: ProgressAggregator,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
}

impl NarrationWorker {
    pub fn new(
        db: SqlitePool,
        narrator: Arc<dyn Narrator>,
        store: Arc<dyn AudioStore>,
        aggregator: ProgressAggregator,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            db,
            narrator,
            store,
            aggregator,
            event_bus,
            clock,
            settings,
        }
    }

    /// Process one narration job
    ///
    /// Errors are infrastructure failures (database unavailable); the
    /// narration outcome itself is always reported through the result.
    pub async fn process(&self, job: &NarrationJob) -> Result<NarrationResult> {
        let Some((page, language)) = pages::get_page_for_narration(&self.db, job.page_id).await? else {
            warn!(page_id = job.page_id, book_id = job.book_id, "Narration job for missing page");
            return Ok(NarrationResult::PageMissing);
        };

        match page.processing_status {
            PageStatus::Completed | PageStatus::Failed => {
                debug!(
                    book_id = page.book_id,
                    page_number = page.page_number,
                    status = %page.processing_status,
                    "Page already settled, nothing to do"
                );
                return Ok(NarrationResult::AlreadySettled);
            }
            PageStatus::Processing => {
                debug!(
                    book_id = page.book_id,
                    page_number = page.page_number,
                    "Page is being narrated by another delivery"
                );
                return Ok(NarrationResult::NotClaimed);
            }
            PageStatus::Pending => {}
        }

        let claimed_at = self.clock.now();
        let claimed = retry_on_lock("claim page", self.settings.db_max_lock_wait_ms, || {
            pages::claim(&self.db, page.id, claimed_at)
        })
        .await?;
        if !claimed {
            return Ok(NarrationResult::NotClaimed);
        }

        if page.is_blank() {
            return self.finish(&page, claimed_at, None, 0.0, Some(NO_TEXT_CONTENT)).await;
        }

        let started = Instant::now();
        match self.narrate(&page, language).await {
            Ok((audio_ref, duration)) => {
                debug!(
                    book_id = page.book_id,
                    page_number = page.page_number,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Narration attempt succeeded"
                );
                self.finish(&page, claimed_at, Some(&audio_ref), duration, None).await
            }
            Err(e) => self.record_failure(&page, claimed_at, e).await,
        }
    }

    async fn narrate(&self, page: &Page, language: String) -> std::result::Result<(String, f64), AttemptError> {
        let voice = VoiceConfig::new(language, self.settings.default_voice_gender);

        let narration = self.narrator.narrate(&page.text_content, &voice).await?;
        let audio_ref = self.store.put(&narration.audio).await?;
        Ok((audio_ref, narration.duration))
    }

    async fn finish(
        &self,
        page: &Page,
        claimed_at: DateTime<Utc>,
        audio_ref: Option<&str>,
        duration: f64,
        note: Option<&str>,
    ) -> Result<NarrationResult> {
        let transition = Transition::Complete {
            claimed_at,
            audio_ref,
            audio_duration: duration,
            note,
        };
        let settled = self
            .aggregator
            .settle_page(page.book_id, page.id, transition)
            .await?;

        if settled.is_none() {
            info!(
                book_id = page.book_id,
                page_number = page.page_number,
                "Page was reclaimed during narration; result discarded"
            );
            return Ok(NarrationResult::Discarded);
        }

        info!(
            book_id = page.book_id,
            page_number = page.page_number,
            audio_duration = duration,
            "Page narrated"
        );
        self.event_bus.emit_lossy(PagecastEvent::PageNarrated {
            book_id: page.book_id,
            page_number: page.page_number,
            audio_duration: duration,
            timestamp: self.clock.now(),
        });
        Ok(NarrationResult::Completed)
    }

    async fn record_failure(
        &self,
        page: &Page,
        claimed_at: DateTime<Utc>,
        error: AttemptError,
    ) -> Result<NarrationResult> {
        let attempt = page.attempt_count + 1;
        let message = error.to_string();
        let exhausted = attempt >= self.settings.max_attempts;
        let next_status = if exhausted { PageStatus::Failed } else { PageStatus::Pending };
        let transition = Transition::FailAttempt {
            claimed_at,
            next_status,
            attempt_count: attempt,
            error: &message,
        };
        let settled = self
            .aggregator
            .settle_page(page.book_id, page.id, transition)
            .await?;
        let now = self.clock.now();

        if settled.is_none() {
            info!(
                book_id = page.book_id,
                page_number = page.page_number,
                "Page was reclaimed during narration; failure discarded"
            );
            return Ok(NarrationResult::Discarded);
        }

        if exhausted {
            warn!(
                book_id = page.book_id,
                page_number = page.page_number,
                attempts = attempt,
                error = %message,
                "Page narration failed permanently"
            );
            self.event_bus.emit_lossy(PagecastEvent::PageFailed {
                book_id: page.book_id,
                page_number: page.page_number,
                attempts: attempt,
                error: message,
                timestamp: now,
            });
            return Ok(NarrationResult::Failed);
        }

        let delay = self.settings.backoff_delay(attempt - 1);
        warn!(
            book_id = page.book_id,
            page_number = page.page_number,
            attempt,
            max_attempts = self.settings.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Narration attempt failed, retry scheduled"
        );
        self.event_bus.emit_lossy(PagecastEvent::PageRetryScheduled {
            book_id: page.book_id,
            page_number: page.page_number,
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: message,
            timestamp: now,
        });
        Ok(NarrationResult::RetryScheduled(delay))
    }
}

#[async_trait]
impl JobHandler for NarrationWorker {
    async fn handle(&self, delivery: &Delivery) -> Result<JobOutcome> {
        if delivery.kind != NARRATION_JOB_KIND {
            warn!(job_id = delivery.job_id, kind = %delivery.kind, "Unknown job kind, dropping");
            return Ok(JobOutcome::Done);
        }

        let job: NarrationJob = match delivery.payload_as() {
            Ok(job) => job,
            Err(e) => {
                warn!("Dropping job: {}", e);
                return Ok(JobOutcome::Done);
            }
        };

        match self.process(&job).await? {
            NarrationResult::RetryScheduled(delay) => Ok(JobOutcome::RetryAfter(delay)),
            _ => Ok(JobOutcome::Done),
        }
    }
}
