//! Recovery sweep
//!
//! Reconciles work that a lost worker left behind:
//! - pages stuck in `processing` past the staleness threshold go back to
//!   `pending` (and are re-enqueued), or to `failed` if the lost attempt
//!   was their last;
//! - pending pages with no live job get one;
//! - books still `processing` whose stored progress or status drifted from
//!   their pages (every page settled, or a page write whose recompute never
//!   ran) are recomputed.
//!
//! Runs on an interval inside the service and on demand via the admin API.

use crate::config::ServiceSettings;
use crate::db::books;
use crate::db::pages::{self, Transition};
use crate::models::{NarrationJob, NARRATION_JOB_KIND};
use crate::queue::{Job, JobQueue};
use crate::services::progress_aggregator::{ProgressAggregator, Recomputed};
use pagecast_common::events::{BookStatus, EventBus, PageStatus, PagecastEvent};
use pagecast_common::{Clock, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn became_failed(result: &Recomputed) -> bool {
    result.previous_status != BookStatus::Failed && result.aggregate.status == BookStatus::Failed
}

/// What one sweep pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stale pages returned to `pending`
    pub pages_requeued: usize,
    /// Stale pages whose lost attempt was their last
    pub pages_failed: usize,
    /// Books moved to `failed`
    pub books_failed: usize,
    /// Pending pages that had no live job and were given one
    pub jobs_rearmed: usize,
    /// Books whose stored state had drifted from their pages
    pub books_reconciled: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RecoverySweep {
    db: SqlitePool,
    queue: Arc<dyn JobQueue>,
    aggregator: ProgressAggregator,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
}

impl RecoverySweep {
    pub fn new(
        db: SqlitePool,
        queue: Arc<dyn JobQueue>,
        aggregator: ProgressAggregator,
        event_bus: EventBus,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            db,
            queue,
            aggregator,
            event_bus,
            clock,
            settings,
        }
    }

    /// Run one sweep pass
    pub async fn run_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let now = self.clock.now();
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = now - stale_after;

        for page in pages::find_stale_processing(&self.db, cutoff).await? {
            let attempt = page.attempt_count + 1;
            let exhausted = attempt >= self.settings.max_attempts;
            let next_status = if exhausted { PageStatus::Failed } else { PageStatus::Pending };
            let error = format!(
                "Narration attempt lost: no progress for {}s",
                self.settings.stale_after.as_secs()
            );

            let transition = Transition::Reclaim {
                cutoff,
                next_status,
                attempt_count: attempt,
                error: &error,
            };
            let Some(settled) = self
                .aggregator
                .settle_page(page.book_id, page.id, transition)
                .await?
            else {
                debug!(page_id = page.id, "Stale page settled before it could be reclaimed");
                continue;
            };
            if became_failed(&settled) {
                report.books_failed += 1;
            }

            if exhausted {
                report.pages_failed += 1;
                warn!(
                    book_id = page.book_id,
                    page_number = page.page_number,
                    attempts = attempt,
                    "Stale page failed permanently"
                );
                self.event_bus.emit_lossy(PagecastEvent::PageFailed {
                    book_id: page.book_id,
                    page_number: page.page_number,
                    attempts: attempt,
                    error,
                    timestamp: now,
                });
            } else {
                report.pages_requeued += 1;
                info!(
                    book_id = page.book_id,
                    page_number = page.page_number,
                    attempt,
                    "Stale page returned to pending"
                );
                self.enqueue(NarrationJob::new(page.id, page.book_id, page.page_number))
                    .await?;
            }
        }

        for job in pages::pending_without_job(&self.db).await? {
            if self.enqueue(job).await? {
                report.jobs_rearmed += 1;
                info!(
                    book_id = job.book_id,
                    page_number = job.page_number,
                    "Re-armed narration job for orphaned pending page"
                );
            }
        }

        for book_id in books::needing_recompute(&self.db).await? {
            let Some(result) = self.aggregator.recompute(book_id).await? else {
                continue;
            };
            if result.changed() {
                report.books_reconciled += 1;
                info!(
                    book_id,
                    status = %result.aggregate.status,
                    progress = result.aggregate.progress_percent,
                    "Reconciled drifted book state"
                );
            }
            if became_failed(&result) {
                report.books_failed += 1;
            }
        }

        if report.is_empty() {
            debug!("Recovery sweep found nothing to do");
        } else {
            info!(
                pages_requeued = report.pages_requeued,
                pages_failed = report.pages_failed,
                books_failed = report.books_failed,
                jobs_rearmed = report.jobs_rearmed,
                books_reconciled = report.books_reconciled,
                "Recovery sweep completed"
            );
        }
        self.event_bus.emit_lossy(PagecastEvent::SweepCompleted {
            pages_requeued: report.pages_requeued,
            pages_failed: report.pages_failed,
            books_failed: report.books_failed,
            timestamp: self.clock.now(),
        });

        Ok(report)
    }

    async fn enqueue(&self, job: NarrationJob) -> Result<bool> {
        let queued = Job::new(NARRATION_JOB_KIND, &job)?;
        self.queue
            .enqueue(&queued, &job.idempotency_key(), Duration::ZERO)
            .await
    }

    /// Run the sweep every `interval` until `cancel` fires
    ///
    /// The first pass runs immediately, picking up whatever a previous
    /// process left in flight. The wait between passes is measured on the
    /// service clock and starts when a pass finishes.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        info!(interval_ms = interval.as_millis() as u64, "Starting recovery sweep");
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.run_once().await {
                    warn!("Recovery sweep failed: {}", e);
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.clock.sleep(interval) => {}
                }
            }

            debug!("Recovery sweep stopped");
        })
    }
}
