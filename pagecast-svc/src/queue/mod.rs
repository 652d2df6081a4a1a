//! Durable job queue and worker pool
//!
//! At-least-once dispatch backed by the SQLite `jobs` table. A dequeued job
//! is leased for a visibility timeout; if the lease lapses before the job is
//! settled, it becomes deliverable again. Settling (`ack`, `retry_after`)
//! requires the lease token handed out at dequeue, so a delivery whose lease
//! was taken over cannot settle the job.

pub mod worker_pool;

pub use worker_pool::{run_next, JobHandler, JobOutcome, WorkerPool, WorkerPoolConfig};

use crate::db::jobs;
use crate::utils::retry_on_lock;
use async_trait::async_trait;
use pagecast_common::time::to_millis;
use pagecast_common::{Clock, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// A unit of work to enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Job {
    pub fn new<T: Serialize>(kind: &str, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| Error::Internal(format!("Failed to serialize job payload: {}", e)))?;
        Ok(Self {
            kind: kind.to_string(),
            payload,
        })
    }
}

/// A leased job handed to a worker
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job_id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    /// How many times this job has been leased, this delivery included
    pub delivery_count: i64,
    pub lease_token: String,
}

impl Delivery {
    /// Deserialize the payload
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::InvalidInput(format!("job {} has malformed payload: {}", self.job_id, e))
        })
    }
}

/// Durable, at-least-once job queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue `job` under `idempotency_key`, due after `delay`
    ///
    /// No-op if a job with the key is already queued or held under a live
    /// lease; a settled job with the key is re-armed. Returns true if a job
    /// was inserted or re-armed.
    async fn enqueue(&self, job: &Job, idempotency_key: &str, delay: Duration) -> Result<bool>;

    /// Lease the oldest available job for `visibility_timeout`
    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>>;

    /// Settle a delivery as done; false if the lease was lost
    async fn ack(&self, delivery: &Delivery) -> Result<bool>;

    /// Return a delivery to the queue, due after `delay`; false if the lease was lost
    async fn retry_after(&self, delivery: &Delivery, delay: Duration) -> Result<bool>;

    /// Number of unsettled jobs
    async fn depth(&self) -> Result<i64>;

    /// Wait until work may be available, at most `max_wait`
    async fn wait_for_work(&self, max_wait: Duration);

    /// Wake idle workers, e.g. after jobs were written in an outside transaction
    fn notify_work_available(&self);
}

/// SQLite-backed [`JobQueue`]
pub struct SqliteJobQueue {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
    notify: Notify,
    max_lock_wait_ms: u64,
}

impl SqliteJobQueue {
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>, max_lock_wait_ms: u64) -> Self {
        Self {
            db,
            clock,
            notify: Notify::new(),
            max_lock_wait_ms,
        }
    }

    fn due_at(&self, delay: Duration) -> i64 {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        to_millis(self.clock.now()).saturating_add(delay_ms)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: &Job, idempotency_key: &str, delay: Duration) -> Result<bool> {
        let payload = job.payload.to_string();
        let available_at = self.due_at(delay);
        let now = to_millis(self.clock.now());

        let created = retry_on_lock("enqueue job", self.max_lock_wait_ms, || async {
            let mut conn = self.db.acquire().await?;
            jobs::upsert_job(&mut *conn, &job.kind, &payload, idempotency_key, available_at, now).await
        })
        .await?;

        debug!(idempotency_key, created, "Enqueue");
        if created && delay.is_zero() {
            self.notify.notify_waiters();
        }
        Ok(created)
    }

    async fn dequeue(&self, visibility_timeout: Duration) -> Result<Option<Delivery>> {
        let now = to_millis(self.clock.now());
        let lease_expires_at = self.due_at(visibility_timeout);
        let lease_token = Uuid::new_v4().to_string();

        let row = retry_on_lock("dequeue job", self.max_lock_wait_ms, || {
            jobs::lease_next(&self.db, now, lease_expires_at, &lease_token)
        })
        .await?;

        row.map(|row| -> Result<Delivery> {
            let payload = serde_json::from_str(&row.payload).map_err(|e| {
                Error::Internal(format!("job {} payload is not JSON: {}", row.id, e))
            })?;
            Ok(Delivery {
                job_id: row.id,
                kind: row.kind,
                payload,
                idempotency_key: row.idempotency_key,
                delivery_count: row.deliveries,
                lease_token: lease_token.clone(),
            })
        })
        .transpose()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<bool> {
        let now = to_millis(self.clock.now());
        retry_on_lock("ack job", self.max_lock_wait_ms, || {
            jobs::mark_done(&self.db, delivery.job_id, &delivery.lease_token, now)
        })
        .await
    }

    async fn retry_after(&self, delivery: &Delivery, delay: Duration) -> Result<bool> {
        let now = to_millis(self.clock.now());
        let available_at = self.due_at(delay);
        let released = retry_on_lock("release job", self.max_lock_wait_ms, || {
            jobs::release(&self.db, delivery.job_id, &delivery.lease_token, available_at, now)
        })
        .await?;

        if released && delay.is_zero() {
            self.notify.notify_waiters();
        }
        Ok(released)
    }

    async fn depth(&self) -> Result<i64> {
        jobs::count_unsettled(&self.db).await
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }

    fn notify_work_available(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NarrationJob, NARRATION_JOB_KIND};
    use chrono::Duration as ChronoDuration;
    use pagecast_common::ManualClock;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<ManualClock>, SqliteJobQueue) {
        let temp_dir = TempDir::new().unwrap();
        let pool = pagecast_common::db::init_database(&temp_dir.path().join("queue.db"))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let queue = SqliteJobQueue::new(pool, clock.clone(), 1000);
        (temp_dir, clock, queue)
    }

    fn narration(page_number: i64) -> (Job, String) {
        let job = NarrationJob::new(page_number, 1, page_number);
        (Job::new(NARRATION_JOB_KIND, &job).unwrap(), job.idempotency_key())
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_key() {
        let (_dir, _clock, queue) = setup().await;
        let (job, key) = narration(1);

        assert!(queue.enqueue(&job, &key, Duration::ZERO).await.unwrap());
        assert!(!queue.enqueue(&job, &key, Duration::ZERO).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_leases_oldest_first() {
        let (_dir, clock, queue) = setup().await;
        for n in 1..=2 {
            let (job, key) = narration(n);
            queue.enqueue(&job, &key, Duration::ZERO).await.unwrap();
            clock.advance(ChronoDuration::milliseconds(1));
        }

        let first = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.idempotency_key, "page:1:1");
        assert_eq!(second.idempotency_key, "page:1:2");
        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_none());

        let payload: NarrationJob = first.payload_as().unwrap();
        assert_eq!(payload.page_number, 1);
    }

    #[tokio::test]
    async fn test_delayed_job_is_not_due_until_clock_passes() {
        let (_dir, clock, queue) = setup().await;
        let (job, key) = narration(1);
        queue.enqueue(&job, &key, Duration::from_secs(30)).await.unwrap();

        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_none());
        clock.advance(ChronoDuration::seconds(30));
        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered_and_old_token_cannot_settle() {
        let (_dir, clock, queue) = setup().await;
        let (job, key) = narration(1);
        queue.enqueue(&job, &key, Duration::ZERO).await.unwrap();

        let first = queue.dequeue(Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(queue.dequeue(Duration::from_secs(10)).await.unwrap().is_none());

        clock.advance(ChronoDuration::seconds(11));
        let second = queue.dequeue(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.delivery_count, 2);

        assert!(!queue.ack(&first).await.unwrap(), "stale lease must not settle");
        assert!(queue.ack(&second).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_after_requeues_with_delay() {
        let (_dir, clock, queue) = setup().await;
        let (job, key) = narration(1);
        queue.enqueue(&job, &key, Duration::ZERO).await.unwrap();

        let delivery = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert!(queue.retry_after(&delivery, Duration::from_secs(5)).await.unwrap());
        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_none());

        clock.advance(ChronoDuration::seconds(5));
        assert!(queue.dequeue(Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_settled_job_is_rearmed_by_enqueue() {
        let (_dir, _clock, queue) = setup().await;
        let (job, key) = narration(1);
        queue.enqueue(&job, &key, Duration::ZERO).await.unwrap();
        let delivery = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();

        assert!(queue.enqueue(&job, &key, Duration::ZERO).await.unwrap());
        let again = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.job_id, delivery.job_id);
    }
}
