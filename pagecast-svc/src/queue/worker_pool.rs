//! Worker pool
//!
//! N tokio tasks pull from a shared [`JobQueue`] and run a [`JobHandler`] per
//! delivery. Handlers run in their own task so that a panic is contained to
//! that delivery; the job is then left leased and is redelivered once its
//! lease expires. The most recent failure is kept for `/health`.

use super::{Delivery, JobQueue};
use async_trait::async_trait;
use pagecast_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a handler wants its delivery settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Acknowledge the job
    Done,
    /// Put the job back on the queue, due after the delay
    RetryAfter(Duration),
}

/// Processes one delivery
///
/// Must be idempotent: the queue may deliver the same job more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<JobOutcome>;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

/// Running pool of queue workers
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers
    ///
    /// Workers stop taking new jobs once `cancel` fires. Queue and handler
    /// failures are written to `last_error`.
    pub fn spawn(
        config: WorkerPoolConfig,
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        last_error: Arc<RwLock<Option<String>>>,
        cancel: CancellationToken,
    ) -> Self {
        let worker_count = config.worker_count.max(1);
        info!(worker_count, "Starting worker pool");

        let handles = (0..worker_count)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                let config = config.clone();
                let last_error = Arc::clone(&last_error);
                tokio::spawn(async move {
                    worker_loop(worker_id, config, queue, handler, last_error, cancel).await;
                })
            })
            .collect();

        Self { cancel, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop taking new jobs and wait for the workers to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    config: WorkerPoolConfig,
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    last_error: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Worker started");

    while !cancel.is_cancelled() {
        match run_next(queue.as_ref(), Arc::clone(&handler), config.visibility_timeout).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.wait_for_work(config.poll_interval) => {}
                }
            }
            Err(e) => {
                warn!(worker_id, "Worker error: {}", e);
                *last_error.write().await = Some(e.to_string());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    }

    debug!(worker_id, "Worker stopped");
}

/// Dequeue one job, run the handler, and settle the delivery
///
/// Returns `Ok(None)` when the queue was empty. Handler errors and panics
/// leave the job leased for redelivery and come back as `Err`.
pub async fn run_next(
    queue: &dyn JobQueue,
    handler: Arc<dyn JobHandler>,
    visibility_timeout: Duration,
) -> Result<Option<JobOutcome>> {
    let Some(delivery) = queue.dequeue(visibility_timeout).await? else {
        return Ok(None);
    };

    debug!(
        job_id = delivery.job_id,
        key = %delivery.idempotency_key,
        delivery_count = delivery.delivery_count,
        "Job leased"
    );

    let task_delivery = delivery.clone();
    let joined = tokio::spawn(async move { handler.handle(&task_delivery).await }).await;

    let outcome = match joined {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!(
                job_id = delivery.job_id,
                key = %delivery.idempotency_key,
                "Job handler failed: {}; job will be redelivered after its lease expires",
                e
            );
            return Err(Error::Internal(format!(
                "job {} ({}) failed: {}",
                delivery.job_id, delivery.idempotency_key, e
            )));
        }
        Err(e) => {
            error!(
                job_id = delivery.job_id,
                key = %delivery.idempotency_key,
                "Job handler panicked: {}; job will be redelivered after its lease expires",
                e
            );
            return Err(Error::Internal(format!(
                "job {} ({}) panicked: {}",
                delivery.job_id, delivery.idempotency_key, e
            )));
        }
    };

    let settled = match outcome {
        JobOutcome::Done => queue.ack(&delivery).await?,
        JobOutcome::RetryAfter(delay) => queue.retry_after(&delivery, delay).await?,
    };

    if !settled {
        debug!(
            job_id = delivery.job_id,
            "Lease was taken over before settlement; outcome discarded"
        );
    }

    Ok(Some(outcome))
}
