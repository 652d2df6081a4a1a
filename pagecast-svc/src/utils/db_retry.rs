//! Lock-contention retry for short write transactions
//!
//! The pool's `busy_timeout` absorbs most contention inside SQLite itself.
//! What still surfaces as "database is locked" (a deferred transaction that
//! cannot be upgraded, for one) is retried here: the whole operation reruns
//! with doubling pauses until `budget_ms` is spent. Other errors pass
//! straight through.

use pagecast_common::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const FIRST_PAUSE: Duration = Duration::from_millis(5);
const MAX_PAUSE: Duration = Duration::from_millis(250);

/// Run `op`, rerunning it on lock contention until `budget_ms` elapses
///
/// `op` must start a fresh transaction on every call. Once the budget is
/// spent the last contention error is returned unchanged.
pub async fn retry_on_lock<F, Fut, T>(what: &str, budget_ms: u64, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + Duration::from_millis(budget_ms);
    let mut pause = FIRST_PAUSE;
    let mut retries = 0u32;

    loop {
        match op().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(operation = what, retries, "Database lock cleared");
                }
                return Ok(value);
            }
            Err(e) if e.is_lock_contention() && Instant::now() + pause < deadline => {
                retries += 1;
                debug!(operation = what, retries, pause_ms = pause.as_millis() as u64, "Database locked, retrying");
                tokio::time::sleep(pause).await;
                pause = (pause * 2).min(MAX_PAUSE);
            }
            Err(e) if e.is_lock_contention() => {
                warn!(operation = what, retries, budget_ms, "Database still locked, giving up");
                return Err(e);
            }
            Err(e) => return Err(e),
        }
    }
}
