//! Timestamp utilities and the clock abstraction
//!
//! Timestamps are persisted as integer Unix milliseconds so that staleness and
//! availability comparisons can be done directly in SQL.

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Convert a timestamp to Unix milliseconds for storage
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert stored Unix milliseconds back to a timestamp
///
/// Out-of-range values clamp to the Unix epoch.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// Source of "now" for scheduling decisions
///
/// Queue availability, staleness detection, and the sweep timer all read time
/// through this trait so tests can drive them deterministically.
pub trait Clock: Send + Sync {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;

    /// Resolves once `duration` has passed on this clock
    fn sleep(&self, duration: std::time::Duration) -> BoxFuture<'static, ()>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: std::time::Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock for tests
///
/// Sleepers wake only when [`advance`](Self::advance) or [`set`](Self::set)
/// moves the clock past their deadline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    current: Mutex<DateTime<Utc>>,
    moved: Notify,
}

impl ManualInner {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                current: Mutex::new(start),
                moved: Notify::new(),
            }),
        }
    }

    /// Create a clock frozen at the current wall time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        {
            let mut current = self.inner.current.lock().unwrap_or_else(|e| e.into_inner());
            *current += by;
        }
        self.inner.moved.notify_waiters();
    }

    /// Jump to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        {
            let mut current = self.inner.current.lock().unwrap_or_else(|e| e.into_inner());
            *current = to;
        }
        self.inner.moved.notify_waiters();
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    fn sleep(&self, duration: std::time::Duration) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(&self.inner);
        let deadline = inner.now() + Duration::from_std(duration).unwrap_or_else(|_| Duration::weeks(52 * 100));
        Box::pin(async move {
            loop {
                // Register before checking so an advance in between is not missed
                let moved = inner.moved.notified();
                if inner.now() >= deadline {
                    return;
                }
                moved.await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800);
    }

    #[test]
    fn test_millis_to_duration_one_second() {
        let duration = millis_to_duration(1000);
        assert_eq!(duration, std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_millis_round_trip_keeps_millisecond_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap() + Duration::milliseconds(457);
        assert_eq!(from_millis(to_millis(ts)), ts);
    }

    #[test]
    fn test_manual_clock_advances_only_when_told() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn test_manual_sleep_wakes_only_after_advance() {
        let clock = ManualClock::starting_now();
        let mut sleeper = tokio::spawn(clock.sleep(std::time::Duration::from_secs(60)));

        clock.advance(Duration::seconds(30));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut sleeper)
                .await
                .is_err(),
            "woke before its deadline"
        );

        clock.advance(Duration::seconds(30));
        tokio::time::timeout(std::time::Duration::from_secs(5), sleeper)
            .await
            .expect("sleeper should wake")
            .unwrap();
    }

    #[test]
    fn test_system_clock_tracks_wall_time() {
        let before = Utc::now();
        let reading = SystemClock.now();
        assert!(reading >= before);
    }
}
