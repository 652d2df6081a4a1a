//! Runtime settings for pagecast-svc
//!
//! Tunables live in the database `settings` table so they can be changed
//! without touching the bootstrap TOML. Missing or NULL keys are initialized
//! with the built-in defaults and written back on load.

use crate::models::VoiceGender;
use pagecast_common::db::ensure_setting;
use pagecast_common::Result;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

pub const MAX_ATTEMPTS: &str = "max_attempts";
pub const RETRY_BASE_DELAY_MS: &str = "retry_base_delay_ms";
pub const RETRY_MAX_DELAY_MS: &str = "retry_max_delay_ms";
pub const STALE_AFTER_MS: &str = "stale_after_ms";
pub const SWEEP_INTERVAL_MS: &str = "sweep_interval_ms";
pub const VISIBILITY_TIMEOUT_MS: &str = "visibility_timeout_ms";
pub const WORKER_COUNT: &str = "worker_count";
pub const QUEUE_POLL_INTERVAL_MS: &str = "queue_poll_interval_ms";
pub const MAX_UPLOAD_BYTES: &str = "max_upload_bytes";
pub const DEFAULT_VOICE_GENDER: &str = "default_voice_gender";
pub const DB_MAX_LOCK_WAIT_MS: &str = "db_max_lock_wait_ms";

/// `worker_count` value meaning "derive from available parallelism"
pub const WORKER_COUNT_AUTO: &str = "auto";

/// Runtime settings, loaded once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    /// Narration attempts per page before it is failed permanently
    pub max_attempts: i64,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// A page in `processing` untouched for this long is presumed orphaned
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    /// Lease length for a dequeued job
    pub visibility_timeout: Duration,
    pub worker_count: usize,
    /// Upper bound on how long an idle worker waits before polling again
    pub queue_poll_interval: Duration,
    pub max_upload_bytes: usize,
    pub default_voice_gender: VoiceGender,
    /// Total retry budget for SQLite lock contention
    pub db_max_lock_wait_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(60_000),
            retry_max_delay: Duration::from_millis(900_000),
            stale_after: Duration::from_millis(7_200_000),
            sweep_interval: Duration::from_millis(60_000),
            visibility_timeout: Duration::from_millis(600_000),
            worker_count: auto_worker_count(),
            queue_poll_interval: Duration::from_millis(500),
            max_upload_bytes: 52_428_800,
            default_voice_gender: VoiceGender::Female,
            db_max_lock_wait_ms: 5000,
        }
    }
}

/// Available parallelism × 2
pub fn auto_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

impl ServiceSettings {
    /// Load settings from the database, writing back defaults for missing keys
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let defaults = Self::default();

        let max_attempts = load_parsed(pool, MAX_ATTEMPTS, defaults.max_attempts).await?.max(1);
        let retry_base_delay = load_millis(pool, RETRY_BASE_DELAY_MS, defaults.retry_base_delay).await?;
        let retry_max_delay = load_millis(pool, RETRY_MAX_DELAY_MS, defaults.retry_max_delay).await?;
        let stale_after = load_millis(pool, STALE_AFTER_MS, defaults.stale_after).await?;
        let sweep_interval = load_millis(pool, SWEEP_INTERVAL_MS, defaults.sweep_interval).await?;
        let visibility_timeout =
            load_millis(pool, VISIBILITY_TIMEOUT_MS, defaults.visibility_timeout).await?;
        let queue_poll_interval =
            load_millis(pool, QUEUE_POLL_INTERVAL_MS, defaults.queue_poll_interval).await?;
        let max_upload_bytes = load_parsed(pool, MAX_UPLOAD_BYTES, defaults.max_upload_bytes).await?;
        let default_voice_gender =
            load_parsed(pool, DEFAULT_VOICE_GENDER, defaults.default_voice_gender).await?;
        let db_max_lock_wait_ms =
            load_parsed(pool, DB_MAX_LOCK_WAIT_MS, defaults.db_max_lock_wait_ms).await?;

        let worker_count = match ensure_setting(pool, WORKER_COUNT, WORKER_COUNT_AUTO).await?.trim() {
            WORKER_COUNT_AUTO => auto_worker_count(),
            raw => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!("Invalid {} '{}', using auto", WORKER_COUNT, raw);
                    auto_worker_count()
                }
            },
        };

        let settings = Self {
            max_attempts,
            retry_base_delay,
            retry_max_delay,
            stale_after,
            sweep_interval,
            visibility_timeout,
            worker_count,
            queue_poll_interval,
            max_upload_bytes,
            default_voice_gender,
            db_max_lock_wait_ms,
        };

        info!(
            max_attempts = settings.max_attempts,
            worker_count = settings.worker_count,
            stale_after_ms = settings.stale_after.as_millis() as u64,
            sweep_interval_ms = settings.sweep_interval.as_millis() as u64,
            "Runtime settings loaded"
        );

        Ok(settings)
    }

    /// Delay before retrying after the attempt with zero-based index `failed_attempt`
    ///
    /// `retry_base_delay × 2^failed_attempt`, capped at `retry_max_delay`.
    pub fn backoff_delay(&self, failed_attempt: i64) -> Duration {
        let exponent = failed_attempt.clamp(0, 31) as u32;
        let factor = 1u32 << exponent;
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

async fn load_parsed<T>(pool: &SqlitePool, key: &str, default: T) -> Result<T>
where
    T: FromStr + ToString,
    T::Err: std::fmt::Display,
{
    let raw = ensure_setting(pool, key, &default.to_string()).await?;
    match raw.trim().parse::<T>() {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("Invalid value '{}' for setting '{}' ({}), using default", raw, key, e);
            Ok(default)
        }
    }
}

async fn load_millis(pool: &SqlitePool, key: &str, default: Duration) -> Result<Duration> {
    let millis = load_parsed(pool, key, default.as_millis() as u64).await?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(base_ms: u64, max_ms: u64) -> ServiceSettings {
        ServiceSettings {
            retry_base_delay: Duration::from_millis(base_ms),
            retry_max_delay: Duration::from_millis(max_ms),
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let settings = settings_with(60_000, 900_000);
        assert_eq!(settings.backoff_delay(0), Duration::from_secs(60));
        assert_eq!(settings.backoff_delay(1), Duration::from_secs(120));
        assert_eq!(settings.backoff_delay(2), Duration::from_secs(240));
        assert_eq!(settings.backoff_delay(4), Duration::from_secs(900));
        assert_eq!(settings.backoff_delay(40), Duration::from_secs(900));
    }

    #[test]
    fn test_backoff_zero_base_is_immediate() {
        let settings = settings_with(0, 900_000);
        assert_eq!(settings.backoff_delay(5), Duration::ZERO);
    }

    #[test]
    fn test_defaults() {
        let settings = ServiceSettings::default();
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.stale_after, Duration::from_secs(2 * 60 * 60));
        assert_eq!(settings.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(settings.default_voice_gender, VoiceGender::Female);
        assert!(settings.worker_count >= 2);
    }
}
