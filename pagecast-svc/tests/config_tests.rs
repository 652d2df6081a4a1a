//! Runtime settings loaded from the `settings` table

use pagecast_svc::config::{self, auto_worker_count, ServiceSettings};
use pagecast_svc::models::VoiceGender;
use sqlx::SqlitePool;
use std::time::Duration;
use tempfile::TempDir;

async fn pool(dir: &TempDir) -> SqlitePool {
    pagecast_svc::db::init_database_pool(&dir.path().join("pagecast.db"))
        .await
        .unwrap()
}

async fn stored(pool: &SqlitePool, key: &str) -> Option<String> {
    sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .unwrap()
}

async fn store(pool: &SqlitePool, key: &str, value: &str) {
    sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_empty_table_loads_defaults_and_writes_them_back() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir).await;

    let settings = ServiceSettings::load(&pool).await.unwrap();

    assert_eq!(settings, ServiceSettings::default());
    assert_eq!(stored(&pool, config::MAX_ATTEMPTS).await.as_deref(), Some("3"));
    assert_eq!(stored(&pool, config::STALE_AFTER_MS).await.as_deref(), Some("7200000"));
    assert_eq!(stored(&pool, config::WORKER_COUNT).await.as_deref(), Some("auto"));
    assert_eq!(
        stored(&pool, config::DEFAULT_VOICE_GENDER).await.as_deref(),
        Some("female")
    );
}

#[tokio::test]
async fn test_stored_values_override_defaults() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir).await;
    store(&pool, config::MAX_ATTEMPTS, "5").await;
    store(&pool, config::RETRY_BASE_DELAY_MS, "250").await;
    store(&pool, config::WORKER_COUNT, "3").await;
    store(&pool, config::DEFAULT_VOICE_GENDER, "Male").await;

    let settings = ServiceSettings::load(&pool).await.unwrap();

    assert_eq!(settings.max_attempts, 5);
    assert_eq!(settings.retry_base_delay, Duration::from_millis(250));
    assert_eq!(settings.worker_count, 3);
    assert_eq!(settings.default_voice_gender, VoiceGender::Male);
}

#[tokio::test]
async fn test_invalid_values_fall_back() {
    let dir = TempDir::new().unwrap();
    let pool = pool(&dir).await;
    store(&pool, config::SWEEP_INTERVAL_MS, "soon").await;
    store(&pool, config::WORKER_COUNT, "0").await;
    store(&pool, config::MAX_ATTEMPTS, "0").await;

    let settings = ServiceSettings::load(&pool).await.unwrap();

    assert_eq!(settings.sweep_interval, Duration::from_secs(60));
    assert_eq!(settings.worker_count, auto_worker_count());
    // At least one attempt is always made
    assert_eq!(settings.max_attempts, 1);
    // The bad value is left for an operator to fix
    assert_eq!(
        stored(&pool, config::SWEEP_INTERVAL_MS).await.as_deref(),
        Some("soon")
    );
}
