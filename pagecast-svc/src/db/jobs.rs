//! Durable job table operations
//!
//! Timestamps are Unix milliseconds supplied by the caller's clock, never
//! SQLite's own `now`, so that scheduling can be driven deterministically.

use pagecast_common::Result;
use sqlx::{FromRow, SqliteConnection, SqlitePool};

/// Job row as stored
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub idempotency_key: String,
    pub status: String,
    pub deliveries: i64,
    pub available_at: i64,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<i64>,
}

/// Insert a job, or re-arm a settled one with the same key
///
/// A job that is still queued, or leased under an unexpired lease, is left
/// untouched. Returns true if a job was inserted or re-armed.
pub async fn upsert_job(
    conn: &mut SqliteConnection,
    kind: &str,
    payload: &str,
    idempotency_key: &str,
    available_at: i64,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (kind, payload, idempotency_key, status, deliveries, available_at, created_at, updated_at)
        VALUES (?, ?, ?, 'queued', 0, ?, ?, ?)
        ON CONFLICT(idempotency_key) DO UPDATE SET
            kind = excluded.kind,
            payload = excluded.payload,
            status = 'queued',
            available_at = excluded.available_at,
            lease_token = NULL,
            lease_expires_at = NULL,
            updated_at = excluded.updated_at
        WHERE jobs.status = 'done'
           OR (jobs.status = 'leased' AND jobs.lease_expires_at <= excluded.updated_at)
        "#,
    )
    .bind(kind)
    .bind(payload)
    .bind(idempotency_key)
    .bind(available_at)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Lease the oldest deliverable job
///
/// Deliverable means queued and due, or leased with an expired lease. The
/// single UPDATE makes the pick-and-lease atomic across connections.
pub async fn lease_next(
    pool: &SqlitePool,
    now: i64,
    lease_expires_at: i64,
    lease_token: &str,
) -> Result<Option<JobRow>> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE jobs SET
            status = 'leased',
            lease_token = ?,
            lease_expires_at = ?,
            deliveries = deliveries + 1,
            updated_at = ?
        WHERE id = (
            SELECT id FROM jobs
            WHERE (status = 'queued' AND available_at <= ?)
               OR (status = 'leased' AND lease_expires_at <= ?)
            ORDER BY available_at, id
            LIMIT 1
        )
        RETURNING id, kind, payload, idempotency_key, status, deliveries, available_at,
                  lease_token, lease_expires_at
        "#,
    )
    .bind(lease_token)
    .bind(lease_expires_at)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Mark a leased job done if the lease is still ours
pub async fn mark_done(pool: &SqlitePool, id: i64, lease_token: &str, now: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs SET status = 'done', lease_token = NULL, lease_expires_at = NULL, updated_at = ?
        WHERE id = ? AND status = 'leased' AND lease_token = ?
        "#,
    )
    .bind(now)
    .bind(id)
    .bind(lease_token)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Return a leased job to the queue, due at `available_at`, if the lease is still ours
pub async fn release(
    pool: &SqlitePool,
    id: i64,
    lease_token: &str,
    available_at: i64,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs SET status = 'queued', available_at = ?, lease_token = NULL,
                        lease_expires_at = NULL, updated_at = ?
        WHERE id = ? AND status = 'leased' AND lease_token = ?
        "#,
    )
    .bind(available_at)
    .bind(now)
    .bind(id)
    .bind(lease_token)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Number of jobs not yet settled (queued or leased)
pub async fn count_unsettled(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status != 'done'")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Look a job up by idempotency key
pub async fn find_by_key(pool: &SqlitePool, idempotency_key: &str) -> Result<Option<JobRow>> {
    let row = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT id, kind, payload, idempotency_key, status, deliveries, available_at,
               lease_token, lease_expires_at
        FROM jobs WHERE idempotency_key = ?
        "#,
    )
    .bind(idempotency_key)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}
