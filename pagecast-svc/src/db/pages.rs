//! Page persistence
//!
//! Every status transition is a compare-and-swap keyed on the current
//! status, so a page has at most one writer per transition. Each function
//! returns whether the swap took effect.

use crate::models::{NarrationJob, Page};
use pagecast_common::events::PageStatus;
use pagecast_common::time::{from_millis, to_millis};
use chrono::{DateTime, Utc};
use pagecast_common::{Error, Result};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

const PAGE_COLUMNS: &str = "id, book_id, page_number, text_content, audio_ref, audio_duration, \
     processing_status, attempt_count, processing_error, created_at, updated_at";

#[derive(Debug, FromRow)]
struct PageRow {
    id: i64,
    book_id: i64,
    page_number: i64,
    text_content: String,
    audio_ref: Option<String>,
    audio_duration: Option<f64>,
    processing_status: String,
    attempt_count: i64,
    processing_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<PageRow> for Page {
    type Error = Error;

    fn try_from(row: PageRow) -> Result<Self> {
        let processing_status = row
            .processing_status
            .parse::<PageStatus>()
            .map_err(|e| Error::Internal(format!("page {}: {}", row.id, e)))?;
        Ok(Page {
            id: row.id,
            book_id: row.book_id,
            page_number: row.page_number,
            text_content: row.text_content,
            audio_ref: row.audio_ref,
            audio_duration: row.audio_duration,
            processing_status,
            attempt_count: row.attempt_count,
            processing_error: row.processing_error,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

/// The fields the progress aggregator needs from each page
#[derive(Debug, Clone, PartialEq)]
pub struct PageSnapshot {
    pub status: PageStatus,
    pub audio_ref: Option<String>,
    pub audio_duration: Option<f64>,
}

/// Insert one page inside the caller's transaction, returning its id
pub async fn insert_page(
    conn: &mut SqliteConnection,
    book_id: i64,
    page_number: i64,
    text_content: &str,
    now: i64,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO pages (book_id, page_number, text_content, processing_status, attempt_count,
                           created_at, updated_at)
        VALUES (?, ?, ?, 'pending', 0, ?, ?)
        RETURNING id
        "#,
    )
    .bind(book_id)
    .bind(page_number)
    .bind(text_content)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

#[derive(Debug, FromRow)]
struct NarrationRow {
    #[sqlx(flatten)]
    page: PageRow,
    language: String,
}

/// A page plus its book's language, for narration
pub async fn get_page_for_narration(pool: &SqlitePool, page_id: i64) -> Result<Option<(Page, String)>> {
    let row = sqlx::query_as::<_, NarrationRow>(
        r#"
        SELECT p.id AS id, p.book_id AS book_id, p.page_number AS page_number,
               p.text_content AS text_content, p.audio_ref AS audio_ref,
               p.audio_duration AS audio_duration, p.processing_status AS processing_status,
               p.attempt_count AS attempt_count, p.processing_error AS processing_error,
               p.created_at AS created_at, p.updated_at AS updated_at, b.language AS language
        FROM pages p JOIN books b ON b.id = p.book_id
        WHERE p.id = ?
        "#,
    )
    .bind(page_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| Ok((Page::try_from(row.page)?, row.language)))
        .transpose()
}

/// All pages of a book in page order
pub async fn list_pages(pool: &SqlitePool, book_id: i64) -> Result<Vec<Page>> {
    let sql = format!(
        "SELECT {} FROM pages WHERE book_id = ? ORDER BY page_number",
        PAGE_COLUMNS
    );
    let rows = sqlx::query_as::<_, PageRow>(&sql)
        .bind(book_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(Page::try_from).collect()
}

/// Read the aggregation inputs for every page of a book
///
/// Run inside a transaction so all rows come from one snapshot.
pub async fn snapshot_for_book(
    conn: &mut SqliteConnection,
    book_id: i64,
) -> Result<Vec<PageSnapshot>> {
    let rows: Vec<(String, Option<String>, Option<f64>)> = sqlx::query_as(
        "SELECT processing_status, audio_ref, audio_duration FROM pages WHERE book_id = ? ORDER BY page_number",
    )
    .bind(book_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(status, audio_ref, audio_duration)| {
            let status = status
                .parse::<PageStatus>()
                .map_err(|e| Error::Internal(format!("book {}: {}", book_id, e)))?;
            Ok(PageSnapshot {
                status,
                audio_ref,
                audio_duration,
            })
        })
        .collect()
}

/// pending → processing
pub async fn claim(pool: &SqlitePool, page_id: i64, now: DateTime<Utc>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE pages SET processing_status = 'processing', updated_at = ?
        WHERE id = ? AND processing_status = 'pending'
        "#,
    )
    .bind(to_millis(now))
    .bind(page_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// processing → completed
///
/// `claimed_at` is the timestamp written by [`claim`]; if the page was
/// reclaimed and claimed again since, the swap does not apply. `audio_ref`
/// is None for pages that had nothing to narrate.
pub async fn complete(
    conn: &mut SqliteConnection,
    page_id: i64,
    claimed_at: DateTime<Utc>,
    audio_ref: Option<&str>,
    audio_duration: f64,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE pages SET processing_status = 'completed', audio_ref = ?, audio_duration = ?,
                         processing_error = ?, updated_at = ?
        WHERE id = ? AND processing_status = 'processing' AND updated_at = ?
        "#,
    )
    .bind(audio_ref)
    .bind(audio_duration)
    .bind(note)
    .bind(to_millis(now))
    .bind(page_id)
    .bind(to_millis(claimed_at))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// processing → pending (retry) or processing → failed (exhausted), recording the attempt
///
/// Fenced on `claimed_at` like [`complete`].
pub async fn record_failed_attempt(
    conn: &mut SqliteConnection,
    page_id: i64,
    claimed_at: DateTime<Utc>,
    next_status: PageStatus,
    attempt_count: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE pages SET processing_status = ?, attempt_count = ?, processing_error = ?, updated_at = ?
        WHERE id = ? AND processing_status = 'processing' AND updated_at = ?
        "#,
    )
    .bind(next_status.as_str())
    .bind(attempt_count)
    .bind(error)
    .bind(to_millis(now))
    .bind(page_id)
    .bind(to_millis(claimed_at))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Pages stuck in `processing` since before `cutoff`
pub async fn find_stale_processing(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Page>> {
    let sql = format!(
        "SELECT {} FROM pages WHERE processing_status = 'processing' AND updated_at <= ? ORDER BY updated_at, id",
        PAGE_COLUMNS
    );
    let rows = sqlx::query_as::<_, PageRow>(&sql)
        .bind(to_millis(cutoff))
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(Page::try_from).collect()
}

/// Move a stale processing page to `next_status`, counting the lost attempt
///
/// Only applies while the page is still processing and still older than
/// `cutoff`, so a worker that finished in the meantime wins.
pub async fn reclaim_stale(
    conn: &mut SqliteConnection,
    page_id: i64,
    next_status: PageStatus,
    attempt_count: i64,
    error: &str,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE pages SET processing_status = ?, attempt_count = ?, processing_error = ?, updated_at = ?
        WHERE id = ? AND processing_status = 'processing' AND updated_at <= ?
        "#,
    )
    .bind(next_status.as_str())
    .bind(attempt_count)
    .bind(error)
    .bind(to_millis(now))
    .bind(page_id)
    .bind(to_millis(cutoff))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// A fenced page transition out of `processing`
///
/// Carried into the book's write transaction so the page write and the
/// recomputed book state commit together.
#[derive(Debug, Clone, Copy)]
pub enum Transition<'a> {
    /// See [`complete`]
    Complete {
        claimed_at: DateTime<Utc>,
        audio_ref: Option<&'a str>,
        audio_duration: f64,
        note: Option<&'a str>,
    },
    /// See [`record_failed_attempt`]
    FailAttempt {
        claimed_at: DateTime<Utc>,
        next_status: PageStatus,
        attempt_count: i64,
        error: &'a str,
    },
    /// See [`reclaim_stale`]
    Reclaim {
        cutoff: DateTime<Utc>,
        next_status: PageStatus,
        attempt_count: i64,
        error: &'a str,
    },
}

/// Apply `transition` to a page, returning whether the swap took effect
pub async fn apply(
    conn: &mut SqliteConnection,
    page_id: i64,
    transition: Transition<'_>,
    now: DateTime<Utc>,
) -> Result<bool> {
    match transition {
        Transition::Complete {
            claimed_at,
            audio_ref,
            audio_duration,
            note,
        } => complete(conn, page_id, claimed_at, audio_ref, audio_duration, note, now).await,
        Transition::FailAttempt {
            claimed_at,
            next_status,
            attempt_count,
            error,
        } => {
            record_failed_attempt(conn, page_id, claimed_at, next_status, attempt_count, error, now)
                .await
        }
        Transition::Reclaim {
            cutoff,
            next_status,
            attempt_count,
            error,
        } => reclaim_stale(conn, page_id, next_status, attempt_count, error, cutoff, now).await,
    }
}

/// Pending pages with no queued or leased job behind them
///
/// A leased job counts as live even after its lease expires, since the
/// queue redelivers it.
pub async fn pending_without_job(pool: &SqlitePool) -> Result<Vec<NarrationJob>> {
    let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT p.id, p.book_id, p.page_number
        FROM pages p
        WHERE p.processing_status = 'pending'
          AND NOT EXISTS (
              SELECT 1 FROM jobs j
              WHERE j.idempotency_key = 'page:' || p.book_id || ':' || p.page_number
                AND j.status IN ('queued', 'leased')
          )
        ORDER BY p.book_id, p.page_number
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(page_id, book_id, page_number)| NarrationJob::new(page_id, book_id, page_number))
        .collect())
}
