//! Book persistence

use crate::db::{jobs, pages};
use crate::models::{Book, NarrationJob, NewBook, NARRATION_JOB_KIND};
use chrono::{DateTime, Utc};
use pagecast_common::events::BookStatus;
use pagecast_common::time::{from_millis, to_millis};
use pagecast_common::{Error, Result};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

const BOOK_COLUMNS: &str = "id, title, language, total_pages, processing_status, processing_progress, \
     total_duration, processing_error, created_at, updated_at";

#[derive(Debug, FromRow)]
struct BookRow {
    id: i64,
    title: String,
    language: String,
    total_pages: i64,
    processing_status: String,
    processing_progress: i64,
    total_duration: Option<f64>,
    processing_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<BookRow> for Book {
    type Error = Error;

    fn try_from(row: BookRow) -> Result<Self> {
        let processing_status = row
            .processing_status
            .parse::<BookStatus>()
            .map_err(|e| Error::Internal(format!("book {}: {}", row.id, e)))?;
        Ok(Book {
            id: row.id,
            title: row.title,
            language: row.language,
            total_pages: row.total_pages,
            processing_status,
            processing_progress: row.processing_progress.clamp(0, 100) as u8,
            total_duration: row.total_duration,
            processing_error: row.processing_error,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

/// Derived book state written by the progress aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedState {
    pub status: BookStatus,
    pub progress: u8,
    pub total_duration: Option<f64>,
    pub processing_error: Option<String>,
}

/// Persist a book, all of its pages and one narration job per page
///
/// Runs as a single transaction: the book is inserted as `uploaded`, pages
/// get numbers 1..=N, jobs are written alongside (so no job can reference an
/// uncommitted page), and the book moves to `processing` before commit.
/// Nothing is visible to other connections until the whole set commits.
pub async fn create_with_pages(
    pool: &SqlitePool,
    new_book: &NewBook,
    now: DateTime<Utc>,
) -> Result<(i64, Vec<NarrationJob>)> {
    let now_ms = to_millis(now);
    let mut tx = pool.begin().await?;

    let book_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO books (title, language, total_pages, processing_status, processing_progress,
                           created_at, updated_at)
        VALUES (?, ?, ?, 'uploaded', 0, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&new_book.title)
    .bind(&new_book.language)
    .bind(new_book.pages.len() as i64)
    .bind(now_ms)
    .bind(now_ms)
    .fetch_one(&mut *tx)
    .await?;

    let mut jobs_created = Vec::with_capacity(new_book.pages.len());
    for (index, text) in new_book.pages.iter().enumerate() {
        let page_number = index as i64 + 1;
        let page_id = pages::insert_page(&mut *tx, book_id, page_number, text, now_ms).await?;

        let job = NarrationJob::new(page_id, book_id, page_number);
        let payload = serde_json::to_string(&job)
            .map_err(|e| Error::Internal(format!("Failed to serialize job: {}", e)))?;
        jobs::upsert_job(
            &mut *tx,
            NARRATION_JOB_KIND,
            &payload,
            &job.idempotency_key(),
            now_ms,
            now_ms,
        )
        .await?;
        jobs_created.push(job);
    }

    sqlx::query("UPDATE books SET processing_status = 'processing', updated_at = ? WHERE id = ?")
        .bind(now_ms)
        .bind(book_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok((book_id, jobs_created))
}

pub async fn get_book(pool: &SqlitePool, book_id: i64) -> Result<Option<Book>> {
    let sql = format!("SELECT {} FROM books WHERE id = ?", BOOK_COLUMNS);
    let row = sqlx::query_as::<_, BookRow>(&sql)
        .bind(book_id)
        .fetch_optional(pool)
        .await?;
    row.map(Book::try_from).transpose()
}

/// Load a book inside the caller's transaction
pub async fn get_book_in(conn: &mut SqliteConnection, book_id: i64) -> Result<Option<Book>> {
    let sql = format!("SELECT {} FROM books WHERE id = ?", BOOK_COLUMNS);
    let row = sqlx::query_as::<_, BookRow>(&sql)
        .bind(book_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Book::try_from).transpose()
}

/// Take the write lock for a book's row
///
/// A no-op write issued first in a transaction; later reads in the same
/// transaction then see a snapshot no other writer can invalidate.
pub async fn lock_for_update(conn: &mut SqliteConnection, book_id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE books SET updated_at = updated_at WHERE id = ?")
        .bind(book_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Write derived status, progress, duration and error onto the book row
pub async fn write_derived_state(
    conn: &mut SqliteConnection,
    book_id: i64,
    state: &DerivedState,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE books SET processing_status = ?, processing_progress = ?, total_duration = ?,
                         processing_error = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(state.status.as_str())
    .bind(state.progress as i64)
    .bind(state.total_duration)
    .bind(state.processing_error.as_deref())
    .bind(to_millis(now))
    .bind(book_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Books still marked `processing` whose stored state no longer matches their pages
///
/// Either every page has settled, or the stored progress differs from
/// floor(100 × completed / total).
pub async fn needing_recompute(pool: &SqlitePool) -> Result<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT b.id FROM books b
        WHERE b.processing_status = 'processing'
          AND (
              NOT EXISTS (
                  SELECT 1 FROM pages p
                  WHERE p.book_id = b.id AND p.processing_status IN ('pending', 'processing')
              )
              OR b.processing_progress != (
                  SELECT CASE WHEN COUNT(*) = 0 THEN 100
                              ELSE (100 * SUM(p.processing_status = 'completed')) / COUNT(*)
                         END
                  FROM pages p WHERE p.book_id = b.id
              )
          )
        ORDER BY b.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(ids)
}
