//! Integration tests for page narration
//!
//! Covers idempotent replay, the retry bound, concurrent completion of one
//! book by several workers, and the failure path.

mod helpers;

use helpers::{setup, setup_with, test_settings, FakeNarrator};
use pagecast_common::events::{BookStatus, PageStatus};
use pagecast_common::Clock;
use pagecast_svc::db::{books, jobs};
use pagecast_svc::models::{NarrationJob, NARRATION_JOB_KIND, NO_TEXT_CONTENT};
use pagecast_svc::queue::{run_next, Job, JobHandler, JobQueue, WorkerPool, WorkerPoolConfig};
use pagecast_svc::services::{NarrationResult, TimeRemaining, UploadRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_pages_narrate_and_book_completes() {
    let svc = setup().await;
    let book_id = svc.upload_book(&["one two", "three four five", "six"]).await;

    assert_eq!(svc.drain().await, 3);

    for n in 1..=3 {
        let page = svc.page(book_id, n).await;
        assert_eq!(page.processing_status, PageStatus::Completed);
        assert_eq!(page.attempt_count, 0);
        let audio_ref = page.audio_ref.expect("audio stored");
        assert!(svc.store.resolve(&audio_ref).exists());
    }

    let book = books::get_book(&svc.state.db, book_id).await.unwrap().unwrap();
    assert_eq!(book.processing_status, BookStatus::Completed);
    assert_eq!(book.processing_progress, 100);
    assert_eq!(book.total_duration, Some(3.0));
    assert_eq!(svc.state.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stored_progress_tracks_each_completion() {
    let svc = setup().await;
    let book_id = svc.upload_book(&["a", "b", "c"]).await;

    for completed in 1..=3i64 {
        let handler: Arc<dyn JobHandler> = svc.worker.clone();
        let outcome = run_next(svc.state.queue.as_ref(), handler, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(outcome.is_some());

        // The page write and the book write commit together
        let book = books::get_book(&svc.state.db, book_id).await.unwrap().unwrap();
        assert_eq!(book.processing_progress as i64, 100 * completed / 3);
    }

    let book = books::get_book(&svc.state.db, book_id).await.unwrap().unwrap();
    assert_eq!(book.processing_status, BookStatus::Completed);
}

#[tokio::test]
async fn test_voice_uses_book_language_and_default_gender() {
    let svc = setup().await;
    let (_, result) = svc
        .upload_request(UploadRequest {
            title: "Le Petit Prince".to_string(),
            language: Some("French".to_string()),
            document: helpers::document(&["Bonjour"]),
        })
        .await;
    result.unwrap();

    svc.drain().await;

    let voices = svc.narrator.voices();
    assert_eq!(voices.len(), 1);
    assert_eq!(voices[0].language, "french");
    assert_eq!(voices[0].gender.as_str(), "female");
}

#[tokio::test]
async fn test_blank_page_completes_without_narration() {
    let svc = setup().await;
    let book_id = svc.upload_book(&["first", "   ", "third"]).await;

    svc.drain().await;

    let blank = svc.page(book_id, 2).await;
    assert_eq!(blank.processing_status, PageStatus::Completed);
    assert_eq!(blank.audio_ref, None);
    assert_eq!(blank.audio_duration, Some(0.0));
    assert_eq!(blank.processing_error.as_deref(), Some(NO_TEXT_CONTENT));
    assert_eq!(svc.narrator.calls(), 2);

    let report = svc.state.status.book_status(book_id).await.unwrap().unwrap();
    assert!(report.audio_ready);
    assert_eq!(report.pages_with_audio, 2);
    assert_eq!(report.processing_status, BookStatus::Completed);
}

#[tokio::test]
async fn test_replay_of_completed_page_is_a_no_op() {
    let svc = setup().await;
    let book_id = svc.upload_book(&["only page"]).await;
    svc.drain().await;

    let before = svc.page(book_id, 1).await;
    assert_eq!(before.processing_status, PageStatus::Completed);
    let puts_before = svc.store.puts();

    // Redeliver the same job
    let job = NarrationJob::new(before.id, book_id, 1);
    let rearmed = svc
        .state
        .queue
        .enqueue(
            &Job::new(NARRATION_JOB_KIND, &job).unwrap(),
            &job.idempotency_key(),
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert!(rearmed, "settled job should be re-armed");
    assert_eq!(svc.drain().await, 1);

    // And call the handler directly
    assert_eq!(
        svc.worker.process(&job).await.unwrap(),
        NarrationResult::AlreadySettled
    );

    assert_eq!(svc.store.puts(), puts_before);
    assert_eq!(svc.narrator.calls(), 1);
    assert_eq!(svc.page(book_id, 1).await, before);
}

#[tokio::test]
async fn test_processing_page_is_not_claimed_twice() {
    let svc = setup().await;
    let book_id = svc.upload_book(&["contested"]).await;
    let page = svc.page(book_id, 1).await;

    // Another delivery owns the page
    assert!(pagecast_svc::db::pages::claim(&svc.state.db, page.id, svc.clock.now())
        .await
        .unwrap());

    let job = NarrationJob::new(page.id, book_id, 1);
    assert_eq!(svc.worker.process(&job).await.unwrap(), NarrationResult::NotClaimed);
    assert_eq!(svc.narrator.calls(), 0);
}

#[tokio::test]
async fn test_always_failing_page_is_tried_exactly_max_attempts_times() {
    let svc = setup_with(test_settings(), FakeNarrator::new().failing_on("broken")).await;
    let book_id = svc.upload_book(&["broken"]).await;

    svc.drain().await;

    assert_eq!(svc.narrator.calls_for("broken"), 3);
    let page = svc.page(book_id, 1).await;
    assert_eq!(page.processing_status, PageStatus::Failed);
    assert_eq!(page.attempt_count, 3);
    assert!(page.processing_error.unwrap().contains("503"));

    // Further deliveries change nothing
    let job = NarrationJob::new(page.id, book_id, 1);
    assert_eq!(
        svc.worker.process(&job).await.unwrap(),
        NarrationResult::AlreadySettled
    );
    assert_eq!(svc.page(book_id, 1).await.attempt_count, 3);

    let settled = jobs::find_by_key(&svc.state.db, &job.idempotency_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.status, "done");
    assert_eq!(settled.deliveries, 3);
}

#[tokio::test]
async fn test_rejected_narration_is_retried_up_to_max_attempts() {
    let svc = setup_with(test_settings(), FakeNarrator::new().rejecting("bad input")).await;
    let book_id = svc.upload_book(&["bad input"]).await;

    svc.drain().await;

    // A 4xx from the narration endpoint gets the same retry budget as any other error
    assert_eq!(svc.narrator.calls(), 3);
    let page = svc.page(book_id, 1).await;
    assert_eq!(page.processing_status, PageStatus::Failed);
    assert_eq!(page.attempt_count, 3);
    assert!(page.processing_error.unwrap().contains("400"));
}

#[tokio::test]
async fn test_failure_path_leaves_book_failed_not_completed() {
    let svc = setup_with(test_settings(), FakeNarrator::new().failing_on("page two")).await;
    let book_id = svc.upload_book(&["page one", "page two", "page three"]).await;

    let mut rx = svc.state.event_bus.subscribe();
    svc.drain().await;

    let report = svc.state.status.book_status(book_id).await.unwrap().unwrap();
    assert_eq!(report.pages_status.failed, 1);
    assert_eq!(report.pages_status.completed, 2);
    assert!(!report.audio_ready);
    assert_eq!(report.processing_status, BookStatus::Failed);
    assert_eq!(report.processing_progress, 66);
    assert_eq!(report.estimated_time_remaining, TimeRemaining::Seconds(0));
    assert_eq!(svc.narrator.calls_for("page two"), 3);

    let book = books::get_book(&svc.state.db, book_id).await.unwrap().unwrap();
    assert_eq!(book.processing_status, BookStatus::Failed);
    assert_eq!(
        book.processing_error.as_deref(),
        Some("1 of 3 pages failed narration")
    );

    // The book never reported completed along the way
    while let Ok(event) = rx.try_recv() {
        if let pagecast_common::events::PagecastEvent::BookProgressChanged { status, .. } = event {
            assert_ne!(status, BookStatus::Completed);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_converge_on_completed_book() {
    let svc = setup().await;
    let pages: Vec<String> = (1..=12).map(|n| format!("page number {}", n)).collect();
    let page_refs: Vec<&str> = pages.iter().map(String::as_str).collect();
    let book_id = svc.upload_book(&page_refs).await;

    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(
        WorkerPoolConfig {
            worker_count: 6,
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
        },
        Arc::clone(&svc.state.queue),
        svc.worker.clone(),
        Arc::clone(&svc.state.last_error),
        cancel.clone(),
    );
    assert_eq!(pool.worker_count(), 6);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let report = svc.state.status.book_status(book_id).await.unwrap().unwrap();
        if report.audio_ready {
            assert_eq!(report.pages_with_audio, 12);
            assert_eq!(report.processing_progress, 100);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "workers did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.shutdown().await;

    let book = books::get_book(&svc.state.db, book_id).await.unwrap().unwrap();
    assert_eq!(book.processing_status, BookStatus::Completed);
    assert_eq!(book.processing_progress, 100);
    assert_eq!(svc.narrator.calls(), 12);
    assert_eq!(svc.state.queue.depth().await.unwrap(), 0);
}
