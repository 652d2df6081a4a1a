//! Test Helper Utilities
//!
//! Shared harness for pagecast-svc integration tests: a service wired to a
//! temporary database, a manual clock, and fake narration/storage
//! collaborators that count their calls.

#![allow(dead_code)]

pub mod fakes;

pub use fakes::{CountingStore, FakeNarrator};

use chrono::{TimeZone, Utc};
use pagecast_common::events::{EventBus, UploadEvent};
use pagecast_common::ManualClock;
use pagecast_svc::config::ServiceSettings;
use pagecast_svc::db::pages;
use pagecast_svc::models::Page;
use pagecast_svc::queue::run_next;
use pagecast_svc::services::{
    DocumentExtractor, NarrationWorker, UploadError, UploadReceipt, UploadRequest,
};
use pagecast_svc::AppState;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Settings with immediate retries so tests can drain the queue without waiting
pub fn test_settings() -> ServiceSettings {
    ServiceSettings {
        max_attempts: 3,
        retry_base_delay: Duration::ZERO,
        retry_max_delay: Duration::ZERO,
        worker_count: 4,
        visibility_timeout: Duration::from_secs(60),
        queue_poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

pub struct TestService {
    pub temp_dir: TempDir,
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub narrator: Arc<FakeNarrator>,
    pub store: Arc<CountingStore>,
    pub worker: Arc<NarrationWorker>,
}

/// Service with default test settings and a narrator that always succeeds
pub async fn setup() -> TestService {
    setup_with(test_settings(), FakeNarrator::new()).await
}

pub async fn setup_with(settings: ServiceSettings, narrator: FakeNarrator) -> TestService {
    let temp_dir = TempDir::new().unwrap();
    let db = pagecast_svc::db::init_database_pool(&temp_dir.path().join("pagecast.db"))
        .await
        .unwrap();

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    ));
    let state = AppState::new(
        db,
        EventBus::new(1000),
        clock.clone(),
        settings,
        Arc::new(DocumentExtractor::new()),
    );

    let narrator = Arc::new(narrator);
    let store = Arc::new(CountingStore::new(temp_dir.path().join("audio")));
    let worker = Arc::new(state.narration_worker(narrator.clone(), store.clone()));

    TestService {
        temp_dir,
        state,
        clock,
        narrator,
        store,
        worker,
    }
}

/// Form-feed separated document
pub fn document(pages: &[&str]) -> Vec<u8> {
    pages.join("\x0C").into_bytes()
}

/// Text PDF with one line of Courier per page
pub fn pdf_document(pages: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let kids: Vec<Object> = pages
        .iter()
        .map(|text| {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 14.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            })
            .into()
        })
        .collect();

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

impl TestService {
    /// Run an upload to completion, returning every event it streamed
    pub async fn upload(
        &self,
        title: &str,
        pages: &[&str],
    ) -> (Vec<UploadEvent>, Result<UploadReceipt, UploadError>) {
        self.upload_request(UploadRequest {
            title: title.to_string(),
            language: None,
            document: document(pages),
        })
        .await
    }

    pub async fn upload_request(
        &self,
        request: UploadRequest,
    ) -> (Vec<UploadEvent>, Result<UploadReceipt, UploadError>) {
        let (tx, mut rx) = mpsc::channel(256);
        let result = self.state.coordinator.run(request, &tx).await;
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, result)
    }

    /// Upload and return the new book id
    pub async fn upload_book(&self, pages: &[&str]) -> i64 {
        let (_, result) = self.upload("Test Book", pages).await;
        result.expect("upload should succeed").book_id
    }

    /// Process deliveries until the queue has nothing due; returns how many ran
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        for _ in 0..1000 {
            let handler: Arc<dyn pagecast_svc::queue::JobHandler> = self.worker.clone();
            let outcome = run_next(
                self.state.queue.as_ref(),
                handler,
                self.state.settings.visibility_timeout,
            )
            .await
            .unwrap();
            match outcome {
                Some(_) => processed += 1,
                None => return processed,
            }
        }
        panic!("queue did not drain");
    }

    pub async fn page(&self, book_id: i64, page_number: i64) -> Page {
        pages::list_pages(&self.state.db, book_id)
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.page_number == page_number)
            .expect("page exists")
    }

    /// Insert bare book rows so the next upload gets a predictable id
    pub async fn seed_books(&self, count: usize) {
        for n in 0..count {
            sqlx::query(
                "INSERT INTO books (title, total_pages, created_at, updated_at) VALUES (?, 0, 0, 0)",
            )
            .bind(format!("seed {}", n))
            .execute(&self.state.db)
            .await
            .unwrap();
        }
    }
}
