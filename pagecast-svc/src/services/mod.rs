//! Service components for the narration pipeline
//!
//! Collaborators (extraction, narration, audio storage) sit behind traits so
//! tests can substitute fakes; the coordinator, worker, aggregator, status
//! lookup and recovery sweep are built on top of them.

pub mod audio_store;
pub mod extractor;
pub mod narration_worker;
pub mod narrator;
pub mod progress_aggregator;
pub mod recovery_sweep;
pub mod status;
pub mod upload_coordinator;

pub use audio_store::{AudioStore, FsAudioStore, StorageError};
pub use extractor::{DocumentExtractor, ExtractionError, PageExtractor, PagedTextExtractor, PdfExtractor};
pub use narration_worker::{AttemptError, NarrationResult, NarrationWorker};
pub use narrator::{HttpNarrator, Narration, NarrationError, Narrator};
pub use progress_aggregator::{aggregate, BookAggregate, PageCounts, ProgressAggregator};
pub use recovery_sweep::{RecoverySweep, SweepReport};
pub use status::{BookStatusReport, StatusService, TimeRemaining};
pub use upload_coordinator::{UploadCoordinator, UploadError, UploadReceipt, UploadRequest};
