//! Data models for pagecast-svc

pub mod book;
pub mod job;
pub mod voice;

pub use book::{Book, NewBook, Page, DEFAULT_LANGUAGE, NO_TEXT_CONTENT};
pub use job::{idempotency_key, NarrationJob, NARRATION_JOB_KIND};
pub use voice::{VoiceConfig, VoiceGender};
