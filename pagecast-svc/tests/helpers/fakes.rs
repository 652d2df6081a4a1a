//! Fake collaborators

use async_trait::async_trait;
use pagecast_svc::models::VoiceConfig;
use pagecast_svc::services::{
    AudioStore, FsAudioStore, Narration, NarrationError, Narrator, StorageError,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Narrator that returns the text as "audio" and fails on chosen pages
pub struct FakeNarrator {
    calls: AtomicUsize,
    calls_by_text: Mutex<HashMap<String, usize>>,
    failing: HashSet<String>,
    rejecting: HashSet<String>,
    voices: Mutex<Vec<VoiceConfig>>,
}

impl FakeNarrator {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            calls_by_text: Mutex::new(HashMap::new()),
            failing: HashSet::new(),
            rejecting: HashSet::new(),
            voices: Mutex::new(Vec::new()),
        }
    }

    /// Every attempt on a page with this text fails with a 503
    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing.insert(text.to_string());
        self
    }

    /// Every attempt on a page with this text is rejected with a 400
    pub fn rejecting(mut self, text: &str) -> Self {
        self.rejecting.insert(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, text: &str) -> usize {
        self.calls_by_text
            .lock()
            .unwrap()
            .get(text)
            .copied()
            .unwrap_or(0)
    }

    pub fn voices(&self) -> Vec<VoiceConfig> {
        self.voices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Narrator for FakeNarrator {
    async fn narrate(&self, text: &str, voice: &VoiceConfig) -> Result<Narration, NarrationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_text
            .lock()
            .unwrap()
            .entry(text.to_string())
            .or_insert(0) += 1;
        self.voices.lock().unwrap().push(voice.clone());

        // Yield so concurrent workers interleave
        tokio::task::yield_now().await;

        if self.failing.contains(text) {
            return Err(NarrationError::Service {
                status: 503,
                message: "narration backend unavailable".to_string(),
            });
        }
        if self.rejecting.contains(text) {
            return Err(NarrationError::Rejected {
                status: 400,
                message: "unsupported characters".to_string(),
            });
        }

        Ok(Narration {
            audio: format!("audio:{}", text).into_bytes(),
            duration: text.split_whitespace().count() as f64 * 0.5,
        })
    }
}

/// Filesystem store that counts writes
pub struct CountingStore {
    inner: FsAudioStore,
    puts: AtomicUsize,
}

impl CountingStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            inner: FsAudioStore::new(root),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn resolve(&self, audio_ref: &str) -> PathBuf {
        self.inner.resolve(audio_ref)
    }
}

#[async_trait]
impl AudioStore for CountingStore {
    async fn put(&self, audio: &[u8]) -> Result<String, StorageError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(audio).await
    }
}
