//! Durable audio storage
//!
//! [`FsAudioStore`] is content addressed: the reference is derived from the
//! SHA-256 of the bytes, so storing the same audio twice yields the same
//! reference and a single file.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes → durable reference
#[async_trait]
pub trait AudioStore: Send + Sync {
    async fn put(&self, audio: &[u8]) -> Result<String, StorageError>;
}

/// Filesystem store under a root directory
#[derive(Debug, Clone)]
pub struct FsAudioStore {
    root: PathBuf,
}

impl FsAudioStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute path for a reference returned by `put`
    pub fn resolve(&self, audio_ref: &str) -> PathBuf {
        self.root.join(audio_ref)
    }
}

/// Reference for `audio`: `<first two hex digits>/<sha256>.mp3`
pub fn content_ref(audio: &[u8]) -> String {
    let hash = format!("{:x}", Sha256::digest(audio));
    format!("{}/{}.mp3", &hash[..2], hash)
}

#[async_trait]
impl AudioStore for FsAudioStore {
    async fn put(&self, audio: &[u8]) -> Result<String, StorageError> {
        let audio_ref = content_ref(audio);
        let path = self.resolve(&audio_ref);

        if tokio::fs::try_exists(&path).await? {
            tracing::debug!(audio_ref = %audio_ref, "Audio already stored");
            return Ok(audio_ref);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so a reader never sees a partial file
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, audio).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!(audio_ref = %audio_ref, bytes = audio.len(), "Audio stored");
        Ok(audio_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_is_content_addressed() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsAudioStore::new(temp_dir.path());

        let first = store.put(b"audio bytes").await.unwrap();
        let second = store.put(b"audio bytes").await.unwrap();
        let other = store.put(b"different").await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(tokio::fs::read(store.resolve(&first)).await.unwrap(), b"audio bytes");
    }

    #[test]
    fn test_content_ref_layout() {
        let audio_ref = content_ref(b"test content");
        let hash = format!("{:x}", Sha256::digest(b"test content"));
        assert_eq!(audio_ref, format!("{}/{}.mp3", &hash[..2], hash));
    }
}
