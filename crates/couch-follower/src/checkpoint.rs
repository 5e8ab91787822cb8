//! Follower position persistence
//!
//! Lets the owner of a follower store `last_seq()` and resume from it later.

use async_trait::async_trait;
use couch_core::error::{CouchError, Result};
use couch_core::message::Seq;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Checkpoint storage trait
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the last saved position; `None` starts from the beginning
    async fn load(&self) -> Result<Option<Seq>>;

    async fn save(&self, seq: &Seq) -> Result<()>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// File-based Checkpoint
// ============================================================================

/// Position stored as the raw token in a file, replaced atomically
pub struct FileCheckpoint {
    path: PathBuf,
    cached: StdMutex<Option<Seq>>,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: StdMutex::new(None),
        }
    }

    fn cached(&self) -> Option<Seq> {
        self.cached.lock().ok().and_then(|c| c.clone())
    }

    fn set_cached(&self, seq: Option<Seq>) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = seq;
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpoint {
    async fn load(&self) -> Result<Option<Seq>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => {
                let token = content.trim();
                if token.is_empty() {
                    return Ok(None);
                }
                let seq = Seq::from(token);
                self.set_cached(Some(seq.clone()));
                info!(checkpoint = %seq, path = ?self.path, "Loaded checkpoint");
                Ok(Some(seq))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No checkpoint file, starting from the beginning");
                Ok(None)
            }
            Err(e) => Err(CouchError::checkpoint_with_source(
                "Failed to read checkpoint",
                e,
            )),
        }
    }

    async fn save(&self, seq: &Seq) -> Result<()> {
        if self.cached().as_ref() == Some(seq) {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CouchError::checkpoint_with_source("Failed to create checkpoint directory", e)
            })?;
        }

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, seq.as_str())
            .await
            .map_err(|e| CouchError::checkpoint_with_source("Failed to write checkpoint", e))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| CouchError::checkpoint_with_source("Failed to rename checkpoint", e))?;

        self.set_cached(Some(seq.clone()));
        debug!(checkpoint = %seq, "Saved checkpoint");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file_checkpoint"
    }
}

// ============================================================================
// Memory Checkpoint (for testing)
// ============================================================================

#[derive(Default)]
pub struct MemoryCheckpoint {
    seq: RwLock<Option<Seq>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(seq: impl Into<Seq>) -> Self {
        Self {
            seq: RwLock::new(Some(seq.into())),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self) -> Result<Option<Seq>> {
        Ok(self.seq.read().await.clone())
    }

    async fn save(&self, seq: &Seq) -> Result<()> {
        *self.seq.write().await = Some(seq.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory_checkpoint"
    }
}
