//! Durable storage for the history log
//!
//! The orchestrator keeps its history in memory; a [`HistoryStore`] attached
//! with [`DownloadOrchestrator::with_history_store`](crate::DownloadOrchestrator::with_history_store)
//! receives the full log after every terminal transition and can seed a fresh
//! orchestrator through
//! [`restore_history`](crate::DownloadOrchestrator::restore_history).

use crate::error::{Error, Result};
use crate::types::DownloadTask;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Persistence backend for terminal tasks
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load the stored history, oldest first
    async fn load(&self) -> Result<Vec<DownloadTask>>;

    /// Replace the stored history with `history` (oldest first)
    async fn save(&self, history: &[DownloadTask]) -> Result<()>;
}

/// History stored as a pretty-printed JSON array in a single file
#[derive(Clone, Debug)]
pub struct JsonHistoryStore {
    path: PathBuf,
}

impl JsonHistoryStore {
    /// Store backed by the file at `path` (created on first save)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn load(&self) -> Result<Vec<DownloadTask>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to read history '{}': {}", self.path.display(), e),
                )));
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, history: &[DownloadTask]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(history)?;

        // Write then rename so a crash never leaves a truncated file behind
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(
            path = %self.path.display(),
            entries = history.len(),
            "History saved"
        );
        Ok(())
    }
}

/// In-memory store, useful for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    entries: tokio::sync::Mutex<Vec<DownloadTask>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryHistoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `entries`
    pub fn with_entries(entries: Vec<DownloadTask>) -> Self {
        Self {
            entries: tokio::sync::Mutex::new(entries),
            saves: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Number of completed saves
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self) -> Result<Vec<DownloadTask>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn save(&self, history: &[DownloadTask]) -> Result<()> {
        *self.entries.lock().await = history.to_vec();
        self.saves.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
