//! File-based store: persistent JSON snapshots.
//!
//! Layout under the root directory:
//!
//! ```text
//! contexts/<id>.json      one ContextSnapshot
//! memories/<id>.jsonl     working memory, one Memory per line
//! ```
//!
//! Ids are sanitized into file names (`chat:room-1` → `chat_room-1`).
//! Storage location defaults to `~/.ravel/store`.

use async_trait::async_trait;
use ravel_core::context::ContextSnapshot;
use ravel_core::error::StoreError;
use ravel_core::memory::Memory;
use ravel_core::store::SnapshotStore;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A directory-backed snapshot store.
///
/// Writes are serialized through a lock so concurrent saves of the same id
/// never interleave.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        debug!(path = %root.display(), "File snapshot store opened");
        Self {
            root,
            write_lock: Mutex::new(()),
        }
    }

    /// Default path: `~/.ravel/store`
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".ravel").join("store")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn context_path(&self, id: &str) -> PathBuf {
        self.root.join("contexts").join(format!("{}.json", sanitize(id)))
    }

    fn memory_path(&self, id: &str) -> PathBuf {
        self.root.join("memories").join(format!("{}.jsonl", sanitize(id)))
    }

    fn write_file(path: &Path, content: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Storage(format!("Failed to create store directory: {e}"))
            })?;
        }
        std::fs::write(path, content)
            .map_err(|e| StoreError::Storage(format!("Failed to write {}: {e}", path.display())))
    }

    fn remove_file(path: &Path) -> Result<bool, StoreError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Storage(format!(
                "Failed to remove {}: {e}",
                path.display()
            ))),
        }
    }
}

/// Keep ids readable while making them safe as file names.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl SnapshotStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn save_context(&self, snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        Self::write_file(&self.context_path(&snapshot.id), &content)
    }

    async fn load_context(&self, id: &str) -> Result<Option<ContextSnapshot>, StoreError> {
        let content = match std::fs::read_to_string(self.context_path(id)) {
            Ok(c) => c,
            Err(_) => return Ok(None), // Nothing saved yet
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("Corrupted context snapshot '{id}': {e}")))
    }

    async fn save_working_memory(&self, id: &str, memories: &[Memory]) -> Result<(), StoreError> {
        let mut content = String::new();
        for memory in memories {
            let line = serde_json::to_string(memory)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            content.push_str(&line);
            content.push('\n');
        }
        let _guard = self.write_lock.lock().await;
        Self::write_file(&self.memory_path(id), &content)
    }

    async fn load_working_memory(&self, id: &str) -> Result<Vec<Memory>, StoreError> {
        let content = match std::fs::read_to_string(self.memory_path(id)) {
            Ok(c) => c,
            Err(_) => return Ok(Vec::new()),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Memory>(line) {
                Ok(memory) => Some(memory),
                Err(e) => {
                    warn!(error = %e, id, "Skipping corrupted memory line");
                    None
                }
            })
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let context = Self::remove_file(&self.context_path(id))?;
        let memory = Self::remove_file(&self.memory_path(id))?;
        Ok(context || memory)
    }
}
