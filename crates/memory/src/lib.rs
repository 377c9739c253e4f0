//! Snapshot store implementations for Ravel.

pub mod file_backend;
pub mod in_memory;
pub mod noop;

pub use file_backend::FileStore;
pub use in_memory::InMemoryStore;
pub use noop::NoopStore;

use ravel_core::error::StoreError;
use ravel_core::store::SnapshotStore;
use std::path::PathBuf;
use std::sync::Arc;

/// Build a store from a backend name (`memory`, `file`, `none`).
///
/// The file backend uses `path`, or [`FileStore::default_path`] when absent.
pub fn open_store(
    backend: &str,
    path: Option<PathBuf>,
) -> Result<Arc<dyn SnapshotStore>, StoreError> {
    match backend {
        "memory" | "in_memory" => Ok(Arc::new(InMemoryStore::new())),
        "none" | "noop" => Ok(Arc::new(NoopStore)),
        "file" => Ok(Arc::new(FileStore::new(
            path.unwrap_or_else(FileStore::default_path),
        ))),
        other => Err(StoreError::Storage(format!(
            "unknown store backend '{other}' (expected memory, file or none)"
        ))),
    }
}
