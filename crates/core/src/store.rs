//! SnapshotStore trait: persistence of context state and working memory.
//!
//! The engine saves a snapshot of every active context and the run's chain
//! after each step, and restores them when a new engine is created for the
//! same context id. Implementations live in `ravel-memory`.

use crate::context::ContextSnapshot;
use crate::error::StoreError;
use crate::memory::Memory;
use async_trait::async_trait;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// A human-readable name for this store (e.g., "in_memory", "file").
    fn name(&self) -> &str;

    async fn save_context(&self, snapshot: &ContextSnapshot) -> std::result::Result<(), StoreError>;

    async fn load_context(&self, id: &str) -> std::result::Result<Option<ContextSnapshot>, StoreError>;

    /// Replace the working memory stored for a context id.
    async fn save_working_memory(
        &self,
        id: &str,
        memories: &[Memory],
    ) -> std::result::Result<(), StoreError>;

    /// Working memory for a context id; empty when nothing was saved.
    async fn load_working_memory(&self, id: &str) -> std::result::Result<Vec<Memory>, StoreError>;

    /// Remove both snapshots. Returns whether anything was removed.
    async fn delete(&self, id: &str) -> std::result::Result<bool, StoreError>;

    /// Health check: can we reach the storage?
    async fn health_check(&self) -> std::result::Result<bool, StoreError> {
        Ok(true)
    }
}
