//! No-op store: disables persistence entirely.

use async_trait::async_trait;
use ravel_core::context::ContextSnapshot;
use ravel_core::error::StoreError;
use ravel_core::memory::Memory;
use ravel_core::store::SnapshotStore;

/// A store that keeps nothing. Every run starts from fresh state.
pub struct NoopStore;

#[async_trait]
impl SnapshotStore for NoopStore {
    fn name(&self) -> &str { "none" }

    async fn save_context(&self, _snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_context(&self, _id: &str) -> Result<Option<ContextSnapshot>, StoreError> {
        Ok(None)
    }

    async fn save_working_memory(&self, _id: &str, _memories: &[Memory]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_working_memory(&self, _id: &str) -> Result<Vec<Memory>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _id: &str) -> Result<bool, StoreError> {
        Ok(false)
    }
}
