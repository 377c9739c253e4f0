//! In-memory store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use ravel_core::context::ContextSnapshot;
use ravel_core::error::StoreError;
use ravel_core::memory::Memory;
use ravel_core::store::SnapshotStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A store that keeps snapshots in hash maps.
/// Snapshots survive engine restarts within the same process only.
#[derive(Clone)]
pub struct InMemoryStore {
    contexts: Arc<RwLock<HashMap<String, ContextSnapshot>>>,
    memories: Arc<RwLock<HashMap<String, Vec<Memory>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            contexts: Arc::new(RwLock::new(HashMap::new())),
            memories: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of stored context snapshots.
    pub async fn context_count(&self) -> usize {
        self.contexts.read().await.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    fn name(&self) -> &str { "in_memory" }

    async fn save_context(&self, snapshot: &ContextSnapshot) -> Result<(), StoreError> {
        self.contexts
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_context(&self, id: &str) -> Result<Option<ContextSnapshot>, StoreError> {
        Ok(self.contexts.read().await.get(id).cloned())
    }

    async fn save_working_memory(&self, id: &str, memories: &[Memory]) -> Result<(), StoreError> {
        self.memories
            .write()
            .await
            .insert(id.to_string(), memories.to_vec());
        Ok(())
    }

    async fn load_working_memory(&self, id: &str) -> Result<Vec<Memory>, StoreError> {
        Ok(self.memories.read().await.get(id).cloned().unwrap_or_default())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let had_context = self.contexts.write().await.remove(id).is_some();
        let had_memory = self.memories.write().await.remove(id).is_some();
        Ok(had_context || had_memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_core::context::ContextDefinition;
    use serde_json::json;

    fn snapshot() -> ContextSnapshot {
        ContextDefinition::new("chat")
            .instantiate(json!({"key": "room-1"}))
            .unwrap()
    }

    #[tokio::test]
    async fn save_and_load_context() {
        let store = InMemoryStore::new();
        let mut state = snapshot();
        state.memory = json!({"turns": 2});
        store.save_context(&state).await.unwrap();

        let loaded = store.load_context("chat:room-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.load_context("chat:other").await.unwrap().is_none());
        assert_eq!(store.context_count().await, 1);
    }

    #[tokio::test]
    async fn working_memory_is_replaced() {
        let store = InMemoryStore::new();
        let first = vec![Memory::input("message", json!("a"))];
        let second = vec![
            Memory::input("message", json!("a")),
            Memory::input("message", json!("b")),
        ];
        store.save_working_memory("chat:room-1", &first).await.unwrap();
        store.save_working_memory("chat:room-1", &second).await.unwrap();

        let loaded = store.load_working_memory("chat:room-1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(store.load_working_memory("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_both() {
        let store = InMemoryStore::new();
        store.save_context(&snapshot()).await.unwrap();
        store.save_working_memory("chat:room-1", &[]).await.unwrap();

        assert!(store.delete("chat:room-1").await.unwrap());
        assert!(!store.delete("chat:room-1").await.unwrap());
        assert_eq!(store.context_count().await, 0);
    }
}
