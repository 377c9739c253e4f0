//! The handler-facing view of a running engine.
//!
//! Handlers never touch the chain directly. They receive a [`CallContext`]
//! and go through its [`Dispatcher`] to push memories, emit events or issue
//! nested calls.

use crate::context::{ContextHandle, ContextRef, ContextState};
use crate::error::{Error, Result};
use crate::memory::{Memory, MemoryId, MemoryRef};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Operations a handler may perform on the engine that dispatched it.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Push a memory into the run, routing it if it is routable.
    async fn push(&self, memory: Memory) -> Result<Memory>;

    /// Record an `event` memory and publish it to subscribers.
    async fn emit(&self, name: &str, data: Value, parent: Option<MemoryRef>) -> Result<MemoryRef>;

    /// Issue an action call and wait for its terminal memory.
    async fn call_action(&self, name: &str, args: Value, parent: Option<MemoryRef>) -> Result<Memory>;

    /// Snapshot of the run's chain.
    async fn working_memory(&self) -> Vec<Memory>;
}

/// Everything a handler can see about the call it is serving.
#[derive(Clone)]
pub struct CallContext {
    /// The memory being handled (call, output or input).
    pub memory: Memory,

    /// Live state of the owning context.
    pub context: ContextHandle,

    pub owner: ContextRef,

    /// Fires when the run is stopped.
    pub cancel: CancellationToken,

    pub run_id: MemoryId,

    /// 1-based attempt number under the retry policy.
    pub attempt: u32,

    dispatcher: Arc<dyn Dispatcher>,
}

impl CallContext {
    pub fn new(
        memory: Memory,
        context: ContextHandle,
        owner: ContextRef,
        cancel: CancellationToken,
        run_id: MemoryId,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            memory,
            context,
            owner,
            cancel,
            run_id,
            attempt: 1,
            dispatcher,
        }
    }

    /// A context not attached to any engine. `push` and `emit` succeed
    /// without effect; `call_action` fails.
    pub fn detached(memory: Memory, state: ContextState) -> Self {
        let owner = state.reference();
        Self::new(
            memory,
            Arc::new(RwLock::new(state)),
            owner,
            CancellationToken::new(),
            MemoryId::new(),
            Arc::new(Detached),
        )
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub async fn push(&self, memory: Memory) -> Result<Memory> {
        self.dispatcher.push(memory).await
    }

    /// Emit an event parented to the memory being handled.
    pub async fn emit(&self, name: &str, data: Value) -> Result<MemoryRef> {
        self.dispatcher
            .emit(name, data, Some(self.memory.reference()))
            .await
    }

    /// Issue a nested action call and return its terminal memory.
    pub async fn call_action(&self, name: &str, args: Value) -> Result<Memory> {
        self.dispatcher
            .call_action(name, args, Some(self.memory.reference()))
            .await
    }

    /// Like `call_action`, but unwraps the result content and turns an
    /// `error` memory into [`Error::CallFailed`].
    pub async fn call_action_value(&self, name: &str, args: Value) -> Result<Value> {
        let memory = self.call_action(name, args).await?;
        if let Some(record) = memory.error() {
            return Err(Error::CallFailed(record.clone()));
        }
        Ok(memory.content().unwrap_or(Value::Null))
    }

    pub async fn working_memory(&self) -> Vec<Memory> {
        self.dispatcher.working_memory().await
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("memory", &self.memory.id())
            .field("owner", &self.owner)
            .field("run_id", &self.run_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

struct Detached;

#[async_trait]
impl Dispatcher for Detached {
    async fn push(&self, memory: Memory) -> Result<Memory> {
        Ok(memory)
    }

    async fn emit(&self, name: &str, data: Value, parent: Option<MemoryRef>) -> Result<MemoryRef> {
        let mut memory = Memory::event(name, data);
        memory.parent = parent;
        Ok(memory.reference())
    }

    async fn call_action(&self, name: &str, _args: Value, _parent: Option<MemoryRef>) -> Result<Memory> {
        Err(Error::Internal(format!(
            "cannot call '{name}' from a detached context"
        )))
    }

    async fn working_memory(&self) -> Vec<Memory> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextDefinition;
    use crate::memory::MemoryKind;
    use serde_json::json;

    #[tokio::test]
    async fn detached_context() {
        let state = ContextDefinition::new("chat").instantiate(json!({})).unwrap();
        let ctx = CallContext::detached(Memory::action_call("search", json!({})), state);

        assert_eq!(ctx.owner.id, "chat:default");
        let event = ctx.emit("progress", json!(1)).await.unwrap();
        assert_eq!(event.kind, MemoryKind::Event);
        assert!(ctx.call_action("other", json!({})).await.is_err());
        assert!(ctx.working_memory().await.is_empty());
        assert!(!ctx.is_aborted());

        ctx.cancel.cancel();
        assert!(ctx.is_aborted());
    }

    #[tokio::test]
    async fn handlers_can_mutate_context_state() {
        let state = ContextDefinition::new("chat").instantiate(json!({})).unwrap();
        let ctx = CallContext::detached(Memory::action_call("note", json!({})), state);
        ctx.context.write().await.memory["notes"] = json!(["remember"]);
        assert_eq!(ctx.context.read().await.memory["notes"][0], "remember");
    }
}
