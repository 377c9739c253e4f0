//! # Ravel Core
//!
//! Domain types, traits, and error definitions for the Ravel agent runtime.
//! Everything a run produces is a [`Memory`]; the other crates implement
//! against the traits defined here:
//! - [`LanguageModel`] for token-streaming backends
//! - [`SnapshotStore`] for persistence
//! - [`Handler`] for capability bodies
//! - [`Dispatcher`] for the handler-facing engine surface

pub mod call;
pub mod capability;
pub mod chain;
pub mod context;
pub mod error;
pub mod event;
pub mod memory;
pub mod model;
pub mod schema;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use call::{CallContext, Dispatcher};
pub use capability::{
    Capabilities, CapabilityKind, CapabilityRef, CallFormat, Definition, Handler, RetryPolicy,
};
pub use chain::Chain;
pub use context::{
    ContextDefinition, ContextHandle, ContextRef, ContextSnapshot, ContextState,
};
pub use error::{
    CallError, Error, ErrorRecord, HandlerError, ModelError, NotFoundError, ParseFailure,
    ParsingError, Result, SchemaViolation, StoreError,
};
pub use event::{EventBus, RunEvent};
pub use memory::{Chunk, Memory, MemoryId, MemoryKind, MemoryRef, Payload, UNPROCESSED};
pub use model::{LanguageModel, ModelRequest, ModelStream, ScriptedModel, ScriptedResponse};
pub use schema::Schema;
pub use store::SnapshotStore;
