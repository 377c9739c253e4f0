//! The Ravel run engine.
//!
//! An [`Engine`] drives an [`Agent`] through a **Stream → Route → Settle**
//! cycle:
//!
//! 1. **Prepare** the step's capabilities from every active context
//! 2. **Stream** the model response; structural elements become memories
//!    while they are still arriving
//! 3. **Route** each finalized memory to its input, output, action or tool
//!    handler; calls run concurrently as their own tasks
//! 4. **Settle**: wait for dispatched work, persist snapshots, run hooks
//!
//! The loop continues while unprocessed memories remain (call results,
//! errors, new inputs) or a context hook asks for another step, up to the
//! step budget.

pub mod agent;
pub mod engine;
pub mod pending;
pub mod prompt;
pub mod router;
pub mod task;

pub use agent::Agent;
pub use engine::{Engine, EngineStatus};
pub use pending::{PendingGuard, PendingWork};
pub use prompt::{DefaultPromptRenderer, PromptInput, PromptRenderer, RenderedContext};
pub use router::{Dispatched, Router};
pub use task::{TaskFailure, TaskRunner};
