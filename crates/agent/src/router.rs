//! Call router: resolve a finalized memory to a capability, decode and
//! validate its payload, invoke the handler, and produce the terminal record.
//!
//! Every failure is caught here and turned into an `error` memory. Nothing
//! the router does can fail the run.

use crate::task::{TaskFailure, TaskRunner};
use ravel_core::capability::{Capabilities, CapabilityRef, Definition};
use ravel_core::error::{CallError, ErrorRecord, NotFoundError, ParseFailure, ParsingError};
use ravel_core::memory::{Memory, MemoryKind, Payload};
use ravel_core::CallContext;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// What dispatching one memory produced.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The routed memory with its payload resolved when decoding succeeded.
    pub source: Memory,
    /// The terminal record: a result for calls, or an `error` memory.
    /// Inputs and outputs that succeed have none.
    pub terminal: Option<Memory>,
}

impl Dispatched {
    pub fn is_failure(&self) -> bool {
        self.terminal
            .as_ref()
            .is_some_and(|m| *m.kind() == MemoryKind::Error)
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    runner: TaskRunner,
    default_timeout: Option<Duration>,
    default_attempts: u32,
}

impl Router {
    pub fn new(runner: TaskRunner) -> Self {
        Self {
            runner,
            default_timeout: None,
            default_attempts: 3,
        }
    }

    /// Timeout applied to calls whose definition sets none.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Attempts allowed under `RetryPolicy::Enabled`.
    pub fn with_default_attempts(mut self, attempts: u32) -> Self {
        self.default_attempts = attempts;
        self
    }

    /// Find the capability a memory addresses.
    pub fn resolve(
        &self,
        memory: &Memory,
        capabilities: &Capabilities,
        inputs: &[CapabilityRef],
    ) -> Result<CapabilityRef, NotFoundError> {
        let name = memory
            .name
            .as_deref()
            .or_else(|| memory.attribute("name"))
            .unwrap_or_default();

        let (kind, found) = match memory.kind() {
            MemoryKind::Input => ("input", inputs.iter().find(|c| c.name() == name)),
            MemoryKind::Output => ("output", capabilities.find_output(name)),
            MemoryKind::ActionCall => (
                "action",
                capabilities.find_action(name, memory.attribute("contextKey")),
            ),
            MemoryKind::ToolCall => ("tool", capabilities.find_tool(name)),
            other => return Err(NotFoundError::new(other.to_string(), name)),
        };
        found.cloned().ok_or_else(|| NotFoundError::new(kind, name))
    }

    /// Decode the memory's payload per the definition's format and validate it.
    /// Content that is already structured is only validated.
    pub fn decode(&self, memory: &Memory, definition: &Definition) -> Result<Value, ParsingError> {
        let value = match &memory.payload {
            Payload::Data(value) => value.clone(),
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Pending => {
                ravel_stream::decode(definition.format, memory.raw(), &definition.schema)
                    .map_err(|failure| ParsingError::new(definition.name.clone(), failure))?
            }
            Payload::Failure(record) => {
                return Err(ParsingError::syntax(
                    definition.name.clone(),
                    format!("cannot route an error record: {record}"),
                ));
            }
        };

        definition.schema.validate(&value).map_err(|violations| {
            ParsingError::new(definition.name.clone(), ParseFailure::Schema(violations))
        })?;
        Ok(value)
    }

    /// The single terminal `error` memory for a failed memory.
    pub fn reject(source: &Memory, err: &CallError) -> Memory {
        let record = ErrorRecord::from_call(err, source.reference());
        let mut failure = Memory::failure(source, record);
        if let Some(parent) = &source.parent {
            failure.metadata.insert(
                "step".into(),
                serde_json::to_value(parent).unwrap_or(Value::Null),
            );
        }
        failure
    }

    /// Dispatch `memory` to the resolved capability.
    pub async fn dispatch(
        &self,
        mut memory: Memory,
        capability: &CapabilityRef,
        ctx: CallContext,
    ) -> Dispatched {
        let definition = capability.definition.as_ref();
        let name = definition.name.clone();

        let args = match self.decode(&memory, definition) {
            Ok(args) => args,
            Err(e) => {
                debug!(memory_id = %memory.id(), name = %name, error = %e, "Payload rejected");
                let terminal = Self::reject(&memory, &CallError::from(e));
                return Dispatched {
                    source: memory,
                    terminal: Some(terminal),
                };
            }
        };
        memory.payload = Payload::Data(args.clone());
        memory.finalize();

        let kind = memory.kind().clone();
        match kind {
            MemoryKind::Input => match definition.invoke(args, ctx).await {
                Ok(augmented) => {
                    if !augmented.is_null() {
                        memory.payload = Payload::Data(augmented);
                    }
                    Dispatched {
                        source: memory,
                        terminal: None,
                    }
                }
                Err(source) => {
                    let terminal = Self::reject(&memory, &CallError::Handler { name, source });
                    Dispatched {
                        source: memory,
                        terminal: Some(terminal),
                    }
                }
            },
            MemoryKind::Output => match definition.invoke(args, ctx).await {
                Ok(_) => Dispatched {
                    source: memory,
                    terminal: None,
                },
                Err(source) => {
                    warn!(memory_id = %memory.id(), name = %name, error = %source, "Output handler failed");
                    let terminal = Self::reject(&memory, &CallError::Handler { name, source });
                    Dispatched {
                        source: memory,
                        terminal: Some(terminal),
                    }
                }
            },
            _ => {
                let terminal = match self.execute(definition, args, ctx).await {
                    Ok(value) => Memory::result_for(&memory, value),
                    Err(e) => {
                        warn!(memory_id = %memory.id(), name = %name, error = %e, "Call failed");
                        Self::reject(&memory, &e)
                    }
                };
                Dispatched {
                    source: memory,
                    terminal: Some(terminal),
                }
            }
        }
    }

    /// Run a call handler under the retry, timeout and abort policy.
    async fn execute(
        &self,
        definition: &Definition,
        args: Value,
        ctx: CallContext,
    ) -> Result<Value, CallError> {
        let name = definition.name.as_str();
        let timeout = definition.timeout.or(self.default_timeout);
        let cancel = ctx.cancel.clone();

        let outcome = self
            .runner
            .run(
                name,
                timeout,
                &cancel,
                |failure, attempts| {
                    let err = call_error(name, failure.clone());
                    definition
                        .retry
                        .should_retry(&err, attempts, self.default_attempts)
                },
                |attempt| {
                    let args = args.clone();
                    let ctx = ctx.clone().with_attempt(attempt);
                    async move { definition.invoke(args, ctx).await }
                },
            )
            .await;

        outcome.map_err(|failure| call_error(name, failure))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(TaskRunner::default())
    }
}

fn call_error(name: &str, failure: TaskFailure<ravel_core::HandlerError>) -> CallError {
    match failure {
        TaskFailure::Failed(source) => CallError::Handler {
            name: name.to_string(),
            source,
        },
        TaskFailure::TimedOut(timeout) => CallError::Timeout {
            name: name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        },
        TaskFailure::Aborted => CallError::Aborted {
            name: name.to_string(),
        },
    }
}
