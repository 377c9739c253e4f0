//! Error types for the Ravel domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Call-level failures
//! ([`CallError`]) are converted into data ([`ErrorRecord`]) at the router
//! boundary; only run-level failures travel as [`Error`].

use crate::memory::MemoryRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The top-level error type for all Ravel operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Dispatch errors ---
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Parsing(#[from] ParsingError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// A nested call completed with an `error` memory.
    #[error("Call failed: {0}")]
    CallFailed(ErrorRecord),

    // --- Collaborator errors ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Lifecycle ---
    #[error("Run aborted")]
    Aborted,

    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error name recorded in `error` memories.
    pub fn error_name(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFoundError",
            Error::Parsing(_) => "ParsingError",
            Error::Call(e) => e.error_name(),
            Error::CallFailed(_) => "CallFailedError",
            Error::Model(_) => "ModelError",
            Error::Store(_) => "StoreError",
            Error::Aborted => "AbortError",
            Error::Config { .. } => "ConfigError",
            Error::Serialization(_) => "SerializationError",
            Error::Internal(_) => "InternalError",
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Dispatch errors ---

/// A memory referenced a capability name with no registered or enabled handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} name: {name}")]
pub struct NotFoundError {
    pub kind: String,
    pub name: String,
}

impl NotFoundError {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// A single schema violation, addressed by JSON pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

/// The underlying reason a payload could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// The payload decoded but did not satisfy the schema.
    Schema(Vec<SchemaViolation>),
    /// The payload could not be decoded at all (bad JSON, bad XML, ...).
    Syntax(String),
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseFailure::Schema(violations) => {
                writeln!(f, "payload does not match schema:")?;
                for (i, v) in violations.iter().enumerate() {
                    let path = if v.path.is_empty() { "(root)" } else { &v.path };
                    write!(f, "  - {path}: {}", v.message)?;
                    if i + 1 < violations.len() {
                        writeln!(f)?;
                    }
                }
                Ok(())
            }
            ParseFailure::Syntax(message) => {
                let quoted = serde_json::to_string(message).unwrap_or_else(|_| message.clone());
                write!(f, "{quoted}")
            }
        }
    }
}

/// Raw content failed structural parsing or schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to parse '{target}': {failure}")]
pub struct ParsingError {
    /// Name of the capability (or context) whose payload was being parsed.
    pub target: String,
    pub failure: ParseFailure,
}

impl ParsingError {
    pub fn new(target: impl Into<String>, failure: ParseFailure) -> Self {
        Self {
            target: target.into(),
            failure,
        }
    }

    pub fn syntax(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(target, ParseFailure::Syntax(message.into()))
    }
}

/// An error raised inside a handler body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Failure of a single dispatched call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Parsing(#[from] ParsingError),

    #[error("handler '{name}' failed: {source}")]
    Handler {
        name: String,
        #[source]
        source: HandlerError,
    },

    #[error("call '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("call '{name}' aborted")]
    Aborted { name: String },
}

impl CallError {
    /// Stable error name recorded in `error` memories.
    pub fn error_name(&self) -> &'static str {
        match self {
            CallError::NotFound(_) => "NotFoundError",
            CallError::Parsing(_) => "ParsingError",
            CallError::Handler { .. } => "HandlerError",
            CallError::Timeout { .. } => "TimeoutError",
            CallError::Aborted { .. } => "AbortError",
        }
    }

    /// Only execution failures are candidates for a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Handler { .. } | CallError::Timeout { .. })
    }
}

/// Serializable error description stored in `error` memories and in a run's
/// error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Error class, e.g. `NotFoundError` or `ParsingError`.
    pub name: String,
    pub message: String,
    /// The memory whose handling failed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<MemoryRef>,
}

impl ErrorRecord {
    pub fn from_call(err: &CallError, source: MemoryRef) -> Self {
        Self {
            name: err.error_name().to_string(),
            message: err.to_string(),
            source: Some(source),
        }
    }

    pub fn from_error(err: &Error, source: Option<MemoryRef>) -> Self {
        Self {
            name: err.error_name().to_string(),
            message: err.to_string(),
            source,
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

// --- Collaborator errors ---

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Request(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Model timed out: {0}")]
    Timeout(String),

    #[error("Model has no more scripted responses")]
    Exhausted,

    #[error("Model request aborted")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot serialization failed: {0}")]
    Serialization(String),
}
