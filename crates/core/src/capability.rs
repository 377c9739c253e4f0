//! Capabilities: the named handlers a model can reach.
//!
//! Actions and tools are invoked through `action_call` / `tool_call`
//! elements, outputs through `output` elements, inputs by the host via
//! `Engine::send`. Every capability is a [`Definition`]: a name, a payload
//! schema, a call format and an optional [`Handler`]. Per step, enabled
//! definitions are paired with their owning context into [`CapabilityRef`]s.

use crate::call::CallContext;
use crate::context::{ContextRef, ContextState};
use crate::error::{CallError, HandlerError};
use crate::schema::Schema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Input,
    Output,
    Action,
    Tool,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Input => write!(f, "input"),
            CapabilityKind::Output => write!(f, "output"),
            CapabilityKind::Action => write!(f, "action"),
            CapabilityKind::Tool => write!(f, "tool"),
        }
    }
}

/// How the raw body of a call or output is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallFormat {
    #[default]
    Json,
    Xml,
    Text,
    Jsx,
}

impl fmt::Display for CallFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFormat::Json => write!(f, "json"),
            CallFormat::Xml => write!(f, "xml"),
            CallFormat::Text => write!(f, "text"),
            CallFormat::Jsx => write!(f, "jsx"),
        }
    }
}

pub type RetryPredicate = Arc<dyn Fn(&CallError, u32) -> bool + Send + Sync>;

/// Retry policy for actions and tools.
///
/// `attempt` is the number of attempts made so far (1 after the first
/// failure). Only retryable failures (handler errors, timeouts) are offered
/// to the policy.
#[derive(Clone, Default)]
pub enum RetryPolicy {
    #[default]
    Never,
    /// Retry up to the configured default number of times.
    Enabled,
    /// Retry up to `n` times.
    Times(u32),
    /// Retry while the predicate returns true.
    When(RetryPredicate),
}

impl RetryPolicy {
    pub fn when(f: impl Fn(&CallError, u32) -> bool + Send + Sync + 'static) -> Self {
        RetryPolicy::When(Arc::new(f))
    }

    pub fn should_retry(&self, err: &CallError, attempt: u32, default_attempts: u32) -> bool {
        if !err.is_retryable() {
            return false;
        }
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Enabled => attempt <= default_attempts,
            RetryPolicy::Times(n) => attempt <= *n,
            RetryPolicy::When(f) => f(err, attempt),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "Never"),
            RetryPolicy::Enabled => write!(f, "Enabled"),
            RetryPolicy::Times(n) => write!(f, "Times({n})"),
            RetryPolicy::When(_) => write!(f, "When(..)"),
        }
    }
}

/// The body of a capability.
///
/// Plain async closures `Fn(Value, CallContext) -> Future<Output =
/// Result<Value, HandlerError>>` implement this trait.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, args: Value, ctx: CallContext) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Value, CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn call(&self, args: Value, ctx: CallContext) -> Result<Value, HandlerError> {
        (self)(args, ctx).await
    }
}

pub type EnabledFn = Arc<dyn Fn(&ContextState) -> bool + Send + Sync>;

/// A registered capability.
#[derive(Clone)]
pub struct Definition {
    pub kind: CapabilityKind,
    pub name: String,
    pub description: String,
    pub schema: Schema,
    pub format: CallFormat,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    enabled: Option<EnabledFn>,
    handler: Option<Arc<dyn Handler>>,
}

impl Definition {
    pub fn new(kind: CapabilityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: String::new(),
            schema: Schema::any(),
            format: CallFormat::default(),
            retry: RetryPolicy::Never,
            timeout: None,
            enabled: None,
            handler: None,
        }
    }

    pub fn action(name: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Action, name)
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Tool, name)
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Output, name)
    }

    pub fn input(name: impl Into<String>) -> Self {
        Self::new(CapabilityKind::Input, name)
    }

    // ── Builders ──

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_format(mut self, format: CallFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Only offer this capability while the predicate holds.
    pub fn with_enabled(mut self, f: impl Fn(&ContextState) -> bool + Send + Sync + 'static) -> Self {
        self.enabled = Some(Arc::new(f));
        self
    }

    pub fn with_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    // ── Use ──

    pub fn is_enabled(&self, state: &ContextState) -> bool {
        self.enabled.as_ref().is_none_or(|f| f(state))
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Run the handler. Without one, the decoded args are the result.
    pub async fn invoke(&self, args: Value, ctx: CallContext) -> Result<Value, HandlerError> {
        match &self.handler {
            Some(handler) => handler.call(args, ctx).await,
            None => Ok(args),
        }
    }

    /// Prompt-facing description.
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "kind": self.kind,
            "name": self.name,
            "description": self.description,
            "format": self.format,
            "schema": self.schema.source(),
        })
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Definition")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("format", &self.format)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// A definition paired with the context instance that owns it this step.
#[derive(Debug, Clone)]
pub struct CapabilityRef {
    pub definition: Arc<Definition>,
    pub owner: ContextRef,
}

impl CapabilityRef {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// The capabilities offered during one step.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub actions: Vec<CapabilityRef>,
    pub outputs: Vec<CapabilityRef>,
    pub tools: Vec<CapabilityRef>,
}

impl Capabilities {
    pub fn add(&mut self, capability: CapabilityRef) {
        match capability.definition.kind {
            CapabilityKind::Action => self.actions.push(capability),
            CapabilityKind::Output => self.outputs.push(capability),
            CapabilityKind::Tool => self.tools.push(capability),
            CapabilityKind::Input => {}
        }
    }

    /// Find an action, optionally scoped to an owning context key.
    pub fn find_action(&self, name: &str, context_key: Option<&str>) -> Option<&CapabilityRef> {
        self.actions
            .iter()
            .find(|c| c.name() == name && context_key.is_none_or(|key| c.owner.key == key))
    }

    pub fn find_output(&self, name: &str) -> Option<&CapabilityRef> {
        self.outputs.iter().find(|c| c.name() == name)
    }

    pub fn find_tool(&self, name: &str) -> Option<&CapabilityRef> {
        self.tools.iter().find(|c| c.name() == name)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.outputs.is_empty() && self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityRef> {
        self.actions
            .iter()
            .chain(self.outputs.iter())
            .chain(self.tools.iter())
    }
}
