//! Contexts: the stateful scopes that own capabilities.
//!
//! A [`ContextDefinition`] is the static description (schema, instructions,
//! capabilities, hooks). Instantiating it with args yields a
//! [`ContextState`], the serializable snapshot `{id, name, key, args,
//! settings, memory}` that the engine persists between runs. Definitions may
//! compose child contexts; their capabilities are offered in the same step
//! with the child as owner.

use crate::capability::{CapabilityRef, Capabilities, Definition};
use crate::chain::Chain;
use crate::error::{Error, ParseFailure, ParsingError, Result};
use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Identifies a context instance. `id` is always `"<name>:<key>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextRef {
    pub id: String,
    pub name: String,
    pub key: String,
}

impl ContextRef {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        let name = name.into();
        let key = key.into();
        Self {
            id: format!("{name}:{key}"),
            name,
            key,
        }
    }
}

impl fmt::Display for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Serializable state of a context instance. Never holds live handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    pub id: String,
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
    /// Context-owned memory, mutated by handlers and `on_step` hooks.
    #[serde(default)]
    pub memory: Value,
}

/// The persisted form of a context.
pub type ContextSnapshot = ContextState;

impl ContextState {
    pub fn reference(&self) -> ContextRef {
        ContextRef {
            id: self.id.clone(),
            name: self.name.clone(),
            key: self.key.clone(),
        }
    }
}

/// Shared, lockable handle to a live context state.
pub type ContextHandle = Arc<RwLock<ContextState>>;

pub type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;
pub type CreateFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type InstructionsFn = Arc<dyn Fn(&ContextState) -> String + Send + Sync>;
pub type ResolverFn = Arc<dyn Fn(&ContextState) -> Vec<Arc<Definition>> + Send + Sync>;
pub type ContinueFn = Arc<dyn Fn(&ContextState, &Chain) -> bool + Send + Sync>;
pub type StepFn = Arc<dyn Fn(&mut ContextState, &Chain) + Send + Sync>;

/// Static description of a context type.
#[derive(Clone)]
pub struct ContextDefinition {
    pub name: String,
    pub description: String,
    pub schema: Schema,
    pub max_steps: Option<u32>,
    instructions: Option<String>,
    instructions_fn: Option<InstructionsFn>,
    actions: Vec<Arc<Definition>>,
    outputs: Vec<Arc<Definition>>,
    tools: Vec<Arc<Definition>>,
    resolvers: Vec<ResolverFn>,
    key: Option<KeyFn>,
    create: Option<CreateFn>,
    should_continue: Option<ContinueFn>,
    on_step: Option<StepFn>,
    children: Vec<(Arc<ContextDefinition>, Value)>,
}

impl ContextDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema: Schema::any(),
            max_steps: None,
            instructions: None,
            instructions_fn: None,
            actions: Vec::new(),
            outputs: Vec::new(),
            tools: Vec::new(),
            resolvers: Vec::new(),
            key: None,
            create: None,
            should_continue: None,
            on_step: None,
            children: Vec::new(),
        }
    }

    // ── Builders ──

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Schema the instantiation args must satisfy.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Instructions computed from the current state each step.
    pub fn with_instructions_fn(
        mut self,
        f: impl Fn(&ContextState) -> String + Send + Sync + 'static,
    ) -> Self {
        self.instructions_fn = Some(Arc::new(f));
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Register a static capability. Placement follows the definition's kind.
    pub fn with_capability(mut self, definition: Definition) -> Self {
        use crate::capability::CapabilityKind;
        let definition = Arc::new(definition);
        match definition.kind {
            CapabilityKind::Action => self.actions.push(definition),
            CapabilityKind::Output => self.outputs.push(definition),
            CapabilityKind::Tool => self.tools.push(definition),
            CapabilityKind::Input => {
                tracing::warn!(
                    context = %self.name,
                    name = %definition.name,
                    "Inputs are registered on the agent, ignoring context input"
                );
            }
        }
        self
    }

    /// Register a resolver that computes extra capabilities from state each step.
    pub fn with_resolver(
        mut self,
        f: impl Fn(&ContextState) -> Vec<Arc<Definition>> + Send + Sync + 'static,
    ) -> Self {
        self.resolvers.push(Arc::new(f));
        self
    }

    /// Derive the instance key from the args.
    pub fn with_key(mut self, f: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
        self.key = Some(Arc::new(f));
        self
    }

    /// Build the initial context memory from the args.
    pub fn with_create(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.create = Some(Arc::new(f));
        self
    }

    pub fn with_should_continue(
        mut self,
        f: impl Fn(&ContextState, &Chain) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_continue = Some(Arc::new(f));
        self
    }

    pub fn with_on_step(
        mut self,
        f: impl Fn(&mut ContextState, &Chain) + Send + Sync + 'static,
    ) -> Self {
        self.on_step = Some(Arc::new(f));
        self
    }

    /// Compose a child context, instantiated with `args` alongside this one.
    pub fn compose(mut self, child: ContextDefinition, args: Value) -> Self {
        self.children.push((Arc::new(child), args));
        self
    }

    // ── Instances ──

    pub fn children(&self) -> &[(Arc<ContextDefinition>, Value)] {
        &self.children
    }

    /// Instance key for the given args: the key function, else a string
    /// `key` arg, else `"default"`.
    pub fn key_for(&self, args: &Value) -> String {
        if let Some(f) = &self.key {
            return f(args);
        }
        args.get("key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn reference_for(&self, args: &Value) -> ContextRef {
        ContextRef::new(self.name.clone(), self.key_for(args))
    }

    /// Validate args and build a fresh state.
    pub fn instantiate(&self, args: Value) -> Result<ContextState> {
        self.schema.validate(&args).map_err(|violations| {
            Error::Parsing(ParsingError::new(
                self.name.clone(),
                ParseFailure::Schema(violations),
            ))
        })?;
        let reference = self.reference_for(&args);
        let memory = match &self.create {
            Some(f) => f(&args),
            None => Value::Object(serde_json::Map::new()),
        };
        Ok(ContextState {
            id: reference.id,
            name: reference.name,
            key: reference.key,
            args,
            settings: serde_json::Map::new(),
            memory,
        })
    }

    pub fn instructions(&self, state: &ContextState) -> Option<String> {
        match (&self.instructions_fn, &self.instructions) {
            (Some(f), _) => Some(f(state)),
            (None, Some(text)) => Some(text.clone()),
            (None, None) => None,
        }
    }

    /// Add this context's enabled capabilities to `into`, owned by `state`.
    pub fn resolve_capabilities(&self, state: &ContextState, into: &mut Capabilities) {
        let owner = state.reference();
        let mut all: Vec<Arc<Definition>> = Vec::new();
        all.extend(self.actions.iter().cloned());
        all.extend(self.outputs.iter().cloned());
        all.extend(self.tools.iter().cloned());
        for resolver in &self.resolvers {
            all.extend(resolver(state));
        }
        for definition in all {
            if !definition.is_enabled(state) {
                continue;
            }
            into.add(CapabilityRef {
                definition,
                owner: owner.clone(),
            });
        }
    }

    pub fn should_continue(&self, state: &ContextState, chain: &Chain) -> bool {
        self.should_continue.as_ref().is_some_and(|f| f(state, chain))
    }

    pub fn on_step(&self, state: &mut ContextState, chain: &Chain) {
        if let Some(f) = &self.on_step {
            f(state, chain);
        }
    }
}

impl fmt::Debug for ContextDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextDefinition")
            .field("name", &self.name)
            .field("max_steps", &self.max_steps)
            .field("actions", &self.actions.len())
            .field("outputs", &self.outputs.len())
            .field("tools", &self.tools.len())
            .field("children", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityKind, Definition};
    use serde_json::json;

    #[test]
    fn key_defaults_and_overrides() {
        let plain = ContextDefinition::new("chat");
        assert_eq!(plain.key_for(&json!({})), "default");
        assert_eq!(plain.key_for(&json!({"key": "room-1"})), "room-1");

        let keyed = ContextDefinition::new("chat")
            .with_key(|args| args["user"].as_str().unwrap_or("anon").to_string());
        let state = keyed.instantiate(json!({"user": "ana"})).unwrap();
        assert_eq!(state.id, "chat:ana");
        assert_eq!(state.key, "ana");
    }

    #[test]
    fn instantiate_validates_args() {
        let definition = ContextDefinition::new("chat").with_schema(
            Schema::new(json!({
                "type": "object",
                "properties": { "user": { "type": "string" } },
                "required": ["user"]
            }))
            .unwrap(),
        );
        let err = definition.instantiate(json!({})).unwrap_err();
        assert!(matches!(err, Error::Parsing(_)));
        assert!(err.to_string().starts_with("failed to parse 'chat'"));
    }

    #[test]
    fn create_seeds_memory() {
        let definition =
            ContextDefinition::new("counter").with_create(|args| json!({"count": args["start"]}));
        let state = definition.instantiate(json!({"start": 3})).unwrap();
        assert_eq!(state.memory, json!({"count": 3}));
    }

    #[test]
    fn resolves_enabled_capabilities_with_owner() {
        let definition = ContextDefinition::new("chat")
            .with_capability(Definition::action("search"))
            .with_capability(
                Definition::action("admin").with_enabled(|state| state.memory["admin"] == true),
            )
            .with_capability(Definition::output("message"))
            .with_resolver(|state| {
                if state.memory["tools"] == true {
                    vec![Arc::new(Definition::tool("clock"))]
                } else {
                    vec![]
                }
            });

        let mut state = definition.instantiate(json!({})).unwrap();
        let mut caps = Capabilities::default();
        definition.resolve_capabilities(&state, &mut caps);
        assert_eq!(caps.actions.len(), 1);
        assert_eq!(caps.outputs.len(), 1);
        assert!(caps.tools.is_empty());
        assert_eq!(caps.actions[0].owner.id, "chat:default");

        state.memory = json!({"admin": true, "tools": true});
        let mut caps = Capabilities::default();
        definition.resolve_capabilities(&state, &mut caps);
        assert_eq!(caps.actions.len(), 2);
        assert_eq!(caps.tools[0].definition.kind, CapabilityKind::Tool);
    }

    #[test]
    fn hooks_default_to_noop() {
        let definition = ContextDefinition::new("chat");
        let mut state = definition.instantiate(json!({})).unwrap();
        assert!(!definition.should_continue(&state, &Chain::new()));
        definition.on_step(&mut state, &Chain::new());
        assert_eq!(state.memory, json!({}));
        assert_eq!(definition.instructions(&state), None);
    }
}
