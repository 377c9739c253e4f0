//! The `Agent` value: everything an engine needs, passed in explicitly.

use crate::prompt::{DefaultPromptRenderer, PromptRenderer};
use ravel_config::{EngineConfig, RuntimeConfig};
use ravel_core::capability::{CapabilityKind, Definition};
use ravel_core::context::ContextDefinition;
use ravel_core::error::Result;
use ravel_core::event::EventBus;
use ravel_core::model::LanguageModel;
use ravel_core::store::SnapshotStore;
use ravel_memory::InMemoryStore;
use ravel_stream::ParserOptions;
use std::sync::Arc;
use tracing::warn;

/// A model, a root context and the inputs hosts may send.
#[derive(Clone)]
pub struct Agent {
    pub(crate) model: Arc<dyn LanguageModel>,
    pub(crate) context: Arc<ContextDefinition>,
    pub(crate) inputs: Vec<Arc<Definition>>,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) events: EventBus,
    pub(crate) config: EngineConfig,
    pub(crate) parser: ParserOptions,
    pub(crate) renderer: Arc<dyn PromptRenderer>,
}

impl Agent {
    /// An agent with an in-memory store and default engine settings.
    pub fn new(model: Arc<dyn LanguageModel>, context: ContextDefinition) -> Self {
        let config = EngineConfig::default();
        Self {
            model,
            context: Arc::new(context),
            inputs: Vec::new(),
            store: Arc::new(InMemoryStore::new()),
            events: EventBus::new(config.event_capacity),
            config,
            parser: ParserOptions::default(),
            renderer: Arc::new(DefaultPromptRenderer),
        }
    }

    /// Build an agent from a loaded runtime configuration.
    pub fn from_config(
        model: Arc<dyn LanguageModel>,
        context: ContextDefinition,
        config: &RuntimeConfig,
    ) -> Result<Self> {
        let store = ravel_memory::open_store(&config.store.backend, config.store.path.clone())?;

        let mut parser = ParserOptions::default().with_extra_tags(config.parser.extra_tags.iter().cloned());
        if !config.parser.dedup_tags.is_empty() {
            parser = parser.with_dedup_tags(config.parser.dedup_tags.iter().cloned());
        }

        Ok(Self::new(model, context)
            .with_store(store)
            .with_events(EventBus::new(config.engine.event_capacity))
            .with_config(config.engine.clone())
            .with_parser_options(parser))
    }

    /// Declare an input hosts may `send`. Non-input definitions are ignored.
    pub fn with_input(mut self, definition: Definition) -> Self {
        if definition.kind != CapabilityKind::Input {
            warn!(name = %definition.name, kind = %definition.kind, "Ignoring non-input definition");
            return self;
        }
        self.inputs.push(Arc::new(definition));
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_parser_options(mut self, parser: ParserOptions) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_prompt_renderer(mut self, renderer: impl PromptRenderer + 'static) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }

    pub fn context(&self) -> &ContextDefinition {
        &self.context
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn input(&self, name: &str) -> Option<&Arc<Definition>> {
        self.inputs.iter().find(|d| d.name == name)
    }

    /// Steps allowed per `run`: the root context's budget, else the config's.
    pub fn max_steps(&self) -> u32 {
        self.context.max_steps.unwrap_or(self.config.max_steps).max(1)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("model", &self.model.name())
            .field("context", &self.context.name)
            .field("inputs", &self.inputs.iter().map(|d| d.name.as_str()).collect::<Vec<_>>())
            .field("store", &self.store.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_core::model::ScriptedModel;

    fn model() -> Arc<dyn LanguageModel> {
        Arc::new(ScriptedModel::new(Vec::<String>::new()))
    }

    #[test]
    fn with_input_rejects_other_kinds() {
        let agent = Agent::new(model(), ContextDefinition::new("chat"))
            .with_input(Definition::input("message"))
            .with_input(Definition::action("search"));
        assert!(agent.input("message").is_some());
        assert!(agent.input("search").is_none());
    }

    #[test]
    fn max_steps_prefers_context_budget() {
        let agent = Agent::new(model(), ContextDefinition::new("chat"));
        assert_eq!(agent.max_steps(), 5);

        let agent = Agent::new(model(), ContextDefinition::new("chat").with_max_steps(2));
        assert_eq!(agent.max_steps(), 2);
    }

    #[test]
    fn from_config_applies_store_and_parser() {
        let mut config = RuntimeConfig::default();
        config.store.backend = "none".into();
        config.parser.extra_tags = vec!["note".into()];
        config.engine.max_steps = 9;

        let agent = Agent::from_config(model(), ContextDefinition::new("chat"), &config).unwrap();
        assert_eq!(agent.store().name(), "none");
        assert!(agent.parser.tags.contains("note"));
        assert!(agent.parser.tags.contains("think"));
        assert_eq!(agent.max_steps(), 9);
    }

    #[test]
    fn from_config_rejects_unknown_backend() {
        let mut config = RuntimeConfig::default();
        config.store.backend = "redis".into();
        let err = Agent::from_config(model(), ContextDefinition::new("chat"), &config).unwrap_err();
        assert_eq!(err.error_name(), "StoreError");
    }
}
