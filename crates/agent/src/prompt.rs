//! Prompt rendering for a single step.
//!
//! The default renderer produces four sections, in order:
//!
//! 1. **Instructions** from every active context
//! 2. **Capabilities** offered this step (name, description, format, schema)
//! 3. **Contexts** with their args and memory
//! 4. **New memories**, the unprocessed memories the step adopted
//!
//! followed by a short guide to the response markup. Rendering is
//! deterministic; identical inputs give identical prompts.

use ravel_core::capability::{Capabilities, CapabilityRef};
use ravel_core::chain::Chain;
use ravel_core::context::ContextState;
use ravel_core::memory::{Memory, MemoryRef};

// ── Types ─────────────────────────────────────────────────────────────────

/// One active context as seen by the renderer.
#[derive(Debug, Clone)]
pub struct RenderedContext {
    pub state: ContextState,
    pub instructions: Option<String>,
}

/// Everything the renderer may use for one step.
pub struct PromptInput<'a> {
    /// 1-based step number.
    pub step: u32,
    /// Root context first, then composed children.
    pub contexts: &'a [RenderedContext],
    pub capabilities: &'a Capabilities,
    pub inputs: &'a [CapabilityRef],
    pub chain: &'a Chain,
    /// Memories adopted by this step's `step` memory.
    pub unprocessed: &'a [MemoryRef],
}

pub trait PromptRenderer: Send + Sync {
    fn render(&self, input: &PromptInput<'_>) -> String;
}

// ── Default renderer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct DefaultPromptRenderer;

const MARKUP_GUIDE: &str = "\
## Response format

Reply with any of these elements, in any order:
- <think>...</think> for private reasoning
- <action_call name=\"NAME\">ARGS</action_call> to call an action (add contextKey=\"KEY\" to target a context)
- <tool_call name=\"NAME\">ARGS</tool_call> to call a tool
- <output name=\"NAME\">CONTENT</output> to produce an output

Encode ARGS and CONTENT in the format listed for the capability.";

impl PromptRenderer for DefaultPromptRenderer {
    fn render(&self, input: &PromptInput<'_>) -> String {
        let mut sections = Vec::new();

        let instructions: Vec<&str> = input
            .contexts
            .iter()
            .filter_map(|c| c.instructions.as_deref())
            .filter(|text| !text.trim().is_empty())
            .collect();
        if !instructions.is_empty() {
            sections.push(format!("## Instructions\n\n{}", instructions.join("\n\n")));
        }

        if !input.capabilities.is_empty() {
            let lines: Vec<String> = input.capabilities.iter().map(render_capability).collect();
            sections.push(format!("## Capabilities\n\n{}", lines.join("\n")));
        }

        if !input.contexts.is_empty() {
            let lines: Vec<String> = input
                .contexts
                .iter()
                .map(|c| {
                    format!(
                        "- {} args={} memory={}",
                        c.state.id,
                        compact(&c.state.args),
                        compact(&c.state.memory)
                    )
                })
                .collect();
            sections.push(format!("## Contexts\n\n{}", lines.join("\n")));
        }

        let new: Vec<String> = input
            .unprocessed
            .iter()
            .filter_map(|r| input.chain.get(&r.id))
            .map(render_memory)
            .collect();
        if !new.is_empty() {
            sections.push(format!("## New memories (step {})\n\n{}", input.step, new.join("\n")));
        }

        sections.push(MARKUP_GUIDE.to_string());
        sections.join("\n\n")
    }
}

fn render_capability(capability: &CapabilityRef) -> String {
    let d = &capability.definition;
    let mut line = format!("- {} `{}` [{}]", d.kind, d.name, d.format);
    if !d.description.is_empty() {
        line.push_str(&format!(": {}", d.description));
    }
    if !d.schema.is_any() {
        line.push_str(&format!("\n  schema: {}", compact(d.schema.source())));
    }
    line
}

fn render_memory(memory: &Memory) -> String {
    let name = memory.name.as_deref().unwrap_or("-");
    let body = match memory.content() {
        Some(value) => compact(&value),
        None => memory.raw().to_string(),
    };
    format!("[{} {}] {}", memory.kind(), name, body)
}

fn compact(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_core::capability::Definition;
    use ravel_core::context::ContextRef;
    use ravel_core::Schema;
    use serde_json::json;
    use std::sync::Arc;

    fn context(instructions: Option<&str>) -> RenderedContext {
        RenderedContext {
            state: ContextState {
                id: "chat:alice".into(),
                name: "chat".into(),
                key: "alice".into(),
                args: json!({ "user": "alice" }),
                settings: Default::default(),
                memory: json!({ "turns": 2 }),
            },
            instructions: instructions.map(str::to_string),
        }
    }

    fn render(contexts: &[RenderedContext], caps: &Capabilities, chain: &Chain, unprocessed: &[MemoryRef]) -> String {
        DefaultPromptRenderer.render(&PromptInput {
            step: 1,
            contexts,
            capabilities: caps,
            inputs: &[],
            chain,
            unprocessed,
        })
    }

    #[test]
    fn sections_in_order() {
        let mut caps = Capabilities::default();
        caps.add(CapabilityRef {
            definition: Arc::new(
                Definition::action("search")
                    .with_description("Search the web")
                    .with_schema(Schema::new(json!({ "type": "object" })).unwrap()),
            ),
            owner: ContextRef::new("chat", "alice"),
        });
        let input = Memory::input("message", json!("hello"));
        let refs = vec![input.reference()];
        let chain = Chain::from(vec![input]);

        let prompt = render(&[context(Some("Be brief."))], &caps, &chain, &refs);

        let order: Vec<usize> = ["## Instructions", "## Capabilities", "## Contexts", "## New memories", "## Response format"]
            .iter()
            .map(|h| prompt.find(h).unwrap_or_else(|| panic!("missing {h}")))
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(prompt.contains("- action `search` [json]: Search the web"));
        assert!(prompt.contains("schema: {\"type\":\"object\"}"));
        assert!(prompt.contains("[input message] \"hello\""));
        assert!(prompt.contains("chat:alice"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let prompt = render(&[context(None)], &Capabilities::default(), &Chain::new(), &[]);
        assert!(!prompt.contains("## Instructions"));
        assert!(!prompt.contains("## Capabilities"));
        assert!(!prompt.contains("## New memories"));
        assert!(prompt.contains("## Response format"));
    }

    #[test]
    fn deterministic() {
        let contexts = [context(Some("x"))];
        let a = render(&contexts, &Capabilities::default(), &Chain::new(), &[]);
        let b = render(&contexts, &Capabilities::default(), &Chain::new(), &[]);
        assert_eq!(a, b);
    }
}
