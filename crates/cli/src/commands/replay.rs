//! `ravel replay`: Feed recorded model responses through the engine.
//!
//! The transcript holds one model response per step, separated by lines
//! containing only `---`. The demo agent offers:
//! - action `echo`, which returns its arguments
//! - action `clock`, which returns the current UTC time
//! - output `message`, a string printed to stderr as it is delivered
//! - input `message`, used by `--input`

use std::path::Path;
use std::sync::Arc;

use ravel_agent::{Agent, Engine};
use ravel_config::RuntimeConfig;
use ravel_core::capability::Definition;
use ravel_core::context::ContextDefinition;
use ravel_core::error::HandlerError;
use ravel_core::model::ScriptedModel;
use ravel_core::{CallContext, Schema};
use serde_json::{Value, json};

pub struct ReplayOptions {
    pub input: Option<String>,
    pub chunk_size: usize,
    pub events: bool,
}

pub async fn run(
    config: &RuntimeConfig,
    transcript: &Path,
    options: ReplayOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = super::read_transcript(transcript)
        .map_err(|e| format!("Failed to read {}: {e}", transcript.display()))?;
    let responses = split_transcript(&text);
    if responses.is_empty() {
        return Err("Transcript contains no responses".into());
    }
    tracing::info!(responses = responses.len(), path = %transcript.display(), "Replaying transcript");

    let model = ScriptedModel::new(responses).with_chunk_size(options.chunk_size);
    let agent = Agent::from_config(Arc::new(model), demo_context(), config)?
        .with_input(Definition::input("message").with_schema(Schema::string()));
    let engine = Engine::create(agent, json!({ "key": "replay" })).await?;

    let printer = options.events.then(|| {
        let mut events = engine.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let Ok(line) = serde_json::to_string(event.as_ref()) {
                    eprintln!("{line}");
                }
            }
        })
    });

    let chain = match options.input {
        Some(input) => engine.send("message", Value::String(input)).await?,
        None => engine.run().await?,
    };
    if let Some(printer) = printer {
        printer.abort();
    }

    println!("{}", serde_json::to_string_pretty(&chain)?);

    let errors = engine.errors().await;
    if !errors.is_empty() {
        eprintln!();
        for record in &errors {
            eprintln!("  [Error] {record}");
        }
    }
    Ok(())
}

/// The demo root context used for replays.
pub fn demo_context() -> ContextDefinition {
    ContextDefinition::new("demo")
        .with_description("Replay harness")
        .with_instructions("Answer with a `message` output. Use `echo` or `clock` when useful.")
        .with_capability(
            Definition::action("echo")
                .with_description("Return the arguments unchanged")
                .with_handler(|args: Value, _ctx: CallContext| async move {
                    Ok::<_, HandlerError>(args)
                }),
        )
        .with_capability(
            Definition::action("clock")
                .with_description("Current time in UTC")
                .with_handler(|_args: Value, _ctx: CallContext| async {
                    Ok::<_, HandlerError>(json!({ "now": chrono::Utc::now().to_rfc3339() }))
                }),
        )
        .with_capability(
            Definition::output("message")
                .with_description("A message for the user")
                .with_schema(Schema::string())
                .with_handler(|content: Value, _ctx: CallContext| async move {
                    if let Some(text) = content.as_str() {
                        eprintln!("  Assistant > {text}");
                    }
                    Ok::<_, HandlerError>(Value::Null)
                }),
        )
}

/// Split a transcript on lines that contain only `---`. Blank responses are
/// dropped.
pub fn split_transcript(text: &str) -> Vec<String> {
    let mut responses = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim() == "---" {
            responses.push(std::mem::take(&mut current));
            continue;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    responses.push(current);
    responses
        .into_iter()
        .filter(|r| !r.trim().is_empty())
        .collect()
}
