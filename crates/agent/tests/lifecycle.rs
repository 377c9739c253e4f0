//! Engine lifecycle: retries, stop and abort, settling, nested calls,
//! composed contexts and persistence across engines.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use ravel_agent::{Agent, Engine, EngineStatus};
use ravel_config::EngineConfig;
use ravel_core::capability::{Definition, RetryPolicy};
use ravel_core::context::ContextDefinition;
use ravel_core::error::{Error, HandlerError};
use ravel_core::memory::{Memory, MemoryKind};
use ravel_core::model::ScriptedModel;
use ravel_core::CallContext;
use ravel_memory::FileStore;
use serde_json::{Value, json};
use tokio::sync::Notify;

// ── Helpers ──────────────────────────────────────────────────────────────

fn silent_agent(context: ContextDefinition) -> Agent {
    Agent::new(Arc::new(ScriptedModel::new(Vec::<String>::new())), context).with_config(EngineConfig {
        retry_backoff_ms: 1,
        ..EngineConfig::default()
    })
}

fn scripted_agent(responses: &[&str], context: ContextDefinition) -> Agent {
    Agent::new(
        Arc::new(ScriptedModel::new(responses.iter().copied())),
        context,
    )
}

fn terminals_for<'a>(chain: &'a [Memory], call: &Memory) -> Vec<&'a Memory> {
    chain
        .iter()
        .filter(|m| m.kind().is_terminal() && m.parent.as_ref() == Some(&call.reference()))
        .collect()
}

// ── Retry ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn flaky_call_retries_into_one_result() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let context = ContextDefinition::new("chat").with_capability(
        Definition::action("flaky")
            .with_retry(RetryPolicy::Times(3))
            .with_handler(move |_args: Value, ctx: CallContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if ctx.attempt < 3 {
                        Err(HandlerError::new("transient"))
                    } else {
                        Ok(json!({ "attempt": ctx.attempt }))
                    }
                }
            }),
    );
    let engine = Engine::create(silent_agent(context), json!({})).await.unwrap();

    let result = engine.call_action("flaky", json!({}), None).await.unwrap();
    assert_eq!(result.kind(), &MemoryKind::ActionResult("flaky".into()));
    assert_eq!(result.content(), Some(json!({ "attempt": 3 })));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let chain = engine.chain().await;
    let call = chain
        .iter()
        .find(|m| m.kind() == &MemoryKind::ActionCall)
        .unwrap();
    assert_eq!(terminals_for(&chain, call).len(), 1);
    assert!(engine.errors().await.is_empty());
}

#[tokio::test]
async fn exhausted_retries_record_handler_error() {
    let context = ContextDefinition::new("chat").with_capability(
        Definition::action("broken")
            .with_retry(RetryPolicy::Times(1))
            .with_handler(|_args: Value, _ctx: CallContext| async {
                Err::<Value, _>(HandlerError::new("down"))
            }),
    );
    let engine = Engine::create(silent_agent(context), json!({})).await.unwrap();

    let terminal = engine.call_action("broken", json!({}), None).await.unwrap();
    let record = terminal.error().unwrap();
    assert_eq!(record.name, "HandlerError");
    assert!(record.message.contains("down"));
    assert_eq!(engine.errors().await.len(), 1);
}

// ── Stop ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_aborts_in_flight_call() {
    let started = Arc::new(Notify::new());
    let observed_cancel = Arc::new(AtomicBool::new(false));
    let (signal, flag) = (started.clone(), observed_cancel.clone());
    let context = ContextDefinition::new("chat").with_capability(Definition::action("wait").with_handler(
        move |_args: Value, ctx: CallContext| {
            let (signal, flag) = (signal.clone(), flag.clone());
            async move {
                signal.notify_one();
                ctx.cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Err::<Value, _>(HandlerError::new("cancelled"))
            }
        },
    ));
    let engine = Engine::create(silent_agent(context), json!({})).await.unwrap();
    engine.start().await.unwrap();

    let call = engine.push(Memory::action_call("wait", json!({}))).await.unwrap();
    started.notified().await;
    engine.stop().await;
    engine.settled().await;

    assert!(observed_cancel.load(Ordering::SeqCst));
    assert_eq!(engine.status().await, EngineStatus::Stopped);

    let chain = engine.chain().await;
    let terminals = terminals_for(&chain, &call);
    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].error().unwrap().name, "AbortError");

    let late = engine.push(Memory::action_call("wait", json!({}))).await;
    assert!(matches!(late, Err(Error::Aborted)));
    assert!(matches!(engine.run().await, Err(Error::Aborted)));
}

#[tokio::test]
async fn memories_queued_before_stop_are_never_dispatched() {
    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let context = ContextDefinition::new("chat").with_capability(Definition::action("count").with_handler(
        move |_args: Value, _ctx: CallContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, HandlerError>(Value::Null) }
        },
    ));
    let engine = Engine::create(silent_agent(context), json!({})).await.unwrap();

    engine.push(Memory::action_call("count", json!({}))).await.unwrap();
    engine.stop().await;

    assert!(matches!(engine.start().await, Err(Error::Aborted)));
    engine.settled().await;
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert!(engine.chain().await.is_empty());
}

// ── Settling and host calls ──────────────────────────────────────────────

#[tokio::test]
async fn settled_waits_for_dispatched_calls() {
    let context = ContextDefinition::new("chat").with_capability(Definition::action("slow").with_handler(
        |_args: Value, _ctx: CallContext| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, HandlerError>(json!("done"))
        },
    ));
    let engine = Engine::create(silent_agent(context), json!({})).await.unwrap();
    engine.start().await.unwrap();

    let call = engine.push(Memory::action_call("slow", json!({}))).await.unwrap();
    assert_eq!(engine.pending_calls(), 1);

    engine.settled().await;
    assert_eq!(engine.pending_calls(), 0);
    let chain = engine.chain().await;
    assert_eq!(terminals_for(&chain, &call)[0].content(), Some(json!("done")));
}

#[tokio::test]
async fn await_result_of_unknown_call_is_not_found() {
    let engine = Engine::create(silent_agent(ContextDefinition::new("chat")), json!({}))
        .await
        .unwrap();
    let err = engine
        .await_result(&ravel_core::MemoryId::new())
        .await
        .unwrap_err();
    assert_eq!(err.error_name(), "NotFoundError");
}

#[tokio::test]
async fn handler_issues_nested_call() {
    let context = ContextDefinition::new("chat")
        .with_capability(Definition::action("double").with_handler(
            |args: Value, _ctx: CallContext| async move {
                let n = args["n"].as_i64().unwrap_or(0);
                Ok::<_, HandlerError>(json!(n * 2))
            },
        ))
        .with_capability(Definition::action("quadruple").with_handler(
            |args: Value, ctx: CallContext| async move {
                let twice = ctx.call_action_value("double", args).await?;
                let again = ctx.call_action_value("double", json!({ "n": twice })).await?;
                Ok::<_, HandlerError>(again)
            },
        ));
    let engine = Engine::create(silent_agent(context), json!({})).await.unwrap();

    let result = engine
        .call_action("quadruple", json!({ "n": 3 }), None)
        .await
        .unwrap();
    assert_eq!(result.content(), Some(json!(12)));

    let chain = engine.chain().await;
    let outer = chain
        .iter()
        .find(|m| m.kind() == &MemoryKind::ActionCall && m.name.as_deref() == Some("quadruple"))
        .unwrap();
    let inner: Vec<_> = chain
        .iter()
        .filter(|m| m.kind() == &MemoryKind::ActionCall && m.name.as_deref() == Some("double"))
        .collect();
    assert_eq!(inner.len(), 2);
    assert!(inner.iter().all(|m| m.parent == Some(outer.reference())));
}

#[tokio::test]
async fn nested_call_failure_surfaces_in_outer_handler() {
    let context = ContextDefinition::new("chat").with_capability(Definition::action("outer").with_handler(
        |_args: Value, ctx: CallContext| async move {
            ctx.call_action_value("missing", json!({})).await?;
            Ok::<_, HandlerError>(Value::Null)
        },
    ));
    let engine = Engine::create(silent_agent(context), json!({})).await.unwrap();

    let terminal = engine.call_action("outer", json!({}), None).await.unwrap();
    let record = terminal.error().unwrap();
    assert_eq!(record.name, "HandlerError");
    assert!(record.message.contains("invalid action name: missing"), "{}", record.message);
}

#[tokio::test]
async fn send_rejects_unknown_input() {
    let engine = Engine::create(silent_agent(ContextDefinition::new("chat")), json!({}))
        .await
        .unwrap();
    let err = engine.send("telepathy", json!("hi")).await.unwrap_err();
    assert_eq!(err.error_name(), "NotFoundError");
    assert_eq!(engine.status().await, EngineStatus::Idle);
}

#[tokio::test]
async fn send_routes_input_then_steps() {
    let agent = scripted_agent(
        &["<output name=\"reply\">\"hello back\"</output>"],
        ContextDefinition::new("chat")
            .with_max_steps(1)
            .with_capability(Definition::output("reply")),
    )
    .with_input(Definition::input("message"));
    let engine = Engine::create(agent, json!({})).await.unwrap();

    let chain = engine.send("message", json!("hello")).await.unwrap();
    let input = chain.iter().find(|m| m.kind() == &MemoryKind::Input).unwrap();
    let step = chain.iter().find(|m| m.kind() == &MemoryKind::Step).unwrap();
    assert_eq!(step.children, vec![input.reference()]);

    let output = chain.iter().find(|m| m.kind() == &MemoryKind::Output).unwrap();
    assert_eq!(output.content(), Some(json!("hello back")));
    assert_eq!(output.parent, Some(step.reference()));
}

// ── Composed contexts ────────────────────────────────────────────────────

#[tokio::test]
async fn context_key_targets_composed_child() {
    fn saver(label: &'static str) -> Definition {
        Definition::action("save").with_handler(move |_args: Value, ctx: CallContext| async move {
            ctx.context.write().await.memory["saved_by"] = json!(label);
            Ok::<_, HandlerError>(json!(label))
        })
    }

    let context = ContextDefinition::new("chat")
        .with_max_steps(1)
        .with_capability(saver("chat"))
        .compose(
            ContextDefinition::new("notes").with_capability(saver("notes")),
            json!({ "key": "work" }),
        );
    let agent = scripted_agent(
        &["<action_call name=\"save\" contextKey=\"work\">{}</action_call>"],
        context,
    );
    let engine = Engine::create(agent, json!({})).await.unwrap();
    let chain = engine.run().await.unwrap();

    let results: Vec<_> = chain
        .iter()
        .filter(|m| m.kind() == &MemoryKind::ActionResult("save".into()))
        .collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content(), Some(json!("notes")));

    let child = engine.context_state("notes:work").await.unwrap();
    assert_eq!(child.memory["saved_by"], "notes");
    assert!(engine.context().await.memory.get("saved_by").is_none());
}

#[tokio::test]
async fn invalid_child_args_fail_creation() {
    let child = ContextDefinition::new("notes").with_schema(
        ravel_core::Schema::new(json!({
            "type": "object",
            "required": ["key"]
        }))
        .unwrap(),
    );
    let context = ContextDefinition::new("chat").compose(child, json!({}));
    let err = Engine::create(silent_agent(context), json!({})).await.unwrap_err();
    assert_eq!(err.error_name(), "ParsingError");
}

// ── Persistence ──────────────────────────────────────────────────────────

fn counting_context() -> ContextDefinition {
    ContextDefinition::new("counter")
        .with_max_steps(1)
        .with_key(|args| args["user"].as_str().unwrap_or("anon").to_string())
        .with_on_step(|state, _chain| {
            let turns = state.memory["turns"].as_u64().unwrap_or(0);
            state.memory["turns"] = json!(turns + 1);
        })
}

#[tokio::test]
async fn state_and_chain_survive_a_new_engine() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path().to_path_buf()));

    let first = scripted_agent(&["<think>one</think>"], counting_context()).with_store(store.clone());
    let engine = Engine::create(first, json!({ "user": "alice" })).await.unwrap();
    let chain = engine.run().await.unwrap();
    assert_eq!(engine.context().await.memory["turns"], 1);
    let recorded = chain.len();

    let second = scripted_agent(&["<think>two</think>"], counting_context()).with_store(store.clone());
    let engine = Engine::create(second, json!({ "user": "alice" })).await.unwrap();
    assert_eq!(engine.context().await.memory["turns"], 1);
    assert_eq!(engine.chain().await.len(), recorded);

    engine.run().await.unwrap();
    assert_eq!(engine.context().await.memory["turns"], 2);

    let other = scripted_agent(&[], counting_context()).with_store(store);
    let engine = Engine::create(other, json!({ "user": "bob" })).await.unwrap();
    assert!(engine.context().await.memory.get("turns").is_none());
    assert!(engine.chain().await.is_empty());
}
