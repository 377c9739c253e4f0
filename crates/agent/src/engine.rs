//! The run engine: drives one root context (plus composed children)
//! through model steps and routes everything the model produces.
//!
//! The cycle is:
//! 1. Resolve the step's capabilities from every active context
//! 2. Adopt unprocessed memories into a `step` memory and render the prompt
//! 3. Stream the model response through the stream projector; inputs and
//!    outputs are routed inline, calls are dispatched as their own tasks
//! 4. Wait for dispatched work to settle, persist snapshots, run hooks
//! 5. Continue while a hook asks for it or unprocessed memories remain
//!
//! Only the engine mutates the chain. Handlers go through [`CallContext`],
//! which reaches back here via the [`Dispatcher`] impl.

use crate::agent::Agent;
use crate::pending::PendingWork;
use crate::prompt::{PromptInput, RenderedContext};
use crate::router::{Dispatched, Router};
use crate::task::{TaskFailure, TaskRunner};
use async_trait::async_trait;
use ravel_core::call::{CallContext, Dispatcher};
use ravel_core::capability::{Capabilities, CapabilityRef};
use ravel_core::chain::Chain;
use ravel_core::context::{ContextDefinition, ContextHandle, ContextRef, ContextState};
use ravel_core::error::{CallError, Error, ErrorRecord, ModelError, NotFoundError, Result};
use ravel_core::event::RunEvent;
use ravel_core::memory::{Memory, MemoryId, MemoryKind, MemoryRef, UNPROCESSED};
use ravel_core::model::{ModelRequest, ModelStream};
use ravel_stream::{MemoryUpdate, StreamProjector};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ── Types ─────────────────────────────────────────────────────────────────

/// Lifecycle of an engine: `Idle → Running → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Created; pushed memories are queued until `start`.
    Idle,
    Running,
    /// Stopped; new work is rejected.
    Stopped,
}

/// An instantiated context with its live state.
struct LiveContext {
    definition: Arc<ContextDefinition>,
    reference: ContextRef,
    handle: ContextHandle,
}

/// Mutable run state, guarded by a single lock.
struct RunState {
    status: EngineStatus,
    chain: Chain,
    /// Ids already routed (or recorded as final); pushes of these are ignored.
    handled: HashSet<MemoryId>,
    /// Memories pushed while idle.
    queue: Vec<Memory>,
    errors: Vec<ErrorRecord>,
    step: u32,
    capabilities: Capabilities,
    /// Deferred completion per dispatched call.
    calls: HashMap<MemoryId, watch::Sender<Option<Memory>>>,
    /// Stream element numbering continues across steps.
    next_index: usize,
    run: Option<MemoryRef>,
}

struct EngineInner {
    agent: Agent,
    run_id: MemoryId,
    root: LiveContext,
    children: Vec<LiveContext>,
    inputs: Vec<CapabilityRef>,
    router: Router,
    runner: TaskRunner,
    pending: PendingWork,
    cancel: CancellationToken,
    state: Mutex<RunState>,
}

/// A cheaply cloneable handle to one run.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

// ── Construction ──────────────────────────────────────────────────────────

impl Engine {
    /// Instantiate the agent's root context (and composed children) with
    /// `args`, restoring persisted state and working memory when present.
    pub async fn create(agent: Agent, args: Value) -> Result<Self> {
        let mut instantiated = Vec::new();
        instantiate_tree(&agent.context, args, &mut instantiated)?;

        let store = agent.store.clone();
        let mut live = Vec::with_capacity(instantiated.len());
        for (definition, mut state) in instantiated {
            if let Some(saved) = store.load_context(&state.id).await? {
                debug!(context = %state.id, "Restoring context state");
                state.memory = saved.memory;
                state.settings = saved.settings;
            }
            live.push(LiveContext {
                definition,
                reference: state.reference(),
                handle: Arc::new(RwLock::new(state)),
            });
        }

        let mut live = live.into_iter();
        let root = live
            .next()
            .ok_or_else(|| Error::Internal("no root context".into()))?;
        let children: Vec<LiveContext> = live.collect();

        let restored = store.load_working_memory(&root.reference.id).await?;
        let handled: HashSet<MemoryId> = restored.iter().map(|m| m.id().clone()).collect();
        let chain = Chain::from(restored);

        let inputs = agent
            .inputs
            .iter()
            .map(|definition| CapabilityRef {
                definition: definition.clone(),
                owner: root.reference.clone(),
            })
            .collect();

        let config = &agent.config;
        let runner = TaskRunner::new(config.retry_backoff());
        let router = Router::new(runner.clone())
            .with_default_timeout(config.call_timeout())
            .with_default_attempts(config.default_retry_attempts);

        let run_id = MemoryId::new();
        info!(
            run_id = %run_id,
            context = %root.reference.id,
            children = children.len(),
            restored = chain.len(),
            store = store.name(),
            "Engine created"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                agent,
                run_id,
                root,
                children,
                inputs,
                router,
                runner,
                pending: PendingWork::new(),
                cancel: CancellationToken::new(),
                state: Mutex::new(RunState {
                    status: EngineStatus::Idle,
                    chain,
                    handled,
                    queue: Vec::new(),
                    errors: Vec::new(),
                    step: 0,
                    capabilities: Capabilities::default(),
                    calls: HashMap::new(),
                    next_index: 0,
                    run: None,
                }),
            }),
        })
    }
}

fn instantiate_tree(
    definition: &Arc<ContextDefinition>,
    args: Value,
    out: &mut Vec<(Arc<ContextDefinition>, ContextState)>,
) -> Result<()> {
    let state = definition.instantiate(args)?;
    out.push((definition.clone(), state));
    for (child, child_args) in definition.children() {
        instantiate_tree(child, child_args.clone(), out)?;
    }
    Ok(())
}

// ── Lifecycle ─────────────────────────────────────────────────────────────

impl Engine {
    /// Enter the running state: record the `run` memory and flush memories
    /// queued while idle. Does not step; see [`Engine::run`].
    pub async fn start(&self) -> Result<()> {
        let queued = {
            let mut st = self.inner.state.lock().await;
            match st.status {
                EngineStatus::Stopped => return Err(Error::Aborted),
                EngineStatus::Running => return Ok(()),
                EngineStatus::Idle => {}
            }
            st.status = EngineStatus::Running;

            let run = Memory::run(&self.inner.root.reference);
            st.run = Some(run.reference());
            st.handled.insert(run.id().clone());
            st.chain.append(run.clone());
            self.publish(RunEvent::RunStarted {
                run_id: self.inner.run_id.clone(),
                context: self.inner.root.reference.id.clone(),
            });
            self.publish(RunEvent::MemoryCreated { memory: run });
            std::mem::take(&mut st.queue)
        };

        info!(run_id = %self.inner.run_id, queued = queued.len(), "Run started");
        self.prepare_step().await;
        for memory in queued {
            self.push(memory).await?;
        }
        Ok(())
    }

    /// Start if idle, then step until nothing is left to do, the step budget
    /// is spent, or the run is stopped. Returns the chain.
    ///
    /// Step failures end the loop and are recorded in [`Engine::errors`];
    /// they are not returned as `Err`.
    pub async fn run(&self) -> Result<Vec<Memory>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Aborted);
        }
        self.start().await?;

        let budget = self.inner.agent.max_steps();
        let mut steps = 0;
        loop {
            if steps >= budget {
                info!(run_id = %self.inner.run_id, budget, "Step budget reached");
                break;
            }
            steps += 1;

            match self.step().await {
                Ok(()) => {}
                Err(Error::Aborted) => {
                    info!(run_id = %self.inner.run_id, "Run aborted");
                    break;
                }
                Err(e) => {
                    warn!(run_id = %self.inner.run_id, error = %e, "Step failed");
                    let mut st = self.inner.state.lock().await;
                    let source = st.chain.of_kind(&MemoryKind::Step).last().map(Memory::reference);
                    st.errors.push(ErrorRecord::from_error(&e, source));
                    break;
                }
            }

            if !self.should_continue().await {
                break;
            }
        }

        self.inner.pending.settled().await;
        self.persist().await;

        let (chain, errors) = {
            let st = self.inner.state.lock().await;
            (st.chain.to_vec(), st.errors.len())
        };
        self.publish(RunEvent::RunFinished {
            run_id: self.inner.run_id.clone(),
            steps,
            errors,
        });
        info!(run_id = %self.inner.run_id, steps, errors, memories = chain.len(), "Run finished");
        Ok(chain)
    }

    /// Push an input and run until settled.
    pub async fn send(&self, name: &str, content: Value) -> Result<Vec<Memory>> {
        if self.inner.agent.input(name).is_none() {
            return Err(NotFoundError::new("input", name).into());
        }
        self.start().await?;
        self.push(Memory::input(name, content)).await?;
        self.run().await
    }

    /// Stop the run and cancel everything in flight. Memories still queued
    /// are dropped; terminal records of in-flight calls are still recorded.
    pub async fn stop(&self) {
        {
            let mut st = self.inner.state.lock().await;
            if st.status != EngineStatus::Stopped {
                let dropped = st.queue.len();
                st.queue.clear();
                st.status = EngineStatus::Stopped;
                info!(run_id = %self.inner.run_id, dropped, "Run stopped");
            }
        }
        self.inner.cancel.cancel();
    }

    /// Whether another step is wanted: a context hook asks for one, or
    /// unprocessed memories remain.
    pub async fn should_continue(&self) -> bool {
        if self.inner.cancel.is_cancelled() {
            return false;
        }
        let states = self.snapshot_contexts().await;
        let st = self.inner.state.lock().await;
        if st.status == EngineStatus::Stopped {
            return false;
        }
        let requested = self
            .contexts()
            .zip(&states)
            .any(|(live, state)| live.definition.should_continue(state, &st.chain));
        requested || st.chain.with_label(UNPROCESSED).next().is_some()
    }
}

// ── Steps ─────────────────────────────────────────────────────────────────

impl Engine {
    /// Run a single step. A model failure fails the step; call failures
    /// never do.
    pub async fn step(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Aborted);
        }
        self.start().await?;
        self.prepare_step().await;

        let rendered: Vec<RenderedContext> = self
            .contexts()
            .zip(self.snapshot_contexts().await)
            .map(|(live, state)| RenderedContext {
                instructions: live.definition.instructions(&state),
                state,
            })
            .collect();

        let (step_ref, index, prompt, start_index) = {
            let mut st = self.inner.state.lock().await;
            st.step += 1;
            let index = st.step;

            let mut adopted = Vec::new();
            for memory in st.chain.iter_mut() {
                if memory.has_label(UNPROCESSED) {
                    memory.set_label(UNPROCESSED, false);
                    adopted.push(memory.reference());
                }
            }

            let mut step = Memory::step(index, adopted.clone());
            step.parent = st.run.clone();
            let prompt = self.inner.agent.renderer.render(&PromptInput {
                step: index,
                contexts: &rendered,
                capabilities: &st.capabilities,
                inputs: &self.inner.inputs,
                chain: &st.chain,
                unprocessed: &adopted,
            });

            let step_ref = step.reference();
            st.handled.insert(step.id().clone());
            st.chain.append(step.clone());
            self.publish(RunEvent::StepStarted {
                run_id: self.inner.run_id.clone(),
                step: index,
            });
            self.publish(RunEvent::MemoryCreated { memory: step });
            (step_ref, index, prompt, st.next_index)
        };

        info!(run_id = %self.inner.run_id, step = index, "Step started");

        let mut stream = self.open_stream(index, prompt).await?;
        let outcome = self.handle_stream(&mut stream, step_ref.clone(), start_index).await;

        // Dispatch started by this step (including nested calls) must finish
        // before the step is considered done.
        self.inner.pending.settled().await;
        outcome?;

        let response = stream.text_response().await?;
        {
            let mut st = self.inner.state.lock().await;
            if let Some(step) = st.chain.get_mut(&step_ref.id) {
                step.metadata.insert("response".into(), Value::String(response));
            }
        }

        self.persist().await;
        self.run_step_hooks().await;

        self.publish(RunEvent::StepFinished {
            run_id: self.inner.run_id.clone(),
            step: index,
        });
        debug!(run_id = %self.inner.run_id, step = index, "Step finished");
        Ok(())
    }

    /// Resolve capabilities for the coming step from every active context.
    async fn prepare_step(&self) {
        let states = self.snapshot_contexts().await;
        let mut capabilities = Capabilities::default();
        for (live, state) in self.contexts().zip(&states) {
            live.definition.resolve_capabilities(state, &mut capabilities);
        }
        debug!(
            actions = capabilities.actions.len(),
            outputs = capabilities.outputs.len(),
            tools = capabilities.tools.len(),
            "Capabilities resolved"
        );
        self.inner.state.lock().await.capabilities = capabilities;
    }

    /// Ask the model for this step's stream.
    async fn open_stream(&self, step: u32, prompt: String) -> Result<ModelStream> {
        let request = ModelRequest {
            run_id: self.inner.run_id.clone(),
            context: self.inner.root.reference.clone(),
            step,
            prompt,
            stop: Vec::new(),
        };
        let model = &self.inner.agent.model;
        let cancel = &self.inner.cancel;
        debug!(model = model.name(), step, prompt_len = request.prompt.len(), "Requesting model stream");

        let opened = self
            .inner
            .runner
            .run("model", None, cancel, |_, _| false, |_| {
                model.stream(request.clone(), cancel.clone())
            })
            .await;

        match opened {
            Ok(stream) => Ok(stream),
            Err(TaskFailure::Aborted) => Err(Error::Aborted),
            Err(TaskFailure::Failed(e)) => Err(Error::Model(e)),
            Err(TaskFailure::TimedOut(limit)) => Err(Error::Model(ModelError::Timeout(format!(
                "no stream after {}ms",
                limit.as_millis()
            )))),
        }
    }

    /// Drain the model stream through the projector, applying every update
    /// as it arrives. Elements left open by a failed stream are recorded but
    /// not routed.
    async fn handle_stream(
        &self,
        stream: &mut ModelStream,
        step: MemoryRef,
        start_index: usize,
    ) -> Result<()> {
        let mut projector = StreamProjector::new(self.inner.agent.parser.clone())
            .with_parent(step)
            .starting_at(start_index);

        while let Some(chunk) = stream.next().await {
            for update in projector.push(&chunk) {
                self.apply_update(update, true).await?;
            }
        }

        let failed = stream.error().is_some();
        for update in projector.finish() {
            self.apply_update(update, !failed).await?;
        }
        self.inner.state.lock().await.next_index = projector.next_index();

        match stream.error() {
            None => Ok(()),
            Some(_) if self.inner.cancel.is_cancelled() => Err(Error::Aborted),
            Some(e) => Err(Error::Model(e.clone())),
        }
    }

    async fn apply_update(&self, update: MemoryUpdate, route: bool) -> Result<()> {
        match update {
            MemoryUpdate::Created(memory) => {
                let mut st = self.inner.state.lock().await;
                if st.chain.upsert(memory.clone()) {
                    self.publish(RunEvent::MemoryCreated { memory });
                }
            }
            MemoryUpdate::Appended { id, delta } => {
                let mut st = self.inner.state.lock().await;
                if let Some(memory) = st.chain.get_mut(&id) {
                    memory.append_content(&delta);
                }
                self.publish(RunEvent::ContentAppended { id, delta });
            }
            MemoryUpdate::Finalized(memory) if route => {
                self.push(memory).await?;
            }
            MemoryUpdate::Finalized(memory) => {
                debug!(memory_id = %memory.id(), kind = %memory.kind(), "Recording unrouted element");
                let mut st = self.inner.state.lock().await;
                st.handled.insert(memory.id().clone());
                st.chain.upsert(memory.clone());
                self.publish(RunEvent::MemoryFinalized { memory });
            }
        }
        Ok(())
    }

    /// Save every context snapshot and the working memory. Failures are
    /// logged and recorded; they never fail the step.
    async fn persist(&self) {
        let store = &self.inner.agent.store;
        let states = self.snapshot_contexts().await;
        let chain = self.inner.state.lock().await.chain.to_vec();

        let mut failures = Vec::new();
        let saves = states.iter().map(|state| store.save_context(state));
        for result in futures::future::join_all(saves).await {
            if let Err(e) = result {
                failures.push(e);
            }
        }
        if let Err(e) = store
            .save_working_memory(&self.inner.root.reference.id, &chain)
            .await
        {
            failures.push(e);
        }

        if failures.is_empty() {
            debug!(store = store.name(), contexts = states.len(), memories = chain.len(), "Snapshots saved");
            return;
        }
        let mut st = self.inner.state.lock().await;
        for e in failures {
            warn!(store = store.name(), error = %e, "Snapshot save failed");
            st.errors.push(ErrorRecord::from_error(&Error::Store(e), None));
        }
    }

    async fn run_step_hooks(&self) {
        let chain = self.inner.state.lock().await.chain.clone();
        for live in self.contexts() {
            let mut state = live.handle.write().await;
            live.definition.on_step(&mut state, &chain);
        }
    }
}

// ── Routing ───────────────────────────────────────────────────────────────

impl Engine {
    /// Push a memory into the run.
    ///
    /// While idle the memory is queued. Once stopped, pushes fail with
    /// [`Error::Aborted`]. A memory id is routed at most once; repeated
    /// pushes return the recorded memory. Finalized inputs and outputs are
    /// routed before this returns; calls are dispatched as their own tasks.
    pub async fn push(&self, memory: Memory) -> Result<Memory> {
        let routable = {
            let mut st = self.inner.state.lock().await;
            match st.status {
                EngineStatus::Idle => {
                    debug!(memory_id = %memory.id(), kind = %memory.kind(), "Queued until start");
                    st.queue.push(memory.clone());
                    return Ok(memory);
                }
                EngineStatus::Stopped => return Err(Error::Aborted),
                EngineStatus::Running => {}
            }

            if st.handled.contains(memory.id()) {
                debug!(memory_id = %memory.id(), "Ignoring repeated push");
                return Ok(st.chain.get(memory.id()).cloned().unwrap_or(memory));
            }

            if st.chain.upsert(memory.clone()) {
                self.publish(RunEvent::MemoryCreated {
                    memory: memory.clone(),
                });
            } else if memory.is_done() {
                self.publish(RunEvent::MemoryFinalized {
                    memory: memory.clone(),
                });
            }

            if !memory.is_done() {
                return Ok(memory);
            }
            st.handled.insert(memory.id().clone());

            let routable = memory.kind().is_routable();
            if routable && memory.kind().is_call() {
                let (tx, _) = watch::channel(None);
                st.calls.insert(memory.id().clone(), tx);
            }
            routable
        };

        if !routable {
            return Ok(memory);
        }

        if memory.kind().is_call() {
            let guard = self.inner.pending.begin();
            let engine = self.clone();
            let call = memory.clone();
            tokio::spawn(async move {
                let _guard = guard;
                engine.route(call).await;
            });
            return Ok(memory);
        }

        Ok(self.route(memory).await)
    }

    /// Resolve, dispatch and apply one memory. Returns the updated source.
    async fn route(&self, memory: Memory) -> Memory {
        let resolved = {
            let st = self.inner.state.lock().await;
            self.inner
                .router
                .resolve(&memory, &st.capabilities, &self.inner.inputs)
        };

        let dispatched = match resolved {
            Ok(capability) => {
                debug!(
                    memory_id = %memory.id(),
                    kind = %memory.kind(),
                    name = capability.name(),
                    owner = %capability.owner,
                    "Dispatching"
                );
                let ctx = self.call_context(memory.clone(), &capability.owner);
                self.inner.router.dispatch(memory, &capability, ctx).await
            }
            Err(e) => {
                warn!(memory_id = %memory.id(), kind = %memory.kind(), error = %e, "No handler");
                let terminal = Router::reject(&memory, &CallError::from(e));
                Dispatched {
                    source: memory,
                    terminal: Some(terminal),
                }
            }
        };

        self.apply(dispatched).await
    }

    /// Record a dispatch outcome. Works after `stop` so in-flight calls still
    /// get their terminal record.
    async fn apply(&self, dispatched: Dispatched) -> Memory {
        let Dispatched { source, terminal } = dispatched;
        let mut st = self.inner.state.lock().await;
        st.chain.upsert(source.clone());

        let Some(mut terminal) = terminal else {
            return source;
        };
        if st.chain.terminal_for(source.id()).is_some() {
            warn!(memory_id = %source.id(), "Dropping second terminal record");
            return source;
        }

        terminal.set_label(UNPROCESSED, true);
        if let Some(record) = terminal.error().cloned() {
            st.errors.push(record.clone());
            self.publish(RunEvent::CallFailed {
                call: source.reference(),
                error: record,
            });
        }
        st.handled.insert(terminal.id().clone());
        st.chain.append(terminal.clone());
        self.publish(RunEvent::MemoryCreated {
            memory: terminal.clone(),
        });
        // Later waiters find the terminal in the chain
        if let Some(tx) = st.calls.remove(source.id()) {
            tx.send_replace(Some(terminal));
        }
        source
    }

    fn call_context(&self, memory: Memory, owner: &ContextRef) -> CallContext {
        let handle = self
            .contexts()
            .find(|live| live.reference.id == owner.id)
            .unwrap_or(&self.inner.root)
            .handle
            .clone();
        CallContext::new(
            memory,
            handle,
            owner.clone(),
            self.inner.cancel.clone(),
            self.inner.run_id.clone(),
            Arc::new(self.clone()),
        )
    }

    /// Issue an action call and wait for its terminal memory.
    pub async fn call_action(
        &self,
        name: &str,
        args: Value,
        parent: Option<MemoryRef>,
    ) -> Result<Memory> {
        self.start().await?;
        let mut memory = Memory::action_call(name, args);
        memory.parent = parent;
        let id = memory.id().clone();
        self.push(memory).await?;
        self.await_result(&id).await
    }

    /// Wait for the terminal memory (result or error) of a dispatched call.
    pub async fn await_result(&self, id: &MemoryId) -> Result<Memory> {
        let mut rx = {
            let st = self.inner.state.lock().await;
            if let Some(terminal) = st.chain.terminal_for(id) {
                return Ok(terminal.clone());
            }
            match st.calls.get(id) {
                Some(tx) => tx.subscribe(),
                None => return Err(NotFoundError::new("call", id.as_str()).into()),
            }
        };
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Aborted)?;
        (*settled)
            .clone()
            .ok_or_else(|| Error::Internal("call settled without a terminal memory".into()))
    }

    /// Record an `event` memory and publish it.
    pub async fn emit(&self, name: &str, data: Value, parent: Option<MemoryRef>) -> Result<MemoryRef> {
        let mut memory = Memory::event(name, data.clone());
        memory.parent = parent;
        let reference = memory.reference();
        {
            let mut st = self.inner.state.lock().await;
            st.handled.insert(memory.id().clone());
            st.chain.append(memory.clone());
        }
        debug!(name, memory_id = %reference.id, "Event emitted");
        self.publish(RunEvent::MemoryCreated { memory });
        self.publish(RunEvent::Custom {
            name: name.to_string(),
            data,
        });
        Ok(reference)
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────

impl Engine {
    pub fn run_id(&self) -> &MemoryId {
        &self.inner.run_id
    }

    pub fn agent(&self) -> &Agent {
        &self.inner.agent
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RunEvent>> {
        self.inner.agent.events.subscribe()
    }

    pub async fn status(&self) -> EngineStatus {
        self.inner.state.lock().await.status
    }

    pub async fn chain(&self) -> Vec<Memory> {
        self.inner.state.lock().await.chain.to_vec()
    }

    /// Errors recorded during the run: call failures, step failures and
    /// snapshot failures.
    pub async fn errors(&self) -> Vec<ErrorRecord> {
        self.inner.state.lock().await.errors.clone()
    }

    /// Every action and tool result recorded so far.
    pub async fn results(&self) -> Vec<Memory> {
        let st = self.inner.state.lock().await;
        st.chain
            .iter()
            .filter(|m| matches!(m.kind(), MemoryKind::ActionResult(_) | MemoryKind::ToolResult(_)))
            .cloned()
            .collect()
    }

    /// Snapshot of the root context state.
    pub async fn context(&self) -> ContextState {
        self.inner.root.handle.read().await.clone()
    }

    /// Snapshot of any active context by id.
    pub async fn context_state(&self, id: &str) -> Option<ContextState> {
        let live = self.contexts().find(|live| live.reference.id == id)?;
        Some(live.handle.read().await.clone())
    }

    /// Number of dispatched calls still running.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.count()
    }

    /// Wait until no dispatched call is running.
    pub async fn settled(&self) {
        self.inner.pending.settled().await
    }

    fn contexts(&self) -> impl Iterator<Item = &LiveContext> {
        std::iter::once(&self.inner.root).chain(self.inner.children.iter())
    }

    async fn snapshot_contexts(&self) -> Vec<ContextState> {
        let mut states = Vec::with_capacity(1 + self.inner.children.len());
        for live in self.contexts() {
            states.push(live.handle.read().await.clone());
        }
        states
    }

    fn publish(&self, event: RunEvent) {
        self.inner.agent.events.publish(event);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("run_id", &self.inner.run_id)
            .field("context", &self.inner.root.reference.id)
            .field("children", &self.inner.children.len())
            .finish()
    }
}

#[async_trait]
impl Dispatcher for Engine {
    async fn push(&self, memory: Memory) -> Result<Memory> {
        Engine::push(self, memory).await
    }

    async fn emit(&self, name: &str, data: Value, parent: Option<MemoryRef>) -> Result<MemoryRef> {
        Engine::emit(self, name, data, parent).await
    }

    async fn call_action(&self, name: &str, args: Value, parent: Option<MemoryRef>) -> Result<Memory> {
        Engine::call_action(self, name, args, parent).await
    }

    async fn working_memory(&self) -> Vec<Memory> {
        self.chain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ravel_core::capability::Definition;
    use ravel_core::model::ScriptedModel;
    use ravel_core::{HandlerError, Schema};
    use serde_json::json;

    fn agent(responses: &[&str], context: ContextDefinition) -> Agent {
        Agent::new(Arc::new(ScriptedModel::new(responses.iter().copied())), context)
    }

    #[tokio::test]
    async fn idle_push_is_queued_until_start() {
        let context = ContextDefinition::new("chat");
        let engine = Engine::create(agent(&[], context), json!({})).await.unwrap();
        let event = Memory::event("ping", json!({}));
        engine.push(event.clone()).await.unwrap();
        assert!(engine.chain().await.is_empty());

        engine.start().await.unwrap();
        let chain = engine.chain().await;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].kind(), &MemoryKind::Run);
        assert_eq!(chain[1].id(), event.id());
    }

    #[tokio::test]
    async fn step_adopts_unprocessed_memories() {
        let context = ContextDefinition::new("chat").with_max_steps(1);
        let agent = agent(&["<think>ok</think>"], context).with_input(Definition::input("message"));
        let engine = Engine::create(agent, json!({})).await.unwrap();

        let chain = engine.send("message", json!("hello")).await.unwrap();
        let input = chain.iter().find(|m| m.kind() == &MemoryKind::Input).unwrap();
        let step = chain.iter().find(|m| m.kind() == &MemoryKind::Step).unwrap();
        assert_eq!(step.children, vec![input.reference()]);
        assert!(!input.has_label(UNPROCESSED));
        assert_eq!(step.metadata["response"], "<think>ok</think>");
    }

    #[tokio::test]
    async fn invalid_context_args_fail_creation() {
        let context = ContextDefinition::new("chat").with_schema(
            Schema::new(json!({ "type": "object", "required": ["user"] })).unwrap(),
        );
        let err = Engine::create(agent(&[], context), json!({})).await.unwrap_err();
        assert_eq!(err.error_name(), "ParsingError");
    }

    #[tokio::test]
    async fn model_failure_is_recorded_not_returned() {
        let context = ContextDefinition::new("chat");
        let engine = Engine::create(agent(&[], context), json!({})).await.unwrap();
        let chain = engine.run().await.unwrap();
        assert!(chain.iter().any(|m| m.kind() == &MemoryKind::Step));
        let errors = engine.errors().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].name, "ModelError");
    }

    #[tokio::test]
    async fn settled_calls_release_their_waiters() {
        let context = ContextDefinition::new("chat").with_max_steps(1).with_capability(
            Definition::action("echo").with_handler(|args: Value, _ctx: CallContext| async move {
                Ok::<_, HandlerError>(args)
            }),
        );
        let engine = Engine::create(
            agent(&["<action_call name=\"echo\">{\"n\": 1}</action_call>"], context),
            json!({}),
        )
        .await
        .unwrap();

        let chain = engine.run().await.unwrap();
        assert!(engine.inner.state.lock().await.calls.is_empty());

        let call = chain.iter().find(|m| m.kind() == &MemoryKind::ActionCall).unwrap();
        let terminal = engine.await_result(call.id()).await.unwrap();
        assert_eq!(terminal.content(), Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn handler_can_emit_events() {
        let context = ContextDefinition::new("chat").with_max_steps(1).with_capability(
            Definition::action("notify").with_handler(|_args: Value, ctx: CallContext| async move {
                ctx.emit("notified", json!({ "ok": true })).await?;
                Ok::<_, HandlerError>(Value::Null)
            }),
        );
        let engine = Engine::create(
            agent(&["<action_call name=\"notify\">{}</action_call>"], context),
            json!({}),
        )
        .await
        .unwrap();
        let mut events = engine.subscribe();

        let chain = engine.run().await.unwrap();
        let event = chain.iter().find(|m| m.kind() == &MemoryKind::Event).unwrap();
        assert_eq!(event.name.as_deref(), Some("notified"));

        let mut saw_custom = false;
        while let Ok(e) = events.try_recv() {
            if let RunEvent::Custom { name, .. } = e.as_ref() {
                saw_custom = name == "notified";
            }
        }
        assert!(saw_custom);
    }
}
