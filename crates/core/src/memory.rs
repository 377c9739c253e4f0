//! Memory: the uniform record for everything that happens in a run.
//!
//! Thoughts, inputs, outputs, calls, results, errors, steps and the run
//! itself are all `Memory` values distinguished by [`MemoryKind`]. A memory
//! is created once, accumulates streamed content while its stream element is
//! open, and is finalized when the element closes. Its typed [`Payload`] is
//! only trusted after finalization.

use crate::context::ContextRef;
use crate::error::ErrorRecord;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Label carried by memories the model has not seen yet.
pub const UNPROCESSED: &str = "unprocessed";

/// Globally unique, time-sortable memory identifier (UUID v7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MemoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a memory records. Result kinds carry the capability name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Run,
    Step,
    Thought,
    Input,
    Output,
    ActionCall,
    ActionResult(String),
    ToolCall,
    ToolResult(String),
    Event,
    Error,
}

impl MemoryKind {
    /// Calls are dispatched asynchronously and must end in a terminal memory.
    pub fn is_call(&self) -> bool {
        matches!(self, MemoryKind::ActionCall | MemoryKind::ToolCall)
    }

    /// Kinds the router knows how to handle.
    pub fn is_routable(&self) -> bool {
        matches!(
            self,
            MemoryKind::Input | MemoryKind::Output | MemoryKind::ActionCall | MemoryKind::ToolCall
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MemoryKind::ActionResult(_) | MemoryKind::ToolResult(_) | MemoryKind::Error
        )
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Run => write!(f, "run"),
            MemoryKind::Step => write!(f, "step"),
            MemoryKind::Thought => write!(f, "thought"),
            MemoryKind::Input => write!(f, "input"),
            MemoryKind::Output => write!(f, "output"),
            MemoryKind::ActionCall => write!(f, "action_call"),
            MemoryKind::ActionResult(name) => write!(f, "action_result.{name}"),
            MemoryKind::ToolCall => write!(f, "tool_call"),
            MemoryKind::ToolResult(name) => write!(f, "tool_result.{name}"),
            MemoryKind::Event => write!(f, "event"),
            MemoryKind::Error => write!(f, "error"),
        }
    }
}

impl FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix("action_result.") {
            return Ok(MemoryKind::ActionResult(name.to_string()));
        }
        if let Some(name) = s.strip_prefix("tool_result.") {
            return Ok(MemoryKind::ToolResult(name.to_string()));
        }
        match s {
            "run" => Ok(MemoryKind::Run),
            "step" => Ok(MemoryKind::Step),
            "thought" => Ok(MemoryKind::Thought),
            "input" => Ok(MemoryKind::Input),
            "output" => Ok(MemoryKind::Output),
            "action_call" => Ok(MemoryKind::ActionCall),
            "tool_call" => Ok(MemoryKind::ToolCall),
            "event" => Ok(MemoryKind::Event),
            "error" => Ok(MemoryKind::Error),
            other => Err(format!("unknown memory kind: {other}")),
        }
    }
}

impl Serialize for MemoryKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemoryKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A weak `{kind, id}` reference to another memory in the same chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryRef {
    pub kind: MemoryKind,
    pub id: MemoryId,
}

/// A partial update received before finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Chunk {
    Content(String),
    Data(serde_json::Value),
}

/// The typed content of a memory.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// Not resolved yet: still streaming, or waiting for the router.
    #[default]
    Pending,
    /// Free text (thoughts).
    Text(String),
    /// Schema-validated structured content.
    Data(serde_json::Value),
    /// Terminal failure description (`error` memories).
    Failure(ErrorRecord),
}

/// A single record in a run's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    kind: MemoryKind,
    id: MemoryId,

    /// Logical name (action, output, input or event name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    raw: String,

    #[serde(default)]
    pub payload: Payload,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    chunks: Vec<Chunk>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<MemoryRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MemoryRef>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    labels: BTreeSet<String>,

    /// Attributes parsed off the stream element (`name`, `contextKey`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    done: bool,
}

impl Memory {
    /// Create an open memory of the given kind with a fresh id.
    pub fn new(kind: MemoryKind) -> Self {
        Self {
            kind,
            id: MemoryId::new(),
            name: None,
            timestamp: Utc::now(),
            raw: String::new(),
            payload: Payload::Pending,
            chunks: Vec::new(),
            parent: None,
            children: Vec::new(),
            labels: BTreeSet::new(),
            attributes: BTreeMap::new(),
            metadata: serde_json::Map::new(),
            done: false,
        }
    }

    /// The root memory of a run.
    pub fn run(context: &ContextRef) -> Self {
        let mut memory = Self::new(MemoryKind::Run)
            .with_name(context.name.clone())
            .with_data(serde_json::json!({ "context": context.id }));
        memory.done = true;
        memory
    }

    /// A step memory adopting the memories the model will see this step.
    pub fn step(index: u32, children: Vec<MemoryRef>) -> Self {
        let mut memory = Self::new(MemoryKind::Step).with_data(serde_json::json!({ "index": index }));
        memory.children = children;
        memory
    }

    /// An input with already-known content. Still validated by the router.
    pub fn input(name: impl Into<String>, content: serde_json::Value) -> Self {
        Self::new(MemoryKind::Input)
            .with_name(name)
            .with_data(content)
            .with_label(UNPROCESSED)
    }

    /// An action call issued programmatically rather than parsed from a stream.
    pub fn action_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        let name = name.into();
        let mut memory = Self::new(MemoryKind::ActionCall)
            .with_name(name.clone())
            .with_data(args);
        memory.attributes.insert("name".into(), name);
        memory
    }

    /// A named event pushed by a handler.
    pub fn event(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(MemoryKind::Event).with_name(name).with_data(data)
    }

    /// The terminal success record for a call.
    pub fn result_for(call: &Memory, content: serde_json::Value) -> Self {
        let name = call.name.clone().unwrap_or_default();
        let kind = match call.kind {
            MemoryKind::ToolCall => MemoryKind::ToolResult(name.clone()),
            _ => MemoryKind::ActionResult(name.clone()),
        };
        Self::new(kind)
            .with_name(name)
            .with_parent(call.reference())
            .with_data(content)
    }

    /// The terminal failure record for a memory whose handling failed.
    pub fn failure(source: &Memory, record: ErrorRecord) -> Self {
        let mut memory = Self::new(MemoryKind::Error)
            .with_name(record.name.clone())
            .with_parent(source.reference());
        memory.payload = Payload::Failure(record);
        memory.done = true;
        memory
    }

    // ── Builders ──

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent: MemoryRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.labels.insert(label.to_string());
        self
    }

    /// Set resolved text content and mark the memory done.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.raw = text.clone();
        self.payload = Payload::Text(text);
        self.done = true;
        self
    }

    /// Set resolved structured content and mark the memory done.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.payload = Payload::Data(data);
        self.done = true;
        self
    }

    // ── Accessors ──

    pub fn id(&self) -> &MemoryId {
        &self.id
    }

    pub fn kind(&self) -> &MemoryKind {
        &self.kind
    }

    pub fn reference(&self) -> MemoryRef {
        MemoryRef {
            kind: self.kind.clone(),
            id: self.id.clone(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The trusted content, available only once the memory is done and resolved.
    pub fn content(&self) -> Option<serde_json::Value> {
        if !self.done {
            return None;
        }
        match &self.payload {
            Payload::Pending => None,
            Payload::Text(text) => Some(serde_json::Value::String(text.clone())),
            Payload::Data(value) => Some(value.clone()),
            Payload::Failure(record) => serde_json::to_value(record).ok(),
        }
    }

    pub fn error(&self) -> Option<&ErrorRecord> {
        match &self.payload {
            Payload::Failure(record) => Some(record),
            _ => None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    // ── Streaming updates ──

    /// Append a text delta. Ignored once the memory is done.
    pub fn append_content(&mut self, delta: &str) {
        if self.done || delta.is_empty() {
            return;
        }
        self.raw.push_str(delta);
        self.chunks.push(Chunk::Content(delta.to_string()));
    }

    /// Append a structured delta. Ignored once the memory is done. A `null`
    /// delta carries nothing and is dropped like an empty text delta.
    pub fn append_data(&mut self, delta: serde_json::Value) {
        if self.done || delta.is_null() {
            return;
        }
        self.chunks.push(Chunk::Data(delta));
    }

    /// Mark the owning stream element complete.
    pub fn finalize(&mut self) {
        self.done = true;
    }

    pub fn add_child(&mut self, child: MemoryRef) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    // ── Labels ──

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    pub fn set_label(&mut self, label: &str, on: bool) {
        if on {
            self.labels.insert(label.to_string());
        } else {
            self.labels.remove(label);
        }
    }

    /// Flip a label; returns whether it is now set.
    pub fn toggle_label(&mut self, label: &str) -> bool {
        let on = !self.has_label(label);
        self.set_label(label, on);
        on
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}
