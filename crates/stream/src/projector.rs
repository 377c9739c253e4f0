//! Projection of stream elements onto memories.
//!
//! Each mapped element becomes one [`Memory`], created as soon as its start
//! tag is seen, grown chunk by chunk, and finalized on its end. Updates are
//! reported as [`MemoryUpdate`]s so the engine can publish them while the
//! model is still streaming.

use crate::element::{ElementChunk, ElementTracker, StreamElement};
use crate::parser::{ParserOptions, StreamParser};
use ravel_core::memory::{Memory, MemoryId, MemoryKind, MemoryRef, Payload};
use std::collections::{BTreeMap, HashMap};

/// Fixed tag to memory kind table.
pub fn kind_for_tag(tag: &str) -> Option<MemoryKind> {
    match tag {
        "think" | "thinking" | "reasoning" => Some(MemoryKind::Thought),
        "action_call" => Some(MemoryKind::ActionCall),
        "tool_call" => Some(MemoryKind::ToolCall),
        "output" => Some(MemoryKind::Output),
        _ => None,
    }
}

/// Transparent wrapper tags; dropped without a diagnostic.
const WRAPPER_TAGS: &[&str] = &["response"];

#[derive(Debug, Clone, PartialEq)]
pub enum MemoryUpdate {
    Created(Memory),
    Appended { id: MemoryId, delta: String },
    Finalized(Memory),
}

impl MemoryUpdate {
    pub fn id(&self) -> &MemoryId {
        match self {
            MemoryUpdate::Created(m) | MemoryUpdate::Finalized(m) => m.id(),
            MemoryUpdate::Appended { id, .. } => id,
        }
    }
}

#[derive(Debug, Default)]
pub struct Projector {
    parent: Option<MemoryRef>,
    open: HashMap<usize, Memory>,
}

impl Projector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parent every projected memory to `parent` (the current step).
    pub fn with_parent(mut self, parent: MemoryRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Create the memory for `index` on first sight; on repeat, merge the
    /// attributes into the existing one. Returns whether it was created.
    pub fn upsert_memory(
        &mut self,
        index: usize,
        kind: MemoryKind,
        attributes: &BTreeMap<String, String>,
    ) -> (&mut Memory, bool) {
        let created = !self.open.contains_key(&index);
        let parent = self.parent.clone();
        let memory = self.open.entry(index).or_insert_with(|| {
            let mut memory = Memory::new(kind);
            memory.parent = parent;
            memory
        });
        for (key, value) in attributes {
            memory.attributes.insert(key.clone(), value.clone());
        }
        if let Some(name) = attributes.get("name") {
            memory.name = Some(name.clone());
        }
        (memory, created)
    }

    pub fn handle_chunk(&mut self, chunk: ElementChunk) -> Vec<MemoryUpdate> {
        match chunk {
            ElementChunk::Start { element } => self.start(element),
            ElementChunk::Content { path, delta } => {
                let target = path.iter().rev().find(|i| self.open.contains_key(i));
                match target.and_then(|i| self.open.get_mut(i)) {
                    Some(memory) => {
                        memory.append_content(&delta);
                        vec![MemoryUpdate::Appended {
                            id: memory.id().clone(),
                            delta,
                        }]
                    }
                    None => Vec::new(),
                }
            }
            ElementChunk::End { element, forced } => match self.open.remove(&element.index) {
                Some(memory) => vec![MemoryUpdate::Finalized(finalize(memory, &element, forced))],
                None => Vec::new(),
            },
        }
    }

    fn start(&mut self, element: StreamElement) -> Vec<MemoryUpdate> {
        let Some(kind) = kind_for_tag(&element.tag) else {
            if !WRAPPER_TAGS.contains(&element.tag.as_str()) {
                tracing::debug!(tag = %element.tag, index = element.index, "Dropping element with no memory kind");
            }
            return Vec::new();
        };

        let (memory, created) = self.upsert_memory(element.index, kind, &element.attributes);
        memory.metadata.insert(
            "stream".into(),
            serde_json::json!({ "index": element.index, "tag": element.tag, "depth": element.depth }),
        );
        let snapshot = memory.clone();

        let mut updates = Vec::new();
        if created {
            updates.push(MemoryUpdate::Created(snapshot));
        }
        if element.done {
            if let Some(memory) = self.open.remove(&element.index) {
                updates.push(MemoryUpdate::Finalized(finalize(memory, &element, false)));
            }
        }
        updates
    }
}

fn finalize(mut memory: Memory, element: &StreamElement, forced: bool) -> Memory {
    if forced {
        if let Some(serde_json::Value::Object(stream)) = memory.metadata.get_mut("stream") {
            stream.insert("forced_close".into(), serde_json::Value::Bool(true));
        }
        tracing::debug!(tag = %element.tag, index = element.index, "Element force-closed");
    }
    if *memory.kind() == MemoryKind::Thought {
        memory.payload = Payload::Text(memory.raw().to_string());
    }
    memory.finalize();
    memory
}

/// Parser, tracker and projector behind one `push` / `finish` pair.
#[derive(Debug)]
pub struct StreamProjector {
    parser: StreamParser,
    tracker: ElementTracker,
    projector: Projector,
}

impl StreamProjector {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            parser: StreamParser::new(options),
            tracker: ElementTracker::new(),
            projector: Projector::new(),
        }
    }

    pub fn with_parent(mut self, parent: MemoryRef) -> Self {
        self.projector = self.projector.with_parent(parent);
        self
    }

    /// Continue element numbering from a previous stream in the same run.
    pub fn starting_at(mut self, index: usize) -> Self {
        self.tracker = ElementTracker::starting_at(index);
        self
    }

    pub fn next_index(&self) -> usize {
        self.tracker.next_index()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<MemoryUpdate> {
        let events = self.parser.push(chunk);
        self.project(events)
    }

    /// Flush the parser and force-close whatever is still open.
    pub fn finish(&mut self) -> Vec<MemoryUpdate> {
        let events = self.parser.finish();
        let mut updates = self.project(events);
        for chunk in self.tracker.finish() {
            updates.extend(self.projector.handle_chunk(chunk));
        }
        updates
    }

    fn project(&mut self, events: Vec<crate::parser::ParseEvent>) -> Vec<MemoryUpdate> {
        let mut updates = Vec::new();
        for event in events {
            for chunk in self.tracker.handle(event) {
                updates.extend(self.projector.handle_chunk(chunk));
            }
        }
        updates
    }
}

impl Default for StreamProjector {
    fn default() -> Self {
        Self::new(ParserOptions::default())
    }
}
