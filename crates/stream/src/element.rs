//! Element tracking: parser events to indexed stream elements.
//!
//! Every structural element gets a monotonically increasing `index` so that
//! content and end chunks can be correlated with the element they belong to.
//! Mismatched closes are recovered by force-closing the elements above the
//! matching ancestor.

use crate::parser::ParseEvent;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamElement {
    pub index: usize,
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    /// Text received directly inside this element.
    pub content: String,
    pub done: bool,
    /// Nesting depth; top-level elements are at 0.
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementChunk {
    Start {
        element: StreamElement,
    },
    /// Text inside the elements in `path` (outermost first). An empty path is
    /// text outside any element.
    Content {
        path: Vec<usize>,
        delta: String,
    },
    End {
        element: StreamElement,
        /// Closed by recovery rather than by its own closing tag.
        forced: bool,
    },
}

#[derive(Debug, Default)]
pub struct ElementTracker {
    next_index: usize,
    open: Vec<StreamElement>,
}

impl ElementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue numbering from `index`.
    pub fn starting_at(index: usize) -> Self {
        Self {
            next_index: index,
            open: Vec::new(),
        }
    }

    /// The index the next element will receive.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn open_elements(&self) -> &[StreamElement] {
        &self.open
    }

    pub fn handle(&mut self, event: ParseEvent) -> Vec<ElementChunk> {
        match event {
            ParseEvent::Text { content } => {
                if let Some(innermost) = self.open.last_mut() {
                    innermost.content.push_str(&content);
                }
                vec![ElementChunk::Content {
                    path: self.open.iter().map(|e| e.index).collect(),
                    delta: content,
                }]
            }
            ParseEvent::Element {
                name,
                attributes,
                done,
            } => {
                let element = StreamElement {
                    index: self.next_index,
                    tag: name,
                    attributes,
                    content: String::new(),
                    done,
                    depth: self.open.len(),
                };
                self.next_index += 1;
                if !done {
                    self.open.push(element.clone());
                }
                vec![ElementChunk::Start { element }]
            }
            ParseEvent::End { name } => self.close(&name),
        }
    }

    /// Force-close everything still open.
    pub fn finish(&mut self) -> Vec<ElementChunk> {
        let mut chunks = Vec::new();
        while let Some(mut element) = self.open.pop() {
            element.done = true;
            chunks.push(ElementChunk::End {
                element,
                forced: true,
            });
        }
        chunks
    }

    fn close(&mut self, name: &str) -> Vec<ElementChunk> {
        let Some(pos) = self.open.iter().rposition(|e| e.tag == name) else {
            tracing::trace!(tag = name, "Dropping close with no open element");
            return Vec::new();
        };
        let mut chunks = Vec::new();
        while self.open.len() > pos {
            let Some(mut element) = self.open.pop() else {
                break;
            };
            let forced = self.open.len() != pos;
            element.done = true;
            chunks.push(ElementChunk::End { element, forced });
        }
        chunks
    }
}
