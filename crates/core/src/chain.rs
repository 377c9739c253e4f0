//! The chain: an ordered, append-only record of a run's memories.
//!
//! Order is receipt order. Completion order of concurrent calls is not
//! preserved; correlate results with calls through `parent`.

use crate::memory::{Memory, MemoryId, MemoryKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordered collection of memories with an id index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Memory>", into = "Vec<Memory>")]
pub struct Chain {
    entries: Vec<Memory>,
    index: HashMap<MemoryId, usize>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new memory. Returns `false` if the id is already present.
    pub fn append(&mut self, memory: Memory) -> bool {
        if self.index.contains_key(memory.id()) {
            return false;
        }
        self.index.insert(memory.id().clone(), self.entries.len());
        self.entries.push(memory);
        true
    }

    /// Insert or replace in place, keeping the original position.
    /// Returns `true` if the memory was new.
    pub fn upsert(&mut self, memory: Memory) -> bool {
        match self.index.get(memory.id()) {
            Some(&pos) => {
                self.entries[pos] = memory;
                false
            }
            None => self.append(memory),
        }
    }

    pub fn get(&self, id: &MemoryId) -> Option<&Memory> {
        self.index.get(id).map(|&pos| &self.entries[pos])
    }

    pub fn get_mut(&mut self, id: &MemoryId) -> Option<&mut Memory> {
        match self.index.get(id) {
            Some(&pos) => self.entries.get_mut(pos),
            None => None,
        }
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Memory> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Memory> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&Memory> {
        self.entries.last()
    }

    pub fn with_label<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a Memory> + 'a {
        self.entries.iter().filter(move |m| m.has_label(label))
    }

    pub fn of_kind<'a>(&'a self, kind: &'a MemoryKind) -> impl Iterator<Item = &'a Memory> + 'a {
        self.entries.iter().filter(move |m| m.kind() == kind)
    }

    /// Memories whose `parent` points at `id`.
    pub fn children_of<'a>(&'a self, id: &'a MemoryId) -> impl Iterator<Item = &'a Memory> + 'a {
        self.entries
            .iter()
            .filter(move |m| m.parent.as_ref().is_some_and(|p| &p.id == id))
    }

    /// The terminal result or error memory recorded for a call.
    pub fn terminal_for(&self, call: &MemoryId) -> Option<&Memory> {
        self.entries.iter().find(|m| {
            m.kind().is_terminal() && m.parent.as_ref().is_some_and(|p| &p.id == call)
        })
    }

    pub fn to_vec(&self) -> Vec<Memory> {
        self.entries.clone()
    }
}

impl From<Vec<Memory>> for Chain {
    fn from(memories: Vec<Memory>) -> Self {
        let mut chain = Chain::new();
        for memory in memories {
            chain.upsert(memory);
        }
        chain
    }
}

impl From<Chain> for Vec<Memory> {
    fn from(chain: Chain) -> Self {
        chain.entries
    }
}

impl<'a> IntoIterator for &'a Chain {
    type Item = &'a Memory;
    type IntoIter = std::slice::Iter<'a, Memory>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
