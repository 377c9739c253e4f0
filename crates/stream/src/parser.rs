//! Streaming structural parser.
//!
//! A resumable state machine over a character stream. Only whitelisted tag
//! names are structural; everything else (including malformed markup) is
//! passed through as literal text. The parser never fails.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Tags recognized by default.
pub const DEFAULT_TAGS: &[&str] = &[
    "think",
    "thinking",
    "reasoning",
    "action_call",
    "tool_call",
    "output",
    "response",
];

/// Tags whose nested same-name opens are folded into the outer element.
pub const DEFAULT_DEDUP_TAGS: &[&str] = &["think", "thinking", "reasoning", "response"];

/// Characters that make an immediately following `<` literal.
const WRAPPERS: &[char] = &['\'', '`', '(', ')'];

/// A structural event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParseEvent {
    Text {
        content: String,
    },
    Element {
        name: String,
        attributes: BTreeMap<String, String>,
        /// `true` for self-closing tags, which get no matching `End`.
        done: bool,
    },
    End {
        name: String,
    },
}

#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub tags: HashSet<String>,
    pub dedup_tags: HashSet<String>,
}

impl ParserOptions {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            dedup_tags: HashSet::new(),
        }
    }

    pub fn with_extra_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_dedup_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dedup_tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self::new(DEFAULT_TAGS.iter().copied()).with_dedup_tags(DEFAULT_DEDUP_TAGS.iter().copied())
    }
}

/// What to do with the `<` at the front of the buffer.
enum Scan {
    /// Treat the `<` as literal text.
    Literal,
    /// Not enough input to decide.
    Wait,
    /// A complete tag spanning `len` bytes.
    Tag { len: usize },
}

#[derive(Debug)]
pub struct StreamParser {
    options: ParserOptions,
    buffer: String,
    text: String,
    last_char: Option<char>,
    open: Vec<String>,
    depth: HashMap<String, usize>,
}

impl StreamParser {
    pub fn new(options: ParserOptions) -> Self {
        Self {
            options,
            buffer: String::new(),
            text: String::new(),
            last_char: None,
            open: Vec::new(),
            depth: HashMap::new(),
        }
    }

    /// Names of the structural elements currently open, outermost first.
    pub fn open_elements(&self) -> &[String] {
        &self.open
    }

    /// Feed a chunk and return the events it completes.
    pub fn push(&mut self, chunk: &str) -> Vec<ParseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            let Some(pos) = self.buffer.find('<') else {
                let rest = std::mem::take(&mut self.buffer);
                self.literal(&rest);
                break;
            };
            if pos > 0 {
                let before: String = self.buffer.drain(..pos).collect();
                self.literal(&before);
            }

            match self.scan() {
                Scan::Wait => break,
                Scan::Literal => {
                    self.buffer.replace_range(..1, "");
                    self.literal("<");
                }
                Scan::Tag { len } => {
                    let tag: String = self.buffer.drain(..len).collect();
                    self.tag(&tag, &mut events);
                }
            }
        }

        self.flush(&mut events);
        events
    }

    /// End of input: everything still buffered is literal text.
    pub fn finish(&mut self) -> Vec<ParseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        self.literal(&rest);
        let mut events = Vec::new();
        self.flush(&mut events);
        events
    }

    /// Decide what the `<` at the front of the buffer starts.
    ///
    /// The tag name is checked against the whitelist as it arrives, so prose
    /// such as `a <b then` turns literal at the first character that rules
    /// out every known tag.
    fn scan(&self) -> Scan {
        if self.last_char.is_some_and(|c| WRAPPERS.contains(&c)) {
            return Scan::Literal;
        }
        let rest = &self.buffer[1..];
        let name_start = usize::from(rest.starts_with('/'));
        match rest[name_start..].chars().next() {
            None => return Scan::Wait,
            Some(c) if c.is_ascii_alphabetic() => {}
            Some(_) => return Scan::Literal,
        }

        let mut name_end = None;
        for (i, c) in rest.char_indices().skip(name_start) {
            let ends_name = c.is_whitespace() || c == '/' || c == '>';
            if name_end.is_none() {
                if c == '<' {
                    return Scan::Literal;
                }
                if !ends_name {
                    if !self.is_tag_prefix(&rest[name_start..i + c.len_utf8()]) {
                        return Scan::Literal;
                    }
                    continue;
                }
                if !self.options.tags.contains(&rest[name_start..i]) {
                    return Scan::Literal;
                }
                name_end = Some(i);
            }
            match c {
                '>' => return Scan::Tag { len: i + 2 },
                '<' => return Scan::Literal,
                _ => {}
            }
        }
        Scan::Wait
    }

    fn is_tag_prefix(&self, partial: &str) -> bool {
        self.options.tags.iter().any(|tag| tag.starts_with(partial))
    }

    fn tag(&mut self, tag: &str, events: &mut Vec<ParseEvent>) {
        let inner = &tag[1..tag.len() - 1];

        if let Some(name) = inner.strip_prefix('/') {
            let name = name.trim();
            if !self.options.tags.contains(name) {
                self.literal(tag);
                return;
            }
            self.flush(events);
            self.last_char = Some('>');
            self.close(name, events);
            return;
        }

        let (body, self_closing) = match inner.trim_end().strip_suffix('/') {
            Some(body) => (body, true),
            None => (inner, false),
        };
        let name_end = body
            .find(|c: char| c.is_whitespace())
            .unwrap_or(body.len());
        let name = &body[..name_end];
        if !self.options.tags.contains(name) {
            self.literal(tag);
            return;
        }

        self.flush(events);
        self.last_char = Some('>');

        if self.options.dedup_tags.contains(name) && self.open.iter().any(|n| n == name) {
            if !self_closing {
                *self.depth.entry(name.to_string()).or_insert(0) += 1;
                tracing::trace!(tag = name, "Folding nested same-name element");
            }
            return;
        }

        let attributes = parse_attributes(&body[name_end..]);
        if !self_closing {
            self.open.push(name.to_string());
        }
        events.push(ParseEvent::Element {
            name: name.to_string(),
            attributes,
            done: self_closing,
        });
    }

    fn close(&mut self, name: &str, events: &mut Vec<ParseEvent>) {
        let Some(pos) = self.open.iter().rposition(|n| n == name) else {
            tracing::trace!(tag = name, "Dropping close for element that is not open");
            return;
        };
        if let Some(depth) = self.depth.get_mut(name) {
            if *depth > 0 {
                *depth -= 1;
                return;
            }
        }
        for popped in self.open.drain(pos..) {
            self.depth.remove(&popped);
        }
        events.push(ParseEvent::End {
            name: name.to_string(),
        });
    }

    fn literal(&mut self, text: &str) {
        if let Some(c) = text.chars().last() {
            self.last_char = Some(c);
            self.text.push_str(text);
        }
    }

    fn flush(&mut self, events: &mut Vec<ParseEvent>) {
        if !self.text.is_empty() {
            events.push(ParseEvent::Text {
                content: std::mem::take(&mut self.text),
            });
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(ParserOptions::default())
    }
}

/// Parse `key="v" key='v' key=v bare` into a flat map. Bare keys map to `""`.
pub(crate) fn parse_attributes(input: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '=' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            if chars.next().is_none() {
                break;
            }
            continue;
        }

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek() != Some(&'=') {
            attributes.insert(key, String::new());
            continue;
        }
        chars.next();
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        match chars.peek().copied() {
            Some(quote @ ('"' | '\'')) => {
                chars.next();
                for c in chars.by_ref() {
                    if c == quote {
                        break;
                    }
                    value.push(c);
                }
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        attributes.insert(key, value);
    }

    attributes
}
