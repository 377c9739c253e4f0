//! # Ravel Stream
//!
//! Turns a model's token stream into memories while it is still streaming.
//!
//! ```text
//! chunks ──▶ StreamParser ──▶ ElementTracker ──▶ Projector ──▶ MemoryUpdate
//!            (ParseEvent)      (ElementChunk)
//! ```
//!
//! [`StreamProjector`] composes the three stages behind a single
//! `push` / `finish` pair. The [`format`] module decodes finalized call and
//! output bodies.

pub mod element;
pub mod format;
pub mod parser;
pub mod projector;

pub use element::{ElementChunk, ElementTracker, StreamElement};
pub use format::{decode, encode};
pub use parser::{ParseEvent, ParserOptions, StreamParser};
pub use projector::{MemoryUpdate, Projector, StreamProjector, kind_for_tag};
