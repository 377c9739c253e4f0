//! `ravel parse`: Print the stream parser's events as JSON lines.
//!
//! The transcript is pushed in fixed-size chunks, the way a model would
//! stream it, so the output shows exactly what the engine sees.

use std::path::Path;

use ravel_config::RuntimeConfig;
use ravel_stream::{ParseEvent, ParserOptions, StreamParser};

pub fn run(config: &RuntimeConfig, transcript: &Path, chunk_size: usize) -> Result<(), Box<dyn std::error::Error>> {
    let text = super::read_transcript(transcript)
        .map_err(|e| format!("Failed to read {}: {e}", transcript.display()))?;

    for event in parse_chunked(parser_options(config), &text, chunk_size) {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

pub fn parser_options(config: &RuntimeConfig) -> ParserOptions {
    let options = ParserOptions::default().with_extra_tags(config.parser.extra_tags.iter().cloned());
    if config.parser.dedup_tags.is_empty() {
        options
    } else {
        options.with_dedup_tags(config.parser.dedup_tags.iter().cloned())
    }
}

/// Push `text` through a fresh parser in chunks of `chunk_size` characters.
pub fn parse_chunked(options: ParserOptions, text: &str, chunk_size: usize) -> Vec<ParseEvent> {
    let mut parser = StreamParser::new(options);
    let chars: Vec<char> = text.chars().collect();
    let mut events = Vec::new();
    for chunk in chars.chunks(chunk_size.max(1)) {
        let chunk: String = chunk.iter().collect();
        events.extend(parser.push(&chunk));
    }
    events.extend(parser.finish());
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_does_not_change_structure() {
        let text = "<think>plan</think><action_call name=\"echo\">{}</action_call>";
        let structural = |events: Vec<ParseEvent>| {
            events
                .into_iter()
                .filter(|e| !matches!(e, ParseEvent::Text { .. }))
                .collect::<Vec<_>>()
        };
        let whole = structural(parse_chunked(ParserOptions::default(), text, text.len()));
        let tiny = structural(parse_chunked(ParserOptions::default(), text, 1));
        assert_eq!(whole, tiny);
        assert_eq!(whole.len(), 4);
    }

    #[test]
    fn extra_tags_from_config() {
        let mut config = RuntimeConfig::default();
        config.parser.extra_tags = vec!["plan".into()];
        let events = parse_chunked(parser_options(&config), "<plan>x</plan>", 3);
        assert!(matches!(&events[0], ParseEvent::Element { name, .. } if name == "plan"));
    }
}
