pub mod config_cmd;
pub mod parse;
pub mod replay;

use std::io::Read;
use std::path::Path;

/// Read a transcript from a file, or from stdin when the path is `-`.
pub fn read_transcript(path: &Path) -> std::io::Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        return Ok(text);
    }
    std::fs::read_to_string(path)
}
