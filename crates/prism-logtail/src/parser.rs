//! Structured log-line grammar.
//!
//! Lines look like:
//!
//! ```text
//! RDOC 1234: [01:02:03] file.cpp( 10) - Error   - test message
//! ```
//!
//! tag, PID, wall-clock timestamp, `file(line)` location, a type word, and
//! the free-text message. Anything that does not match is dropped.

use regex::Regex;

/// Display label for the core library's `RDOC` source tag.
const CORE_SOURCE_LABEL: &str = "Core";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Display label of the producing component, not the raw tag.
    pub source: String,
    pub pid: u32,
    /// `HH:MM:SS`, kept as text.
    pub timestamp: String,
    /// `file(line)` with padding stripped.
    pub location: String,
    /// Severity/type word (`Log`, `Warning`, `Error`, ...).
    pub line_type: String,
    pub message: String,
}

pub struct LogParser {
    pattern: Regex,
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser {
    pub fn new() -> LogParser {
        // The line number inside the parentheses is space-padded by the
        // writer.
        let pattern = Regex::new(
            r"^([A-Za-z0-9]+)\s+(\d+): \[(\d{2}:\d{2}:\d{2})\]\s+(.+?)\(\s*(\d+)\) - ([A-Za-z]+)\s+- (.*)$",
        )
        .unwrap();
        LogParser { pattern }
    }

    /// Parses one line; `None` for anything outside the grammar.
    pub fn parse_line(&self, line: &str) -> Option<LogLine> {
        let captures = self.pattern.captures(line.trim_end())?;
        let tag = &captures[1];
        let source = if tag == "RDOC" {
            CORE_SOURCE_LABEL.to_owned()
        } else {
            tag.to_owned()
        };
        Some(LogLine {
            source,
            pid: captures[2].parse().ok()?,
            timestamp: captures[3].to_owned(),
            location: format!("{}({})", &captures[4], &captures[5]),
            line_type: captures[6].to_owned(),
            message: captures[7].to_owned(),
        })
    }
}
