//! Incremental consumption of a growing log file.
//!
//! The tail remembers the byte offset it has already consumed; each poll
//! reads only the bytes appended since, so polling is cheap no matter how
//! large the file has grown. A trailing line without its newline is held
//! back until the writer finishes it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::parser::{LogLine, LogParser};

pub struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    parser: LogParser,
    rows: Vec<LogLine>,
    pids: Vec<u32>,
    types: Vec<String>,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> LogTail {
        LogTail {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
            parser: LogParser::new(),
            rows: Vec::new(),
            pids: Vec::new(),
            types: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset already consumed from the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn rows(&self) -> &[LogLine] {
        &self.rows
    }

    /// Distinct PIDs in first-seen order. Append-only: a poll never removes
    /// or reorders entries, so UI filter lists stay stable.
    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    /// Distinct type words in first-seen order, append-only like
    /// [`pids`](LogTail::pids).
    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// Reads bytes appended since the last poll and parses completed lines.
    /// Returns the number of rows appended.
    pub fn poll(&mut self) -> std::io::Result<usize> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut fresh = Vec::new();
        let read = file.read_to_end(&mut fresh)?;
        if read == 0 {
            return Ok(0);
        }
        self.offset += read as u64;
        self.partial.extend_from_slice(&fresh);

        let mut appended = 0;
        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            let Ok(text) = std::str::from_utf8(&line) else {
                continue;
            };
            if let Some(row) = self.parser.parse_line(text) {
                if !self.pids.contains(&row.pid) {
                    self.pids.push(row.pid);
                }
                if !self.types.contains(&row.line_type) {
                    self.types.push(row.line_type.clone());
                }
                self.rows.push(row);
                appended += 1;
            }
        }
        debug!(
            appended,
            offset = self.offset,
            held_back = self.partial.len(),
            "log tail poll"
        );
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn poll_consumes_only_new_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "RDOC 1234: [01:02:03] file.cpp( 10) - Error   - test message"
        )
        .unwrap();
        file.flush().unwrap();

        let mut tail = LogTail::new(file.path());
        assert_eq!(tail.poll().unwrap(), 1);
        assert_eq!(tail.rows()[0].message, "test message");

        // Nothing new.
        assert_eq!(tail.poll().unwrap(), 0);

        writeln!(file, "RDOC 1234: [01:02:04] file.cpp( 11) - Log     - more").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.poll().unwrap(), 1);
        assert_eq!(tail.rows().len(), 2);
    }

    #[test]
    fn partial_trailing_line_is_held_until_completed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "RDOC 7: [10:00:00] a.cpp(1) - Log     - first ha").unwrap();
        file.flush().unwrap();

        let mut tail = LogTail::new(file.path());
        assert_eq!(tail.poll().unwrap(), 0);

        write!(file, "lf\n").unwrap();
        file.flush().unwrap();
        assert_eq!(tail.poll().unwrap(), 1);
        assert_eq!(tail.rows()[0].message, "first half");
    }

    #[test]
    fn unmatched_lines_are_dropped_silently() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "garbage line").unwrap();
        writeln!(file, "RDOC 7: [10:00:00] a.cpp(1) - Log     - kept").unwrap();
        file.flush().unwrap();

        let mut tail = LogTail::new(file.path());
        assert_eq!(tail.poll().unwrap(), 1);
        assert_eq!(tail.rows().len(), 1);
    }

    #[test]
    fn distinct_lists_are_append_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "RDOC 1: [00:00:01] a.cpp(1) - Log     - a").unwrap();
        writeln!(file, "RDOC 2: [00:00:02] a.cpp(2) - Error   - b").unwrap();
        file.flush().unwrap();

        let mut tail = LogTail::new(file.path());
        tail.poll().unwrap();
        assert_eq!(tail.pids(), &[1, 2]);
        assert_eq!(tail.types(), &["Log", "Error"]);

        writeln!(file, "RDOC 1: [00:00:03] a.cpp(3) - Warning - c").unwrap();
        file.flush().unwrap();
        tail.poll().unwrap();
        // Existing entries keep their position; the new type lands at the
        // end.
        assert_eq!(tail.pids(), &[1, 2]);
        assert_eq!(tail.types(), &["Log", "Error", "Warning"]);
    }
}
