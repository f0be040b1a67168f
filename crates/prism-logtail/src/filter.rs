//! Visible-row filtering over the tailed rows.
//!
//! The view keeps indices into the row list rather than copies. Changing
//! the filter re-derives the whole visible set; appending rows merges only
//! the new tail, so steady-state polling stays incremental.

use std::collections::HashSet;

use crate::parser::LogLine;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub hidden_pids: HashSet<u32>,
    pub hidden_types: HashSet<String>,
    /// Substring the message (or location) must contain; empty means no
    /// text filtering.
    pub text: String,
    /// Inverts the text match: keep rows NOT containing `text`.
    pub invert_text: bool,
}

impl LogFilter {
    pub fn matches(&self, row: &LogLine) -> bool {
        if self.hidden_pids.contains(&row.pid) {
            return false;
        }
        if self.hidden_types.contains(&row.line_type) {
            return false;
        }
        if self.text.is_empty() {
            return true;
        }
        let hit = row.message.contains(&self.text) || row.location.contains(&self.text);
        hit != self.invert_text
    }
}

#[derive(Debug, Default)]
pub struct LogView {
    filter: LogFilter,
    visible: Vec<usize>,
    /// Rows already considered against the current filter.
    considered: usize,
}

impl LogView {
    pub fn new() -> LogView {
        LogView::default()
    }

    pub fn filter(&self) -> &LogFilter {
        &self.filter
    }

    /// Indices into the row list, in row order.
    pub fn visible(&self) -> &[usize] {
        &self.visible
    }

    /// Replaces the filter and re-derives the visible set from scratch.
    pub fn set_filter(&mut self, filter: LogFilter, rows: &[LogLine]) {
        self.filter = filter;
        self.visible.clear();
        self.considered = 0;
        self.append(rows);
    }

    /// Considers rows appended since the last call and merges the matches
    /// into the visible set.
    pub fn append(&mut self, rows: &[LogLine]) {
        for (index, row) in rows.iter().enumerate().skip(self.considered) {
            if self.filter.matches(row) {
                self.visible.push(index);
            }
        }
        self.considered = rows.len();
    }
}
