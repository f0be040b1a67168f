#![forbid(unsafe_code)]

//! Live log tailing: incremental reads of a growing log file, a fixed
//! structured-line grammar, and the filter state backing a log viewer.

pub mod filter;
pub mod parser;
pub mod tail;

pub use filter::{LogFilter, LogView};
pub use parser::{LogLine, LogParser};
pub use tail::LogTail;
