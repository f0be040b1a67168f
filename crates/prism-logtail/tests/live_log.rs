//! Tails a growing log file end to end: incremental polling, the fixed line
//! grammar, and filtered views over the accumulated rows.

use std::collections::HashSet;
use std::io::Write;

use prism_logtail::{LogFilter, LogTail, LogView};

const LINES: &str = "\
RDOC 1234: [12:00:01] core/replay.cpp( 210) - Info - capture opened\n\
QRD 1234: [12:00:02] qui/panel.cpp(  33) - Debug - panel layout pass\n\
RDOC 5678: [12:00:03] core/fetch.cpp( 410) - Error - fetch failed: out of memory\n";

#[test]
fn polling_picks_up_appended_lines_and_held_partials() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "{LINES}").expect("write");
    file.flush().expect("flush");

    let mut tail = LogTail::new(file.path());
    assert_eq!(tail.poll().expect("poll"), 3);
    assert_eq!(tail.rows().len(), 3);
    assert_eq!(tail.rows()[0].source, "Core");
    assert_eq!(tail.rows()[0].location, "core/replay.cpp(210)");
    assert_eq!(tail.pids(), &[1234, 5678]);
    assert_eq!(tail.types(), &["Info", "Debug", "Error"]);

    // A line written in two pieces only materializes once complete.
    write!(file, "RDOC 1234: [12:00:04] core/fetch.cpp( 411) - Info - retry").expect("write");
    file.flush().expect("flush");
    assert_eq!(tail.poll().expect("poll"), 0);

    writeln!(file, " with smaller window").expect("write");
    file.flush().expect("flush");
    assert_eq!(tail.poll().expect("poll"), 1);
    assert_eq!(tail.rows()[3].message, "retry with smaller window");
}

#[test]
fn views_filter_and_merge_appends_incrementally() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "{LINES}").expect("write");
    file.flush().expect("flush");

    let mut tail = LogTail::new(file.path());
    tail.poll().expect("poll");

    let mut view = LogView::new();
    let mut filter = LogFilter::default();
    filter.hidden_types = HashSet::from(["Debug".to_owned()]);
    view.set_filter(filter, tail.rows());
    assert_eq!(view.visible(), &[0, 2]);

    writeln!(
        file,
        "QRD 1234: [12:00:05] qui/panel.cpp(  40) - Info - selection changed"
    )
    .expect("write");
    file.flush().expect("flush");
    tail.poll().expect("poll");
    view.append(tail.rows());
    assert_eq!(view.visible(), &[0, 2, 3]);

    // Dropping the filter restores the full set.
    view.set_filter(LogFilter::default(), tail.rows());
    assert_eq!(view.visible(), &[0, 1, 2, 3]);
}
