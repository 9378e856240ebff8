//! Unit tests for the JSONL journal.

use longhaul::persistence::journal::JsonlJournal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    n: u32,
}

#[test]
fn missing_file_reads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let journal: JsonlJournal<Entry> = JsonlJournal::new(dir.path().join("none.jsonl"));
    assert!(journal.read_all().is_empty());
}

#[test]
fn appends_are_read_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let journal = JsonlJournal::new(dir.path().join("nested/log.jsonl"));
    for n in 1..=3 {
        journal.append(&Entry { n }).unwrap();
    }
    let entries: Vec<Entry> = journal.read_all();
    assert_eq!(entries, vec![Entry { n: 1 }, Entry { n: 2 }, Entry { n: 3 }]);
}

#[test]
fn replace_all_rewrites_and_appends_continue() {
    let dir = tempfile::tempdir().unwrap();
    let journal = JsonlJournal::new(dir.path().join("log.jsonl"));
    journal.append(&Entry { n: 1 }).unwrap();
    journal.replace_all(&[Entry { n: 7 }]).unwrap();
    journal.append(&Entry { n: 8 }).unwrap();
    assert_eq!(journal.read_all(), vec![Entry { n: 7 }, Entry { n: 8 }]);
}

#[test]
fn malformed_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.jsonl");
    std::fs::write(&path, "{\"n\":1}\nnot json\n\n{\"n\":2}\n{\"n\":").unwrap();
    let journal: JsonlJournal<Entry> = JsonlJournal::new(path);
    assert_eq!(journal.read_all(), vec![Entry { n: 1 }, Entry { n: 2 }]);
}
