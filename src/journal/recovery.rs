//! Startup validation of the segment left open by the previous run.
//!
//! Every line is parsed, checksum-verified and checked for exact sequence
//! contiguity. At the first bad line the file is truncated back to the end of
//! the last good one: the uncommitted tail is lost, corruption never carries
//! forward.

use std::path::Path;

use super::entry::JournalEntry;
use super::segment::{truncate_file, JournalSegment, LineScanner};
use crate::error::{JournalError, Result};
use crate::logging::{log_recovery_truncate, Domain, ProfileScope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub valid_entries: u64,
    pub kept_bytes: u64,
    pub truncated_bytes: u64,
    /// Why scanning stopped early, if it did.
    pub reason: Option<String>,
}

impl RecoveryOutcome {
    pub fn truncated(&self) -> bool {
        self.truncated_bytes > 0
    }
}

pub fn recover_open_segment(dir: &Path, segment: &mut JournalSegment) -> Result<RecoveryOutcome> {
    let _scope = ProfileScope::new(Domain::Recovery, "recover_open_segment");
    let path = segment.path_in(dir);
    let file_len = std::fs::metadata(&path)?.len();

    let mut expected = segment.start_sequence;
    let mut kept_bytes = 0u64;
    let mut valid = 0u64;
    let mut reason = None;

    for line in LineScanner::open(&path)? {
        let raw = line?;
        if !raw.terminated {
            reason = Some(format!("torn write at sequence {}", expected));
            break;
        }
        match JournalEntry::parse_line(&raw.text) {
            Ok(entry) if entry.sequence == expected => {
                kept_bytes = raw.end_offset;
                valid += 1;
                expected += 1;
            }
            Ok(entry) => {
                reason = Some(
                    JournalError::SequenceGap {
                        expected,
                        found: entry.sequence,
                    }
                    .to_string(),
                );
                break;
            }
            Err(e) => {
                reason = Some(e.to_string());
                break;
            }
        }
    }

    let truncated_bytes = file_len.saturating_sub(kept_bytes);
    if truncated_bytes > 0 {
        truncate_file(&path, kept_bytes)?;
        log_recovery_truncate(
            &segment.segment_id,
            valid,
            kept_bytes,
            truncated_bytes,
            reason.as_deref().unwrap_or("trailing bytes"),
        );
    }

    segment.entry_count = valid;
    segment.end_sequence = segment.start_sequence + valid - 1;
    segment.file_size = kept_bytes;

    Ok(RecoveryOutcome {
        valid_entries: valid,
        kept_bytes,
        truncated_bytes,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    use crate::journal::entry::EventMetadata;
    use crate::journal::segment::SegmentWriter;

    fn write_entries(dir: &Path, seg: &JournalSegment, seqs: &[u64]) -> Vec<String> {
        let mut w = SegmentWriter::open(&seg.path_in(dir)).unwrap();
        let mut lines = Vec::new();
        for &s in seqs {
            let line = JournalEntry::new(s, s, "tick", json!({"px": s}), EventMetadata::default())
                .to_line()
                .unwrap();
            w.append(&line, false).unwrap();
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_clean_segment_untouched() {
        let dir = TempDir::new().unwrap();
        let mut seg = JournalSegment::new_open(1, 0);
        write_entries(dir.path(), &seg, &[1, 2, 3]);
        let out = recover_open_segment(dir.path(), &mut seg).unwrap();
        assert_eq!(out.valid_entries, 3);
        assert!(!out.truncated());
        assert_eq!(seg.end_sequence, 3);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = TempDir::new().unwrap();
        let mut seg = JournalSegment::new_open(1, 0);
        let lines = write_entries(dir.path(), &seg, &[1, 2, 3]);
        let path = seg.path_in(dir.path());
        let cut = (lines[0].len() + lines[1].len() + lines[2].len() / 2) as u64;
        truncate_file(&path, cut).unwrap();

        let out = recover_open_segment(dir.path(), &mut seg).unwrap();
        assert_eq!(out.valid_entries, 2);
        assert!(out.truncated());
        assert_eq!(seg.end_sequence, 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), (lines[0].len() + lines[1].len()) as u64);
    }

    #[test]
    fn test_gap_truncates_from_gap() {
        let dir = TempDir::new().unwrap();
        let mut seg = JournalSegment::new_open(10, 0);
        write_entries(dir.path(), &seg, &[10, 11, 13, 14]);
        let out = recover_open_segment(dir.path(), &mut seg).unwrap();
        assert_eq!(out.valid_entries, 2);
        assert!(out.reason.unwrap().contains("expected 12"));
        assert_eq!(seg.end_sequence, 11);
    }

    #[test]
    fn test_corrupt_line_truncates() {
        let dir = TempDir::new().unwrap();
        let mut seg = JournalSegment::new_open(1, 0);
        let lines = write_entries(dir.path(), &seg, &[1, 2]);
        let path = seg.path_in(dir.path());
        let tampered = format!("{}{}", lines[0], lines[1].replace("\"px\":2", "\"px\":9"));
        fs::write(&path, tampered).unwrap();

        let out = recover_open_segment(dir.path(), &mut seg).unwrap();
        assert_eq!(out.valid_entries, 1);
        assert!(out.reason.unwrap().contains("checksum"));
    }

    #[test]
    fn test_empty_file() {
        let dir = TempDir::new().unwrap();
        let mut seg = JournalSegment::new_open(5, 0);
        fs::write(seg.path_in(dir.path()), b"").unwrap();
        let out = recover_open_segment(dir.path(), &mut seg).unwrap();
        assert_eq!(out.valid_entries, 0);
        assert_eq!(seg.end_sequence, 4);
    }
}
