use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::entry::JournalEntry;
use crate::error::Result;

pub const SEGMENT_PREFIX: &str = "segment-";
pub const SEGMENT_SUFFIX: &str = ".journal";

/// One append-only file holding a contiguous range of sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalSegment {
    pub segment_id: String,
    pub start_sequence: u64,
    /// `start_sequence - 1` while the segment is empty.
    pub end_sequence: u64,
    /// File name relative to the journal directory.
    pub file_path: String,
    pub file_size: u64,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<u64>,
    pub entry_count: u64,
    pub is_open: bool,
}

impl JournalSegment {
    pub fn new_open(start_sequence: u64, now_ms: u64) -> Self {
        Self {
            segment_id: segment_id(start_sequence),
            start_sequence,
            end_sequence: start_sequence.saturating_sub(1),
            file_path: open_file_name(start_sequence),
            file_size: 0,
            created_at: now_ms,
            closed_at: None,
            entry_count: 0,
            is_open: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn contains(&self, sequence: u64) -> bool {
        !self.is_empty() && sequence >= self.start_sequence && sequence <= self.end_sequence
    }

    /// True when the segment holds any sequence in `[from, to]`.
    pub fn overlaps(&self, from: u64, to: u64) -> bool {
        !self.is_empty() && self.start_sequence <= to && self.end_sequence >= from
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file_path)
    }

    pub(crate) fn record_append(&mut self, sequence: u64, bytes: u64) {
        self.end_sequence = sequence;
        self.entry_count += 1;
        self.file_size += bytes;
    }

    /// Seal the segment under its closed file name. The caller renames the file.
    pub(crate) fn seal(&mut self, now_ms: u64) {
        self.is_open = false;
        self.closed_at = Some(now_ms);
        self.file_path = closed_file_name(self.start_sequence, self.end_sequence);
    }
}

pub fn segment_id(start_sequence: u64) -> String {
    format!("{}{:012}", SEGMENT_PREFIX, start_sequence)
}

pub fn open_file_name(start_sequence: u64) -> String {
    format!("{}{:012}-open{}", SEGMENT_PREFIX, start_sequence, SEGMENT_SUFFIX)
}

pub fn closed_file_name(start_sequence: u64, end_sequence: u64) -> String {
    format!(
        "{}{:012}-{:012}{}",
        SEGMENT_PREFIX, start_sequence, end_sequence, SEGMENT_SUFFIX
    )
}

/// Parse a segment file name into `(start, Some(end))` for closed segments
/// or `(start, None)` for the open one.
pub fn parse_file_name(name: &str) -> Option<(u64, Option<u64>)> {
    let body = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    let (start, rest) = body.split_once('-')?;
    let start = start.parse().ok()?;
    if rest == "open" {
        return Some((start, None));
    }
    Some((start, Some(rest.parse().ok()?)))
}

/// Append handle on the open segment.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
}

impl SegmentWriter {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Write one serialized line in a single call; fsync when `sync` is set.
    pub fn append(&mut self, line: &str, sync: bool) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes())?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A raw line read from a segment, with the byte offset just past it.
#[derive(Debug)]
pub struct RawLine {
    pub text: String,
    pub end_offset: u64,
    pub terminated: bool,
}

pub struct LineScanner {
    reader: BufReader<File>,
    offset: u64,
}

impl LineScanner {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            offset: 0,
        })
    }
}

impl Iterator for LineScanner {
    type Item = std::io::Result<RawLine>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(n) => {
                self.offset += n as u64;
                let terminated = buf.last() == Some(&b'\n');
                // Torn writes can leave invalid UTF-8; surface it as text the parser rejects.
                let text = String::from_utf8_lossy(&buf).into_owned();
                Some(Ok(RawLine {
                    text,
                    end_offset: self.offset,
                    terminated,
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Checksum-verified entries of one segment file, in file order.
pub fn read_entries(path: &Path) -> Result<impl Iterator<Item = Result<JournalEntry>>> {
    let scanner = LineScanner::open(path)?;
    Ok(scanner.filter_map(|line| match line {
        Ok(raw) if raw.text.trim().is_empty() => None,
        Ok(raw) => Some(JournalEntry::parse_line(&raw.text)),
        Err(e) => Some(Err(e.into())),
    }))
}

pub fn truncate_file(path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::journal::entry::EventMetadata;

    #[test]
    fn test_file_names_round_trip() {
        assert_eq!(open_file_name(1), "segment-000000000001-open.journal");
        assert_eq!(closed_file_name(1, 250), "segment-000000000001-000000000250.journal");
        assert_eq!(parse_file_name("segment-000000000001-open.journal"), Some((1, None)));
        assert_eq!(
            parse_file_name("segment-000000000001-000000000250.journal"),
            Some((1, Some(250)))
        );
        assert_eq!(parse_file_name("journal-index.json"), None);
        assert_eq!(parse_file_name("segment-abc-open.journal"), None);
    }

    #[test]
    fn test_empty_segment_overlaps_nothing() {
        let seg = JournalSegment::new_open(11, 0);
        assert!(seg.is_empty());
        assert_eq!(seg.end_sequence, 10);
        assert!(!seg.overlaps(1, 100));
        assert!(!seg.contains(11));
    }

    #[test]
    fn test_seal_renames() {
        let mut seg = JournalSegment::new_open(1, 0);
        seg.record_append(1, 10);
        seg.record_append(2, 10);
        seg.seal(5);
        assert!(!seg.is_open);
        assert_eq!(seg.file_path, "segment-000000000001-000000000002.journal");
        assert_eq!(seg.closed_at, Some(5));
        assert!(seg.overlaps(2, 9));
    }

    #[test]
    fn test_scanner_reports_unterminated_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(open_file_name(1));
        let mut w = SegmentWriter::open(&path).unwrap();
        let e = JournalEntry::new(1, 1, "a", json!(1), EventMetadata::default());
        w.append(&e.to_line().unwrap(), true).unwrap();
        w.append("{\"sequence\":2,\"time", true).unwrap();

        let lines: Vec<RawLine> = LineScanner::open(&path).unwrap().map(|l| l.unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].terminated);
        assert!(!lines[1].terminated);
        assert_eq!(lines[0].end_offset, e.to_line().unwrap().len() as u64);
    }
}
