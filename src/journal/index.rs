//! The persisted journal root. Every structural change rewrites it through
//! write-temp-then-rename so a crash leaves either the old or the new index.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::checkpoint::JournalCheckpoint;
use super::segment::{self, JournalSegment};
use crate::error::Result;

pub const INDEX_FILE: &str = "journal-index.json";
pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalIndex {
    pub version: u32,
    pub replica_id: String,
    pub last_sequence: u64,
    pub segments: Vec<JournalSegment>,
    pub checkpoints: Vec<JournalCheckpoint>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl JournalIndex {
    pub fn new(replica_id: &str, now_ms: u64) -> Self {
        Self {
            version: INDEX_VERSION,
            replica_id: replica_id.to_string(),
            last_sequence: 0,
            segments: Vec::new(),
            checkpoints: Vec::new(),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Load the index from `dir`, or `None` if it has never been written.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn persist(&mut self, dir: &Path, now_ms: u64) -> Result<()> {
        self.updated_at = now_ms;
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        let body = serde_json::to_vec_pretty(self)?;
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, dir.join(INDEX_FILE))?;
        Ok(())
    }

    /// Rebuild segment metadata from file names when the index itself is gone.
    /// Closed segments are trusted by name; the open segment is left empty and
    /// filled in by recovery. Checkpoints are not recovered this way.
    pub fn rebuild_from_dir(dir: &Path, replica_id: &str, now_ms: u64) -> Result<Option<Self>> {
        let segments = scan_segments(dir, now_ms)?;
        if segments.is_empty() {
            return Ok(None);
        }

        let mut index = Self::new(replica_id, now_ms);
        index.last_sequence = segments
            .iter()
            .filter(|s| !s.is_open)
            .map(|s| s.end_sequence)
            .max()
            .unwrap_or(0);
        index.segments = segments;
        Ok(Some(index))
    }

    pub fn open_segment(&self) -> Option<&JournalSegment> {
        self.segments.iter().find(|s| s.is_open)
    }

    pub fn open_segment_mut(&mut self) -> Option<&mut JournalSegment> {
        self.segments.iter_mut().find(|s| s.is_open)
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.segments.iter().find(|s| !s.is_empty()).map(|s| s.start_sequence)
    }

    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.file_size).sum()
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> Option<&JournalCheckpoint> {
        self.checkpoints.iter().find(|c| c.checkpoint_id == checkpoint_id)
    }
}


/// Segment metadata for every segment file in `dir`, ordered by start sequence.
/// Closed files carry their range in the name; open files come back empty.
pub fn scan_segments(dir: &Path, now_ms: u64) -> Result<Vec<JournalSegment>> {
    let mut segments = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        let Some((start, end)) = segment::parse_file_name(&name) else {
            continue;
        };
        let mut seg = JournalSegment::new_open(start, now_ms);
        if let Some(end) = end {
            seg.end_sequence = end;
            seg.entry_count = end + 1 - start;
            seg.file_size = dirent.metadata()?.len();
            seg.is_open = false;
            seg.closed_at = Some(now_ms);
            seg.file_path = name;
        }
        segments.push(seg);
    }
    segments.sort_by_key(|s| s.start_sequence);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let mut index = JournalIndex::new("primary-a", 100);
        index.segments.push(JournalSegment::new_open(1, 100));
        index.persist(dir.path(), 200).unwrap();

        let loaded = JournalIndex::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.updated_at, 200);
        assert!(!dir.path().join("journal-index.json.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(JournalIndex::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_rebuild_from_file_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(segment::closed_file_name(1, 10)), b"").unwrap();
        fs::write(dir.path().join(segment::closed_file_name(11, 15)), b"").unwrap();
        fs::write(dir.path().join(segment::open_file_name(16)), b"").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"").unwrap();

        let index = JournalIndex::rebuild_from_dir(dir.path(), "r", 0).unwrap().unwrap();
        assert_eq!(index.segments.len(), 3);
        assert_eq!(index.last_sequence, 15);
        assert_eq!(index.segments[1].entry_count, 5);
        assert!(index.open_segment().unwrap().is_empty());
        assert_eq!(index.open_segment().unwrap().start_sequence, 16);
    }
}
