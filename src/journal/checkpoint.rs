use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entry::checksum_value;
use crate::error::{JournalError, Result};

pub const CHECKPOINT_SUFFIX: &str = ".checkpoint";
pub const SNAPSHOT_SUFFIX: &str = ".snapshot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalCheckpoint {
    pub checkpoint_id: String,
    pub sequence: u64,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,
    pub entry_count: u64,
    pub checksum: String,
    pub segment_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointBody<'a> {
    checkpoint_id: &'a str,
    sequence: u64,
    timestamp: u64,
    snapshot_path: &'a Option<String>,
    entry_count: u64,
    segment_ids: &'a [String],
}

/// State snapshot stored next to a checkpoint, with its own checksum over `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub checkpoint_id: String,
    pub sequence: u64,
    pub timestamp: u64,
    pub state: Value,
    pub checksum: String,
}

pub fn checkpoint_id(sequence: u64, now_ms: u64) -> String {
    format!("checkpoint-{:012}-{}", sequence, now_ms)
}

impl JournalCheckpoint {
    pub fn new(
        checkpoint_id: String,
        sequence: u64,
        timestamp: u64,
        snapshot_path: Option<String>,
        entry_count: u64,
        segment_ids: Vec<String>,
    ) -> Result<Self> {
        let mut cp = Self {
            checkpoint_id,
            sequence,
            timestamp,
            snapshot_path,
            entry_count,
            checksum: String::new(),
            segment_ids,
        };
        cp.checksum = cp.compute_checksum()?;
        Ok(cp)
    }

    fn compute_checksum(&self) -> Result<String> {
        checksum_value(&CheckpointBody {
            checkpoint_id: &self.checkpoint_id,
            sequence: self.sequence,
            timestamp: self.timestamp,
            snapshot_path: &self.snapshot_path,
            entry_count: self.entry_count,
            segment_ids: &self.segment_ids,
        })
    }

    pub fn verify(&self) -> Result<()> {
        let computed = self.compute_checksum()?;
        if computed != self.checksum {
            return Err(self.unusable(&format!("checkpoint checksum {} != {}", self.checksum, computed)));
        }
        Ok(())
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.checkpoint_id, CHECKPOINT_SUFFIX)
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        write_synced(&dir.join(self.file_name()), &serde_json::to_vec_pretty(self)?)
    }

    /// Load and verify the snapshot state. `Ok(None)` when the checkpoint was
    /// taken without state; `SnapshotUnusable` when the file is gone or corrupt.
    pub fn load_snapshot(&self, dir: &Path) -> Result<Option<Value>> {
        self.verify()?;
        let Some(name) = &self.snapshot_path else {
            return Ok(None);
        };
        let raw = fs::read_to_string(dir.join(name))
            .map_err(|e| self.unusable(&format!("snapshot unreadable: {}", e)))?;
        let snap: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| self.unusable(&format!("snapshot unparsable: {}", e)))?;
        let computed = checksum_value(&snap.state)?;
        if computed != snap.checksum {
            return Err(self.unusable(&format!("snapshot checksum {} != {}", snap.checksum, computed)));
        }
        if snap.sequence != self.sequence {
            return Err(self.unusable(&format!(
                "snapshot sequence {} != checkpoint sequence {}",
                snap.sequence, self.sequence
            )));
        }
        Ok(Some(snap.state))
    }

    /// True when the checkpoint can be used as a replay/restore point.
    pub fn is_usable(&self, dir: &Path) -> bool {
        self.load_snapshot(dir).is_ok()
    }

    /// Delete the checkpoint's files; missing files are not an error.
    pub fn remove_files(&self, dir: &Path) -> Result<()> {
        remove_if_exists(&dir.join(self.file_name()))?;
        if let Some(name) = &self.snapshot_path {
            remove_if_exists(&dir.join(name))?;
        }
        Ok(())
    }

    fn unusable(&self, reason: &str) -> JournalError {
        JournalError::SnapshotUnusable {
            checkpoint_id: self.checkpoint_id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Write a snapshot file for `checkpoint_id` and return its file name.
pub fn write_snapshot(dir: &Path, checkpoint_id: &str, sequence: u64, timestamp: u64, state: Value) -> Result<String> {
    let checksum = checksum_value(&state)?;
    let snap = Snapshot {
        checkpoint_id: checkpoint_id.to_string(),
        sequence,
        timestamp,
        state,
        checksum,
    };
    let name = format!("{}{}", checkpoint_id, SNAPSHOT_SUFFIX);
    write_synced(&dir.join(&name), &serde_json::to_vec(&snap)?)?;
    Ok(name)
}

fn write_synced(path: &Path, body: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(body)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn with_snapshot(dir: &Path) -> JournalCheckpoint {
        let id = checkpoint_id(3, 1000);
        let snap = write_snapshot(dir, &id, 3, 1000, json!({"positions": {"AAPL": 10}})).unwrap();
        let cp = JournalCheckpoint::new(id, 3, 1000, Some(snap), 3, vec!["segment-000000000001".into()]).unwrap();
        cp.write(dir).unwrap();
        cp
    }

    #[test]
    fn test_snapshot_loads() {
        let dir = TempDir::new().unwrap();
        let cp = with_snapshot(dir.path());
        assert_eq!(cp.file_name(), "checkpoint-000000000003-1000.checkpoint");
        let state = cp.load_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(state["positions"]["AAPL"], 10);
    }

    #[test]
    fn test_stateless_checkpoint_is_usable() {
        let dir = TempDir::new().unwrap();
        let cp = JournalCheckpoint::new(checkpoint_id(5, 1), 5, 1, None, 5, vec![]).unwrap();
        assert!(cp.load_snapshot(dir.path()).unwrap().is_none());
        assert!(cp.is_usable(dir.path()));
    }

    #[test]
    fn test_missing_snapshot_is_unusable() {
        let dir = TempDir::new().unwrap();
        let cp = with_snapshot(dir.path());
        fs::remove_file(dir.path().join(cp.snapshot_path.as_ref().unwrap())).unwrap();
        assert!(matches!(
            cp.load_snapshot(dir.path()),
            Err(JournalError::SnapshotUnusable { .. })
        ));
        // Checkpoint metadata itself stays on disk.
        assert!(dir.path().join(cp.file_name()).exists());
    }

    #[test]
    fn test_corrupt_snapshot_is_unusable() {
        let dir = TempDir::new().unwrap();
        let cp = with_snapshot(dir.path());
        let path = dir.path().join(cp.snapshot_path.as_ref().unwrap());
        let raw = fs::read_to_string(&path).unwrap().replace("10", "11");
        fs::write(&path, raw).unwrap();
        assert!(!cp.is_usable(dir.path()));
    }

    #[test]
    fn test_tampered_checkpoint_fails_verify() {
        let dir = TempDir::new().unwrap();
        let mut cp = with_snapshot(dir.path());
        cp.sequence = 4;
        assert!(cp.verify().is_err());
    }

    #[test]
    fn test_remove_files() {
        let dir = TempDir::new().unwrap();
        let cp = with_snapshot(dir.path());
        cp.remove_files(dir.path()).unwrap();
        assert!(!dir.path().join(cp.file_name()).exists());
        cp.remove_files(dir.path()).unwrap();
    }
}
