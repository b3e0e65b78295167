//! Journal entries and their content checksum.
//!
//! An entry is written as one JSON object per line. The checksum is the first
//! 16 hex characters of SHA-256 over the canonical JSON of every other field.
//! `serde_json` maps are key-ordered, so re-serializing a parsed entry yields
//! the same bytes that were hashed on write.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{JournalError, Result};

pub const ENTRY_VERSION: u32 = 1;
pub const CHECKSUM_LEN: usize = 16;

/// Caller-supplied event metadata. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl EventMetadata {
    pub fn with_source(source: &str) -> Self {
        Self {
            source: Some(source.to_string()),
            ..Default::default()
        }
    }

    pub fn correlated(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub sequence: u64,
    /// Epoch milliseconds at append time.
    pub timestamp: u64,
    pub event_type: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
    pub checksum: String,
    pub version: u32,
}

/// The checksummed view of an entry: everything except the checksum itself.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryBody<'a> {
    sequence: u64,
    timestamp: u64,
    event_type: &'a str,
    payload: &'a Value,
    metadata: &'a EventMetadata,
    version: u32,
}

impl JournalEntry {
    pub fn new(sequence: u64, timestamp: u64, event_type: &str, payload: Value, metadata: EventMetadata) -> Self {
        let mut entry = Self {
            sequence,
            timestamp,
            event_type: event_type.to_string(),
            payload,
            metadata,
            checksum: String::new(),
            version: ENTRY_VERSION,
        };
        entry.checksum = entry.compute_checksum();
        entry
    }

    pub fn compute_checksum(&self) -> String {
        let body = EntryBody {
            sequence: self.sequence,
            timestamp: self.timestamp,
            event_type: &self.event_type,
            payload: &self.payload,
            metadata: &self.metadata,
            version: self.version,
        };
        // Value-based serialization of a derived struct cannot fail.
        let canonical = serde_json::to_value(&body)
            .map(|v| v.to_string())
            .unwrap_or_default();
        checksum_hex(canonical.as_bytes())
    }

    pub fn verify_checksum(&self) -> Result<()> {
        let computed = self.compute_checksum();
        if computed != self.checksum {
            return Err(JournalError::ChecksumMismatch {
                sequence: self.sequence,
                stored: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }

    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line and verify its checksum.
    pub fn parse_line(line: &str) -> Result<Self> {
        let entry: JournalEntry = serde_json::from_str(line.trim_end_matches(['\n', '\r']))?;
        entry.verify_checksum()?;
        Ok(entry)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Truncated SHA-256 hex digest shared by entries, checkpoints and snapshots.
pub fn checksum_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(CHECKSUM_LEN);
    digest
}

/// Checksum over the canonical JSON of any serializable value.
pub fn checksum_value<T: Serialize>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value)?.to_string();
    Ok(checksum_hex(canonical.as_bytes()))
}
