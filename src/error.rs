use thiserror::Error;

use crate::journal::JournalState;
use crate::ring::EventPriority;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("journal is closed")]
    Closed,

    #[error("journal is busy ({0:?})")]
    Busy(JournalState),

    #[error("checksum mismatch at sequence {sequence}: stored {stored}, computed {computed}")]
    ChecksumMismatch {
        sequence: u64,
        stored: String,
        computed: String,
    },

    #[error("sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("segment {segment_id} is missing its file")]
    SegmentMissing { segment_id: String },

    #[error("checkpoint {checkpoint_id} is unusable: {reason}")]
    SnapshotUnusable { checkpoint_id: String, reason: String },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("replica not found: {0}")]
    ReplicaNotFound(String),

    #[error("replica {replica_id} lags by {lag} entries (max {max_lag}); promotion refused")]
    PromotionRefused {
        replica_id: String,
        lag: u64,
        max_lag: u64,
    },

    #[error("replica sync requires the primary role")]
    NotPrimary,

    #[error("replay handler failed: {0}")]
    Handler(anyhow::Error),

    #[error("invalid journal config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, JournalError>;

#[derive(Error, Debug)]
pub enum RingBufferError {
    #[error("lane capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("{priority:?} lane is full; publish rejected")]
    BackpressureRejected { priority: EventPriority },

    #[error("consumer already registered: {0}")]
    DuplicateConsumer(String),

    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),

    #[error("failed to spawn consumer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl RingBufferError {
    pub fn is_backpressure(&self) -> bool {
        matches!(self, RingBufferError::BackpressureRejected { .. })
    }
}
