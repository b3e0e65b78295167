use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::journal::replica::ReplicaRole;
use crate::ring::{EventPriority, WaitStrategy};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => default,
    }
}

/// Durable journal settings.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub dir: PathBuf,
    /// Rotate once the open segment reaches this many bytes.
    pub segment_max_bytes: u64,
    /// Rotate once the open segment holds this many entries.
    pub segment_max_entries: u64,
    /// fsync after every append.
    pub flush_on_write: bool,
    /// Zero disables the periodic checkpoint task.
    pub checkpoint_interval: Duration,
    pub max_checkpoints: usize,
    pub replica_id: String,
    pub role: ReplicaRole,
    /// Zero disables the periodic replica sync task.
    pub sync_interval: Duration,
    pub max_replay_batch_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/journal"),
            segment_max_bytes: 64 * 1024 * 1024,
            segment_max_entries: 100_000,
            flush_on_write: true,
            checkpoint_interval: Duration::from_secs(60),
            max_checkpoints: 10,
            replica_id: format!("replica-{}", std::process::id()),
            role: ReplicaRole::Standalone,
            sync_interval: Duration::from_secs(5),
            max_replay_batch_size: 1000,
        }
    }
}

impl JournalConfig {
    /// Config rooted at `dir` with every other field defaulted.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            dir: std::env::var("JOURNAL_DIR").map(PathBuf::from).unwrap_or(d.dir),
            segment_max_bytes: env_parse("JOURNAL_SEGMENT_MAX_BYTES", d.segment_max_bytes),
            segment_max_entries: env_parse("JOURNAL_SEGMENT_MAX_ENTRIES", d.segment_max_entries),
            flush_on_write: env_bool("JOURNAL_FLUSH_ON_WRITE", d.flush_on_write),
            checkpoint_interval: Duration::from_secs(env_parse(
                "JOURNAL_CHECKPOINT_SECS",
                d.checkpoint_interval.as_secs(),
            )),
            max_checkpoints: env_parse("JOURNAL_MAX_CHECKPOINTS", d.max_checkpoints),
            replica_id: std::env::var("JOURNAL_REPLICA_ID").unwrap_or(d.replica_id),
            role: std::env::var("JOURNAL_ROLE")
                .ok()
                .and_then(|v| ReplicaRole::parse(&v))
                .unwrap_or(d.role),
            sync_interval: Duration::from_secs(env_parse("JOURNAL_SYNC_SECS", d.sync_interval.as_secs())),
            max_replay_batch_size: env_parse("JOURNAL_MAX_REPLAY_BATCH", d.max_replay_batch_size),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.segment_max_bytes == 0 {
            return Err("segment_max_bytes must be positive".to_string());
        }
        if self.segment_max_entries == 0 {
            return Err("segment_max_entries must be positive".to_string());
        }
        if self.max_replay_batch_size == 0 {
            return Err("max_replay_batch_size must be positive".to_string());
        }
        Ok(())
    }
}

/// Priority ring buffer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RingBufferConfig {
    /// Slots per lane; must be a power of two.
    pub capacity: usize,
    /// Per-lane capacity overrides.
    pub lane_capacity: BTreeMap<EventPriority, usize>,
    pub wait_strategy: WaitStrategy,
    /// Upper bound on entries handed to a batch handler at once.
    pub batch_size: usize,
}

impl Default for RingBufferConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl RingBufferConfig {
    pub fn new(capacity: usize, wait_strategy: WaitStrategy, batch_size: usize) -> Self {
        Self {
            capacity,
            lane_capacity: BTreeMap::new(),
            wait_strategy,
            batch_size,
        }
    }

    /// Large lanes, busy-spin consumers, large batches.
    pub fn high_throughput() -> Self {
        Self::new(65_536, WaitStrategy::BusySpin, 100)
    }

    /// Small lanes, busy-spin consumers, one entry at a time.
    pub fn low_latency() -> Self {
        Self::new(1024, WaitStrategy::BusySpin, 1)
    }

    pub fn balanced() -> Self {
        Self::new(8192, WaitStrategy::Yielding, 10)
    }

    /// Sleeping consumers that drain in large batches.
    pub fn low_cpu() -> Self {
        Self::new(4096, WaitStrategy::Sleeping, 100)
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "high_throughput" => Some(Self::high_throughput()),
            "low_latency" => Some(Self::low_latency()),
            "balanced" => Some(Self::balanced()),
            "low_cpu" => Some(Self::low_cpu()),
            _ => None,
        }
    }

    pub fn with_lane_capacity(mut self, priority: EventPriority, capacity: usize) -> Self {
        self.lane_capacity.insert(priority, capacity);
        self
    }

    pub fn capacity_for(&self, priority: EventPriority) -> usize {
        self.lane_capacity.get(&priority).copied().unwrap_or(self.capacity)
    }

    pub fn from_env() -> Self {
        let base = std::env::var("RING_PRESET")
            .ok()
            .and_then(|p| Self::preset(&p))
            .unwrap_or_default();
        Self {
            capacity: env_parse("RING_CAPACITY", base.capacity),
            lane_capacity: base.lane_capacity,
            wait_strategy: std::env::var("RING_WAIT")
                .ok()
                .and_then(|v| WaitStrategy::parse(&v))
                .unwrap_or(base.wait_strategy),
            batch_size: env_parse("RING_BATCH", base.batch_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_power_of_two() {
        for name in ["high_throughput", "low_latency", "balanced", "low_cpu"] {
            let cfg = RingBufferConfig::preset(name).unwrap();
            assert!(cfg.capacity.is_power_of_two(), "{name}");
            assert!(cfg.batch_size >= 1);
        }
    }

    #[test]
    fn test_low_latency_delivers_singly() {
        let cfg = RingBufferConfig::low_latency();
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.wait_strategy, WaitStrategy::BusySpin);
    }

    #[test]
    fn test_lane_override() {
        let cfg = RingBufferConfig::balanced().with_lane_capacity(EventPriority::Critical, 64);
        assert_eq!(cfg.capacity_for(EventPriority::Critical), 64);
        assert_eq!(cfg.capacity_for(EventPriority::System), 8192);
    }

    #[test]
    fn test_journal_config_validation() {
        let mut cfg = JournalConfig::new("/tmp/j");
        assert!(cfg.validate().is_ok());
        cfg.segment_max_entries = 0;
        assert!(cfg.validate().is_err());
    }
}
