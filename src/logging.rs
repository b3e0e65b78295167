//! Structured logging for the journal and dispatch core.
//!
//! Design goals:
//! 1. Multi-level granularity (TRACE → FATAL)
//! 2. Subsystem categories for filtering (journal, ring, replica, ...)
//! 3. One JSON object per line so runs can be grepped, diffed and replayed
//! 4. Correlation fields (segment, checkpoint, consumer) promoted to the top level

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Journal,    // Append path, open/close
    Segment,    // Rotation, missing files
    Checkpoint, // Checkpoints, snapshots, retention
    Recovery,   // Startup validation and truncation
    Replay,     // Replay passes
    Replica,    // Follower lag, sync, promotion
    Ring,       // Publish path, backpressure
    Consumer,   // Poll loops, handler failures
    System,     // Startup, shutdown
    Profile,    // Performance profiling
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Journal => "journal",
            Domain::Segment => "segment",
            Domain::Checkpoint => "checkpoint",
            Domain::Recovery => "recovery",
            Domain::Replay => "replay",
            Domain::Replica => "replica",
            Domain::Ring => "ring",
            Domain::Consumer => "consumer",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sequence counter for ordering
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    sinks: Option<FileSinks>,
}

#[derive(Debug)]
struct FileSinks {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
    metrics: Mutex<BufWriter<File>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        // File sinks are opt-in; a library embedded in tests should not litter the cwd.
        let sinks = std::env::var("LOG_DIR")
            .ok()
            .and_then(|base| open_file_sinks(PathBuf::from(base), &run_id));
        RunContext { run_id, sinks }
    })
}

fn open_file_sinks(base: PathBuf, run_id: &str) -> Option<FileSinks> {
    let run_dir = base.join(run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
        return None;
    }

    let _ = std::fs::write(
        run_dir.join("manifest.json"),
        json!({
            "run_id": run_id,
            "ts": ts_now(),
            "pid": process::id(),
            "log_dir": run_dir.to_string_lossy(),
        })
        .to_string(),
    );

    let open = |name: &str| match File::create(run_dir.join(name)) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", name, err);
            None
        }
    };

    Some(FileSinks {
        events: open("events.jsonl")?,
        trace: open("trace.jsonl")?,
        metrics: open("metrics.jsonl")?,
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in [
        "segment_id",
        "checkpoint_id",
        "replica_id",
        "consumer_id",
        "priority",
        "msg",
    ] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds (for replay correlation)
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(sinks) = &ctx.sinks {
        if event.starts_with("metrics") {
            write_line(&sinks.metrics, &line);
        }
        match level {
            Level::Trace | Level::Debug => write_line(&sinks.trace, &line),
            _ => write_line(&sinks.events, &line),
        }
    }
    println!("{}", line);
}

// =============================================================================
// Journal Logs
// =============================================================================

pub fn log_rotation(segment_id: &str, start: u64, end: u64, entries: u64, bytes: u64) {
    log(
        Level::Info,
        Domain::Segment,
        "segment_rotated",
        obj(&[
            ("segment_id", v_str(segment_id)),
            ("start_sequence", json!(start)),
            ("end_sequence", json!(end)),
            ("entry_count", json!(entries)),
            ("file_size", json!(bytes)),
        ]),
    );
}

pub fn log_segment_missing(segment_id: &str, path: &str) {
    log(
        Level::Warn,
        Domain::Segment,
        "segment_missing",
        obj(&[
            ("segment_id", v_str(segment_id)),
            ("path", v_str(path)),
            ("msg", v_str("index entry without file dropped")),
        ]),
    );
}

pub fn log_sequence_hole(expected: u64, found: u64) {
    log(
        Level::Error,
        Domain::Recovery,
        "sequence_hole",
        obj(&[
            ("expected", json!(expected)),
            ("found", json!(found)),
            ("msg", v_str("reads across this range will fail")),
        ]),
    );
}

/// Log the outcome of validating the open segment on startup.
pub fn log_recovery_truncate(segment_id: &str, valid_entries: u64, kept_bytes: u64, dropped_bytes: u64, reason: &str) {
    log(
        Level::Warn,
        Domain::Recovery,
        "open_segment_truncated",
        obj(&[
            ("segment_id", v_str(segment_id)),
            ("valid_entries", json!(valid_entries)),
            ("kept_bytes", json!(kept_bytes)),
            ("dropped_bytes", json!(dropped_bytes)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_checkpoint(checkpoint_id: &str, sequence: u64, segments: usize, has_snapshot: bool) {
    log(
        Level::Info,
        Domain::Checkpoint,
        "checkpoint_created",
        obj(&[
            ("checkpoint_id", v_str(checkpoint_id)),
            ("sequence", json!(sequence)),
            ("segments", json!(segments)),
            ("has_snapshot", json!(has_snapshot)),
        ]),
    );
}

pub fn log_snapshot_unusable(checkpoint_id: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Checkpoint,
        "snapshot_unusable",
        obj(&[("checkpoint_id", v_str(checkpoint_id)), ("reason", v_str(reason))]),
    );
}

pub fn log_compaction(before_sequence: u64, removed: usize, freed_bytes: u64) {
    log(
        Level::Info,
        Domain::Segment,
        "compaction",
        obj(&[
            ("before_sequence", json!(before_sequence)),
            ("segments_removed", json!(removed)),
            ("freed_bytes", json!(freed_bytes)),
        ]),
    );
}

pub fn log_replica_lag(replica_id: &str, last_sync: u64, lag: u64, healthy: bool) {
    log(
        Level::Debug,
        Domain::Replica,
        "replica_lag",
        obj(&[
            ("replica_id", v_str(replica_id)),
            ("last_sync_sequence", json!(last_sync)),
            ("lag", json!(lag)),
            ("healthy", json!(healthy)),
        ]),
    );
}

// =============================================================================
// Ring Buffer Logs
// =============================================================================

pub fn log_backpressure(priority: &str, requested: u64, cursor: u64, min_gating: u64, capacity: u64) {
    log(
        Level::Debug,
        Domain::Ring,
        "backpressure_rejected",
        obj(&[
            ("priority", v_str(priority)),
            ("requested", json!(requested)),
            ("cursor", json!(cursor)),
            ("min_gating", json!(min_gating)),
            ("capacity", json!(capacity)),
        ]),
    );
}

pub fn log_handler_failure(consumer_id: &str, priority: &str, sequence: u64, error: &str) {
    log(
        Level::Warn,
        Domain::Consumer,
        "handler_failed",
        obj(&[
            ("consumer_id", v_str(consumer_id)),
            ("priority", v_str(priority)),
            ("sequence", json!(sequence)),
            ("error", v_str(error)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    domain: Domain,
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(domain: Domain, label: &'static str) -> Self {
        let enabled = Self::should_sample();
        Self {
            domain,
            label,
            context: None,
            started: Instant::now(),
            enabled,
        }
    }

    pub fn with_context(domain: Domain, label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            domain,
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("subsystem".to_string(), v_str(self.domain.as_str()));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_split_fields_promotes_correlation_ids() {
        let fields = obj(&[
            ("segment_id", v_str("segment-000000000001")),
            ("consumer_id", v_str("risk")),
            ("entry_count", json!(3)),
        ]);
        let (top, data) = split_fields(fields);
        assert_eq!(top.get("segment_id").unwrap(), "segment-000000000001");
        assert_eq!(top.get("consumer_id").unwrap(), "risk");
        assert!(data.contains_key("entry_count"));
        assert!(!data.contains_key("segment_id"));
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
