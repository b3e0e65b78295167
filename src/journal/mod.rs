//! Segmented, checksum-verified, crash-recoverable event journal.
//!
//! ```text
//! journal-index.json                      root of truth, rewritten atomically
//! segment-000000000001-000000100000.journal   closed, immutable
//! segment-000000100001-open.journal           the single writable segment
//! checkpoint-000000100000-<ms>.checkpoint     checkpoint metadata
//! checkpoint-000000100000-<ms>.snapshot       optional state snapshot
//! ```
//!
//! The journal is a single-writer structure: sequence assignment, the file
//! write and the segment bookkeeping happen under one lock. Replay, sync and
//! recovery take the journal out of `Idle` through a state gate, so at most
//! one such activity runs at a time and appends are refused meanwhile.

pub mod checkpoint;
pub mod entry;
pub mod index;
pub mod recovery;
pub mod replay;
pub mod replica;
pub mod segment;
pub mod timers;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::JournalConfig;
use crate::error::{JournalError, Result};
use crate::logging::{
    log, log_checkpoint, log_compaction, log_replica_lag, log_rotation, log_segment_missing,
    log_sequence_hole, log_snapshot_unusable, obj, ts_epoch_ms, v_str, Domain, Level, ProfileScope,
};

use checkpoint::JournalCheckpoint;
use entry::{EventMetadata, JournalEntry};
use index::JournalIndex;
use replay::{ReplayIter, ReplayOptions, ReplayStart, SegmentCursor};
use replica::{retry_blocking, ReplicaCoordinator, ReplicaInfo, ReplicaRole, ReplicaTransport, RetryConfig, SyncReport};
use segment::{truncate_file, JournalSegment, SegmentWriter};

/// Activity gate. At most one non-`Idle` activity at a time; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalState {
    Idle,
    Writing,
    Replaying,
    Syncing,
    Recovering,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JournalStats {
    pub last_sequence: u64,
    pub first_sequence: Option<u64>,
    pub segment_count: usize,
    pub total_bytes: u64,
    pub checkpoint_count: usize,
    pub appends: u64,
    pub rotations: u64,
    pub replays: u64,
    pub compactions: u64,
    pub checkpoints_created: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub segments_verified: usize,
    pub entries_verified: u64,
    pub first_sequence: Option<u64>,
    pub last_sequence: u64,
}

#[derive(Debug, Default)]
struct Counters {
    appends: u64,
    rotations: u64,
    replays: u64,
    compactions: u64,
    checkpoints: u64,
}

struct Inner {
    state: JournalState,
    index: JournalIndex,
    writer: Option<SegmentWriter>,
    counters: Counters,
}

pub struct Journal {
    config: JournalConfig,
    inner: Mutex<Inner>,
    replicas: Mutex<ReplicaCoordinator>,
}

/// Returns the journal to `Idle` when an activity ends, unless it was closed meanwhile.
pub(crate) struct GateGuard<'a> {
    journal: &'a Journal,
    activity: JournalState,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.journal.lock();
        if inner.state == self.activity {
            inner.state = JournalState::Idle;
        }
    }
}

impl Journal {
    /// Open (or create) the journal under `config.dir` and run startup recovery.
    pub fn open(config: JournalConfig) -> Result<Self> {
        config.validate().map_err(JournalError::InvalidConfig)?;
        fs::create_dir_all(&config.dir)?;
        let _scope = ProfileScope::with_context(
            Domain::Recovery,
            "journal_open",
            &[("dir", v_str(&config.dir.to_string_lossy()))],
        );

        let now = ts_epoch_ms();
        let mut index = match JournalIndex::load(&config.dir)? {
            Some(index) => index,
            None => match JournalIndex::rebuild_from_dir(&config.dir, &config.replica_id, now)? {
                Some(rebuilt) => {
                    log(
                        Level::Warn,
                        Domain::Recovery,
                        "index_rebuilt",
                        obj(&[("segments", json!(rebuilt.segments.len()))]),
                    );
                    rebuilt
                }
                None => JournalIndex::new(&config.replica_id, now),
            },
        };

        Self::recover(&config.dir, &mut index, now)?;
        index.persist(&config.dir, now)?;

        let writer = match index.open_segment() {
            Some(open) => Some(SegmentWriter::open(&open.path_in(&config.dir))?),
            None => None,
        };

        log(
            Level::Info,
            Domain::Journal,
            "journal_opened",
            obj(&[
                ("dir", v_str(&config.dir.to_string_lossy())),
                ("last_sequence", json!(index.last_sequence)),
                ("segments", json!(index.segments.len())),
                ("checkpoints", json!(index.checkpoints.len())),
            ]),
        );

        let replicas = ReplicaCoordinator::new(config.role);
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                state: JournalState::Idle,
                index,
                writer,
                counters: Counters::default(),
            }),
            replicas: Mutex::new(replicas),
        })
    }

    /// Reconcile the index with the directory and validate the open segment.
    fn recover(dir: &Path, index: &mut JournalIndex, now: u64) -> Result<()> {
        Self::adopt_unindexed(dir, index, now)?;
        index.segments.retain(|seg| {
            if seg.is_open || seg.path_in(dir).exists() {
                return true;
            }
            log_segment_missing(&seg.segment_id, &seg.file_path);
            false
        });
        index.segments.sort_by_key(|s| s.start_sequence);

        let closed_end = index
            .segments
            .iter()
            .filter(|s| !s.is_open)
            .map(|s| s.end_sequence)
            .max();

        // A hole left by a missing segment is reported here and fails any
        // replay or read that spans it.
        let mut expected: Option<u64> = None;
        for seg in index.segments.iter().filter(|s| !s.is_open) {
            if let Some(exp) = expected {
                if seg.start_sequence != exp {
                    log_sequence_hole(exp, seg.start_sequence);
                }
            }
            expected = Some(seg.end_sequence + 1);
        }

        if index.open_segment().is_none() {
            let start = closed_end.unwrap_or(index.last_sequence) + 1;
            index.segments.push(JournalSegment::new_open(start, now));
        }

        let open = index
            .open_segment_mut()
            .ok_or_else(|| JournalError::InvalidConfig("no open segment".to_string()))?;
        if let Some(end) = closed_end {
            if open.start_sequence <= end {
                return Err(JournalError::SequenceGap {
                    expected: end + 1,
                    found: open.start_sequence,
                });
            }
            if open.start_sequence != end + 1 {
                log_sequence_hole(end + 1, open.start_sequence);
            }
        }
        let path = open.path_in(dir);
        if !path.exists() {
            if open.entry_count > 0 {
                log_segment_missing(&open.segment_id, &open.file_path);
            }
            fs::File::create(&path)?;
        }
        let outcome = recovery::recover_open_segment(dir, open)?;
        let last = open.end_sequence;

        log(
            Level::Info,
            Domain::Recovery,
            "open_segment_recovered",
            obj(&[
                ("segment_id", v_str(&open.segment_id)),
                ("valid_entries", json!(outcome.valid_entries)),
                ("truncated_bytes", json!(outcome.truncated_bytes)),
                ("last_sequence", json!(last)),
            ]),
        );
        index.last_sequence = last;
        Ok(())
    }

    /// Pick up segment files a crash left out of the index. A rotation that
    /// renamed the open segment but never persisted the index leaves the
    /// indexed open file missing, its closed twin on disk and possibly the
    /// next open file beside it.
    fn adopt_unindexed(dir: &Path, index: &mut JournalIndex, now: u64) -> Result<()> {
        let on_disk = index::scan_segments(dir, now)?;

        if let Some(open) = index.open_segment() {
            let sealed_twin = on_disk
                .iter()
                .any(|d| !d.is_open && d.start_sequence == open.start_sequence);
            if sealed_twin && !open.path_in(dir).exists() {
                let start = open.start_sequence;
                index.segments.retain(|s| !(s.is_open && s.start_sequence == start));
            }
        }

        for found in on_disk {
            if index.segments.iter().any(|s| s.file_path == found.file_path) {
                continue;
            }
            if found.is_open {
                let newer = index
                    .segments
                    .iter()
                    .all(|s| s.is_open || s.end_sequence < found.start_sequence);
                if index.open_segment().is_some() || !newer {
                    continue;
                }
            } else if index.segments.iter().any(|s| !s.is_open && s.start_sequence == found.start_sequence) {
                continue;
            }
            log(
                Level::Warn,
                Domain::Recovery,
                "segment_adopted",
                obj(&[
                    ("segment_id", v_str(&found.segment_id)),
                    ("path", v_str(&found.file_path)),
                    ("is_open", json!(found.is_open)),
                ]),
            );
            index.last_sequence = index.last_sequence.max(found.end_sequence);
            index.segments.push(found);
        }
        index.segments.sort_by_key(|s| s.start_sequence);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_replicas(&self) -> MutexGuard<'_, ReplicaCoordinator> {
        self.replicas.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, activity: JournalState) -> Result<GateGuard<'_>> {
        let mut inner = self.lock();
        match inner.state {
            JournalState::Idle => {
                inner.state = activity;
                Ok(GateGuard { journal: self, activity })
            }
            JournalState::Closed => Err(JournalError::Closed),
            other => Err(JournalError::Busy(other)),
        }
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn state(&self) -> JournalState {
        self.lock().state
    }

    pub fn last_sequence(&self) -> u64 {
        self.lock().index.last_sequence
    }

    pub fn segments(&self) -> Vec<JournalSegment> {
        self.lock().index.segments.clone()
    }

    pub fn checkpoints(&self) -> Vec<JournalCheckpoint> {
        self.lock().index.checkpoints.clone()
    }

    // =========================================================================
    // Append path
    // =========================================================================

    /// Durably append one event and return its sequence.
    pub fn append(&self, event_type: &str, payload: Value, metadata: EventMetadata) -> Result<u64> {
        let mut inner = self.lock();
        match inner.state {
            JournalState::Idle => {}
            JournalState::Closed => return Err(JournalError::Closed),
            other => return Err(JournalError::Busy(other)),
        }
        inner.state = JournalState::Writing;
        let result = self.append_locked(&mut inner, event_type, payload, metadata);
        if inner.state == JournalState::Writing {
            inner.state = JournalState::Idle;
        }
        result
    }

    pub fn append_typed<T: Serialize>(&self, event_type: &str, payload: &T, metadata: EventMetadata) -> Result<u64> {
        self.append(event_type, serde_json::to_value(payload)?, metadata)
    }

    fn append_locked(&self, inner: &mut Inner, event_type: &str, payload: Value, metadata: EventMetadata) -> Result<u64> {
        let sequence = inner.index.last_sequence + 1;
        let entry = JournalEntry::new(sequence, ts_epoch_ms(), event_type, payload, metadata);
        let line = entry.to_line()?;

        let writer = self.ensure_writer(inner)?;
        if let Err(e) = writer.append(&line, self.config.flush_on_write) {
            // Cut any partial line so the next append starts on a clean boundary.
            let path = writer.path().to_path_buf();
            let clean_len = inner.index.open_segment().map(|open| open.file_size).unwrap_or(0);
            if let Err(cleanup) = truncate_file(&path, clean_len) {
                self.fence(inner, &e, &cleanup);
            }
            return Err(e.into());
        }

        let open = inner
            .index
            .open_segment_mut()
            .ok_or_else(|| JournalError::InvalidConfig("no open segment".to_string()))?;
        open.record_append(sequence, line.len() as u64);
        let rotate =
            open.file_size >= self.config.segment_max_bytes || open.entry_count >= self.config.segment_max_entries;
        inner.index.last_sequence = sequence;
        inner.counters.appends += 1;

        if rotate {
            self.rotate_locked(inner)?;
        }
        Ok(sequence)
    }

    /// A torn line could not be cut off, so anything appended after it would
    /// be lost to recovery. Stop writing until the journal is reopened.
    fn fence(&self, inner: &mut Inner, write_error: &std::io::Error, cleanup_error: &std::io::Error) {
        inner.writer = None;
        inner.state = JournalState::Closed;
        log(
            Level::Fatal,
            Domain::Journal,
            "journal_fenced",
            obj(&[
                ("next_sequence", json!(inner.index.last_sequence + 1)),
                ("write_error", v_str(&write_error.to_string())),
                ("cleanup_error", v_str(&cleanup_error.to_string())),
                ("msg", v_str("torn tail left in open segment; reopen to recover")),
            ]),
        );
    }

    fn ensure_writer<'a>(&self, inner: &'a mut Inner) -> Result<&'a mut SegmentWriter> {
        if inner.writer.is_none() {
            let open = inner
                .index
                .open_segment()
                .ok_or_else(|| JournalError::InvalidConfig("no open segment".to_string()))?;
            inner.writer = Some(SegmentWriter::open(&open.path_in(&self.config.dir))?);
        }
        inner
            .writer
            .as_mut()
            .ok_or_else(|| JournalError::InvalidConfig("segment writer unavailable".to_string()))
    }

    /// Seal the open segment under its closed name and start a new one.
    fn rotate_locked(&self, inner: &mut Inner) -> Result<()> {
        let dir = &self.config.dir;
        if let Some(mut writer) = inner.writer.take() {
            writer.sync()?;
        }
        let now = ts_epoch_ms();
        let pos = inner
            .index
            .segments
            .iter()
            .position(|s| s.is_open)
            .ok_or_else(|| JournalError::InvalidConfig("no open segment".to_string()))?;

        let mut sealed = inner.index.segments[pos].clone();
        let open_path = sealed.path_in(dir);
        sealed.seal(now);
        fs::rename(&open_path, sealed.path_in(dir))?;

        let next = JournalSegment::new_open(sealed.end_sequence + 1, now);
        log_rotation(
            &sealed.segment_id,
            sealed.start_sequence,
            sealed.end_sequence,
            sealed.entry_count,
            sealed.file_size,
        );
        let next_path = next.path_in(dir);
        inner.index.segments[pos] = sealed;
        inner.index.segments.push(next);
        inner.counters.rotations += 1;
        inner.index.persist(dir, now)?;
        // Left unset on failure; the next append opens it lazily.
        inner.writer = Some(SegmentWriter::open(&next_path)?);
        Ok(())
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Record the current sequence, optionally with a state snapshot.
    pub fn create_checkpoint(&self, snapshot_state: Option<Value>) -> Result<JournalCheckpoint> {
        let _scope = ProfileScope::new(Domain::Checkpoint, "create_checkpoint");
        let mut inner = self.lock();
        match inner.state {
            JournalState::Idle => {}
            JournalState::Closed => return Err(JournalError::Closed),
            other => return Err(JournalError::Busy(other)),
        }
        if let Some(writer) = inner.writer.as_mut() {
            writer.sync()?;
        }

        let dir = &self.config.dir;
        let sequence = inner.index.last_sequence;
        let mut now = ts_epoch_ms();
        while inner.index.checkpoint(&checkpoint::checkpoint_id(sequence, now)).is_some() {
            now += 1;
        }
        let id = checkpoint::checkpoint_id(sequence, now);

        let snapshot_path = match snapshot_state {
            Some(state) => Some(checkpoint::write_snapshot(dir, &id, sequence, now, state)?),
            None => None,
        };
        let covered: Vec<&JournalSegment> = inner
            .index
            .segments
            .iter()
            .filter(|s| !s.is_empty() && s.start_sequence <= sequence)
            .collect();
        let entry_count = covered.iter().map(|s| s.entry_count).sum();
        let segment_ids = covered.iter().map(|s| s.segment_id.clone()).collect();

        let cp = JournalCheckpoint::new(id, sequence, now, snapshot_path, entry_count, segment_ids)?;
        cp.write(dir)?;
        inner.index.checkpoints.push(cp.clone());

        while inner.index.checkpoints.len() > self.config.max_checkpoints.max(1) {
            let oldest = inner.index.checkpoints.remove(0);
            oldest.remove_files(dir)?;
            log(
                Level::Debug,
                Domain::Checkpoint,
                "checkpoint_retired",
                obj(&[("checkpoint_id", v_str(&oldest.checkpoint_id))]),
            );
        }
        inner.index.persist(dir, now)?;
        inner.counters.checkpoints += 1;

        log_checkpoint(&cp.checkpoint_id, cp.sequence, cp.segment_ids.len(), cp.snapshot_path.is_some());
        Ok(cp)
    }

    /// Newest checkpoint whose snapshot resolves; unusable ones are skipped, not deleted.
    pub fn latest_usable_checkpoint(&self) -> Option<JournalCheckpoint> {
        self.restore_latest().ok().flatten().map(|(cp, _)| cp)
    }

    /// Newest usable checkpoint together with its decoded snapshot state.
    pub fn restore_latest(&self) -> Result<Option<(JournalCheckpoint, Option<Value>)>> {
        let (mut checkpoints, last) = {
            let inner = self.lock();
            if inner.state == JournalState::Closed {
                return Err(JournalError::Closed);
            }
            (inner.index.checkpoints.clone(), inner.index.last_sequence)
        };
        checkpoints.sort_by_key(|c| (c.sequence, c.timestamp));
        for cp in checkpoints.into_iter().rev() {
            if cp.sequence > last {
                log_snapshot_unusable(&cp.checkpoint_id, "checkpoint is ahead of the recovered journal");
                continue;
            }
            match cp.load_snapshot(&self.config.dir) {
                Ok(state) => return Ok(Some((cp, state))),
                Err(e) => log_snapshot_unusable(&cp.checkpoint_id, &e.to_string()),
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Replay and reads
    // =========================================================================

    /// Start a replay pass. The journal refuses appends until the iterator is dropped.
    pub fn replay_iter(&self, options: &ReplayOptions) -> Result<ReplayIter<'_>> {
        let gate = self.enter(JournalState::Replaying)?;
        let (segments, last, from) = {
            let inner = self.lock();
            let from = match &options.start {
                ReplayStart::Sequence(seq) => (*seq).max(1),
                ReplayStart::Checkpoint(id) => {
                    let cp = inner
                        .index
                        .checkpoint(id)
                        .ok_or_else(|| JournalError::CheckpointNotFound(id.clone()))?;
                    if let Err(e) = cp.load_snapshot(&self.config.dir) {
                        log_snapshot_unusable(id, &e.to_string());
                        return Err(e);
                    }
                    cp.sequence + 1
                }
            };
            (inner.index.segments.clone(), inner.index.last_sequence, from)
        };
        let to = options.to_sequence.map_or(last, |t| t.min(last));
        let cursor = SegmentCursor::new(self.config.dir.clone(), &segments, from, to);
        Ok(ReplayIter::new(cursor, options.event_types.clone(), Some(gate)))
    }

    /// Replay entries one at a time, in sequence order. Returns the number delivered.
    pub fn replay(
        &self,
        options: &ReplayOptions,
        mut on_entry: impl FnMut(&JournalEntry) -> anyhow::Result<()>,
    ) -> Result<u64> {
        let _scope = ProfileScope::new(Domain::Replay, "replay");
        let mut iter = self.replay_iter(options)?;
        for entry in iter.by_ref() {
            let entry = entry?;
            on_entry(&entry).map_err(JournalError::Handler)?;
        }
        let progress = iter.progress();
        drop(iter);
        self.finish_replay(progress.processed, progress.current_sequence);
        Ok(progress.processed)
    }

    /// Replay entries in batches of `options.batch_size`.
    pub fn replay_batched(
        &self,
        options: &ReplayOptions,
        mut on_batch: impl FnMut(&[JournalEntry]) -> anyhow::Result<()>,
    ) -> Result<u64> {
        let _scope = ProfileScope::new(Domain::Replay, "replay_batched");
        let batch_size = options.batch_size.max(1);
        let mut iter = self.replay_iter(options)?;
        let mut batch = Vec::with_capacity(batch_size);
        for entry in iter.by_ref() {
            batch.push(entry?);
            if batch.len() == batch_size {
                on_batch(&batch).map_err(JournalError::Handler)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            on_batch(&batch).map_err(JournalError::Handler)?;
        }
        let progress = iter.progress();
        drop(iter);
        self.finish_replay(progress.processed, progress.current_sequence);
        Ok(progress.processed)
    }

    /// Replay everything appended after `checkpoint_id`.
    pub fn replay_from_checkpoint(
        &self,
        checkpoint_id: &str,
        on_entry: impl FnMut(&JournalEntry) -> anyhow::Result<()>,
    ) -> Result<u64> {
        self.replay(&ReplayOptions::from_checkpoint(checkpoint_id), on_entry)
    }

    fn finish_replay(&self, delivered: u64, last_read: u64) {
        self.lock().counters.replays += 1;
        log(
            Level::Info,
            Domain::Replay,
            "replay_completed",
            obj(&[("delivered", json!(delivered)), ("last_sequence", json!(last_read))]),
        );
    }

    /// Snapshot what a reader needs; refuses while replay or recovery owns the journal.
    fn reader_view(&self) -> Result<(Vec<JournalSegment>, u64, Option<u64>)> {
        let inner = self.lock();
        match inner.state {
            JournalState::Closed => return Err(JournalError::Closed),
            JournalState::Replaying | JournalState::Recovering => return Err(JournalError::Busy(inner.state)),
            _ => {}
        }
        Ok((
            inner.index.segments.clone(),
            inner.index.last_sequence,
            inner.index.first_sequence(),
        ))
    }

    fn read_range(&self, segments: &[JournalSegment], from: u64, to: u64) -> Result<Vec<JournalEntry>> {
        SegmentCursor::new(self.config.dir.clone(), segments, from, to).collect()
    }

    /// Look up one entry. `None` if it was never written or has been compacted away.
    pub fn get_entry(&self, sequence: u64) -> Result<Option<JournalEntry>> {
        let (segments, last, first) = self.reader_view()?;
        match first {
            Some(first) if sequence >= first && sequence <= last => {
                Ok(self.read_range(&segments, sequence, sequence)?.into_iter().next())
            }
            _ => Ok(None),
        }
    }

    /// Up to `limit` entries starting at `from`, checksum-verified and gapless.
    pub fn get_entries_since(&self, from: u64, limit: usize) -> Result<Vec<JournalEntry>> {
        let (segments, last, _) = self.reader_view()?;
        let from = from.max(1);
        if from > last || limit == 0 {
            return Ok(Vec::new());
        }
        let to = last.min(from.saturating_add(limit as u64 - 1));
        self.read_range(&segments, from, to)
    }

    /// Full checksum and contiguity scan of every retained entry.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let _scope = ProfileScope::new(Domain::Replay, "verify_integrity");
        let _gate = self.enter(JournalState::Replaying)?;
        let (segments, last, first) = {
            let inner = self.lock();
            (
                inner.index.segments.clone(),
                inner.index.last_sequence,
                inner.index.first_sequence(),
            )
        };
        let mut entries = 0u64;
        if let Some(first) = first {
            for entry in SegmentCursor::new(self.config.dir.clone(), &segments, first, last) {
                entry?;
                entries += 1;
            }
        }
        for seg in segments.iter().filter(|s| !s.is_open) {
            let expected_name = segment::closed_file_name(seg.start_sequence, seg.end_sequence);
            if seg.file_path != expected_name {
                return Err(JournalError::SegmentMissing {
                    segment_id: seg.segment_id.clone(),
                });
            }
        }
        Ok(IntegrityReport {
            segments_verified: segments.iter().filter(|s| !s.is_empty()).count(),
            entries_verified: entries,
            first_sequence: first,
            last_sequence: last,
        })
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Delete closed segments that end before `before_sequence`. The open
    /// segment is never touched. Returns the number of segments removed.
    pub fn compact(&self, before_sequence: u64) -> Result<usize> {
        let _scope = ProfileScope::new(Domain::Segment, "compact");
        let mut inner = self.lock();
        match inner.state {
            JournalState::Idle => {}
            JournalState::Closed => return Err(JournalError::Closed),
            other => return Err(JournalError::Busy(other)),
        }
        let dir = self.config.dir.clone();
        let (doomed, kept): (Vec<JournalSegment>, Vec<JournalSegment>) = inner
            .index
            .segments
            .drain(..)
            .partition(|s| !s.is_open && s.end_sequence < before_sequence);
        inner.index.segments = kept;

        let mut freed = 0u64;
        for seg in &doomed {
            match fs::remove_file(seg.path_in(&dir)) {
                Ok(()) => freed += seg.file_size,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log_segment_missing(&seg.segment_id, &seg.file_path)
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !doomed.is_empty() {
            inner.index.persist(&dir, ts_epoch_ms())?;
            inner.counters.compactions += 1;
        }
        log_compaction(before_sequence, doomed.len(), freed);
        Ok(doomed.len())
    }

    // =========================================================================
    // Replica coordination
    // =========================================================================

    pub fn role(&self) -> ReplicaRole {
        self.lock_replicas().role()
    }

    pub fn set_replica_transport(&self, transport: Arc<dyn ReplicaTransport>, retry: RetryConfig) {
        self.lock_replicas().set_transport(transport, retry);
    }

    pub fn register_replica(&self, id: &str, endpoint: &str, last_sync_sequence: u64) -> ReplicaInfo {
        let local = self.last_sequence();
        self.lock_replicas().register(id, endpoint, last_sync_sequence, local)
    }

    pub fn unregister_replica(&self, id: &str) -> bool {
        self.lock_replicas().unregister(id).is_some()
    }

    pub fn acknowledge_replica(&self, id: &str, sequence: u64) -> Result<ReplicaInfo> {
        let local = self.last_sequence();
        self.lock_replicas().acknowledge(id, sequence, local, ts_epoch_ms())
    }

    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        self.lock_replicas().replicas()
    }

    /// Hand primary to `id` if it is within `max_replay_batch_size` entries.
    pub fn promote_replica(&self, id: &str) -> Result<ReplicaInfo> {
        let local = self.last_sequence();
        self.lock_replicas()
            .promote(id, local, self.config.max_replay_batch_size as u64)
    }

    /// One sync pass: refresh follower lag and ship missing entries through
    /// the transport, if one is installed. Primary only. The `Syncing` gate
    /// covers reading the ranges; sends and their retries run after it is
    /// released so appends are not held up by a slow follower.
    pub fn sync_replicas(&self) -> Result<SyncReport> {
        if self.role() != ReplicaRole::Primary {
            return Err(JournalError::NotPrimary);
        }
        let (plan, transport, total, local) = {
            let _gate = self.enter(JournalState::Syncing)?;
            let (segments, local) = {
                let inner = self.lock();
                (inner.index.segments.clone(), inner.index.last_sequence)
            };
            let (plan, transport, total) = {
                let mut replicas = self.lock_replicas();
                let plan = replicas.plan_sync(local);
                (plan, replicas.transport(), replicas.replicas().len())
            };
            let plan: Vec<_> = plan
                .into_iter()
                .map(|(info, from)| {
                    let batch = transport.is_some().then(|| {
                        let to = local.min(from + self.config.max_replay_batch_size as u64 - 1);
                        self.read_range(&segments, from, to)
                    });
                    (info, from, batch)
                })
                .collect();
            (plan, transport, total, local)
        };

        let mut report = SyncReport {
            replicas: total,
            ..Default::default()
        };
        for (info, from, batch) in plan {
            report.max_lag = report.max_lag.max(info.lag);
            log_replica_lag(&info.id, info.last_sync_sequence, info.lag, info.is_healthy);
            let (Some((sender, retry)), Some(batch)) = (transport.as_ref(), batch) else {
                continue;
            };
            let shipped = batch.map_err(anyhow::Error::from).and_then(|entries| {
                retry_blocking(retry, "replica_send", || sender.send(&info, &entries))?;
                Ok(entries.last().map(|e| e.sequence))
            });
            let mut replicas = self.lock_replicas();
            match shipped {
                Ok(Some(last_sent)) => {
                    report.entries_shipped += last_sent + 1 - from;
                    replicas.acknowledge(&info.id, last_sent, local, ts_epoch_ms())?;
                }
                Ok(None) => {}
                Err(e) => {
                    report.failures += 1;
                    replicas.mark_failed(&info.id);
                    log(
                        Level::Error,
                        Domain::Replica,
                        "replica_sync_failed",
                        obj(&[("replica_id", v_str(&info.id)), ("error", v_str(&e.to_string()))]),
                    );
                }
            }
        }
        Ok(report)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn stats(&self) -> JournalStats {
        let inner = self.lock();
        JournalStats {
            last_sequence: inner.index.last_sequence,
            first_sequence: inner.index.first_sequence(),
            segment_count: inner.index.segments.len(),
            total_bytes: inner.index.total_bytes(),
            checkpoint_count: inner.index.checkpoints.len(),
            appends: inner.counters.appends,
            rotations: inner.counters.rotations,
            replays: inner.counters.replays,
            compactions: inner.counters.compactions,
            checkpoints_created: inner.counters.checkpoints,
        }
    }

    /// Flush the open segment, persist the index and refuse all further work.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == JournalState::Closed {
            return Ok(());
        }
        if let Some(mut writer) = inner.writer.take() {
            writer.sync()?;
        }
        inner.index.persist(&self.config.dir, ts_epoch_ms())?;
        inner.state = JournalState::Closed;
        log(
            Level::Info,
            Domain::Journal,
            "journal_closed",
            obj(&[("last_sequence", json!(inner.index.last_sequence))]),
        );
        Ok(())
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log(
                Level::Error,
                Domain::Journal,
                "close_failed",
                obj(&[("error", v_str(&e.to_string()))]),
            );
        }
    }
}

/// Path helper for tools that inspect a journal directory without opening it.
pub fn index_path(dir: &Path) -> PathBuf {
    dir.join(index::INDEX_FILE)
}
