//! Deterministic replay.
//!
//! Replay is a synchronous iterator: entries come out in strict sequence
//! order, every entry is checksum-verified, and any gap or mismatch ends the
//! pass with an error instead of skipping ahead.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::Serialize;

use super::entry::JournalEntry;
use super::segment::{read_entries, JournalSegment};
use super::GateGuard;
use crate::error::{JournalError, Result};

/// Where a replay pass begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStart {
    /// First sequence to deliver (inclusive).
    Sequence(u64),
    /// Deliver everything after the checkpoint's sequence.
    Checkpoint(String),
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub start: ReplayStart,
    /// Last sequence to deliver (inclusive); `None` means the current end.
    pub to_sequence: Option<u64>,
    /// Deliver only these event types; contiguity is still checked on all entries.
    pub event_types: Option<Vec<String>>,
    pub batch_size: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            start: ReplayStart::Sequence(1),
            to_sequence: None,
            event_types: None,
            batch_size: 100,
        }
    }
}

impl ReplayOptions {
    pub fn from_sequence(sequence: u64) -> Self {
        Self {
            start: ReplayStart::Sequence(sequence),
            ..Default::default()
        }
    }

    pub fn from_checkpoint(checkpoint_id: &str) -> Self {
        Self {
            start: ReplayStart::Checkpoint(checkpoint_id.to_string()),
            ..Default::default()
        }
    }

    pub fn to(mut self, sequence: u64) -> Self {
        self.to_sequence = Some(sequence);
        self
    }

    pub fn event_types(mut self, types: &[&str]) -> Self {
        self.event_types = Some(types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayProgress {
    /// Entries delivered so far (after event-type filtering).
    pub processed: u64,
    /// Last sequence read from disk.
    pub current_sequence: u64,
    pub target_sequence: u64,
}

/// Ordered, verified walk over `[from, to]` across segment files.
pub(crate) struct SegmentCursor {
    dir: PathBuf,
    segments: VecDeque<JournalSegment>,
    current: Option<Box<dyn Iterator<Item = Result<JournalEntry>>>>,
    /// Next sequence the files must contain.
    expected: Option<u64>,
    from: u64,
    to: u64,
    done: bool,
}

impl SegmentCursor {
    /// `segments` must be ordered by start sequence; `to` must not exceed the
    /// journal's last sequence.
    pub(crate) fn new(dir: PathBuf, segments: &[JournalSegment], from: u64, to: u64) -> Self {
        let segments: VecDeque<JournalSegment> = segments
            .iter()
            .filter(|s| s.overlaps(from, to))
            .cloned()
            .collect();
        Self {
            dir,
            segments,
            current: None,
            expected: None,
            from,
            to,
            done: from > to,
        }
    }

    fn fail(&mut self, err: JournalError) -> Option<Result<JournalEntry>> {
        self.done = true;
        Some(Err(err))
    }

    fn advance_segment(&mut self) -> Option<Result<()>> {
        let seg = self.segments.pop_front()?;
        let expected = self.expected.unwrap_or(self.from);
        // The first segment may start before `from`; later ones must follow on exactly.
        let misplaced = match self.expected {
            None => seg.start_sequence > expected,
            Some(_) => seg.start_sequence != expected,
        };
        if misplaced {
            return Some(Err(JournalError::SequenceGap {
                expected,
                found: seg.start_sequence,
            }));
        }
        let path = seg.path_in(&self.dir);
        if !path.exists() {
            return Some(Err(JournalError::SegmentMissing {
                segment_id: seg.segment_id.clone(),
            }));
        }
        match read_entries(&path) {
            Ok(iter) => {
                self.expected = Some(seg.start_sequence);
                self.current = Some(Box::new(iter));
                Some(Ok(()))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl Iterator for SegmentCursor {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let Some(current) = self.current.as_mut() else {
                match self.advance_segment() {
                    Some(Ok(())) => continue,
                    Some(Err(e)) => return self.fail(e),
                    None => {
                        let expected = self.expected.unwrap_or(self.from);
                        self.done = true;
                        if expected <= self.to {
                            return Some(Err(JournalError::SequenceGap { expected, found: 0 }));
                        }
                        return None;
                    }
                }
            };
            match current.next() {
                None => {
                    self.current = None;
                }
                Some(Err(e)) => return self.fail(e),
                Some(Ok(entry)) => {
                    let expected = self.expected.unwrap_or(self.from);
                    if entry.sequence != expected {
                        return self.fail(JournalError::SequenceGap {
                            expected,
                            found: entry.sequence,
                        });
                    }
                    self.expected = Some(expected + 1);
                    if entry.sequence < self.from {
                        continue;
                    }
                    if entry.sequence >= self.to {
                        self.done = true;
                    }
                    return Some(Ok(entry));
                }
            }
        }
    }
}

/// A replay pass. Holds the journal in the `Replaying` state until dropped.
pub struct ReplayIter<'a> {
    cursor: SegmentCursor,
    event_types: Option<Vec<String>>,
    progress: ReplayProgress,
    _gate: Option<GateGuard<'a>>,
}

impl<'a> ReplayIter<'a> {
    pub(crate) fn new(cursor: SegmentCursor, event_types: Option<Vec<String>>, gate: Option<GateGuard<'a>>) -> Self {
        let progress = ReplayProgress {
            processed: 0,
            current_sequence: cursor.from.saturating_sub(1),
            target_sequence: cursor.to,
        };
        Self {
            cursor,
            event_types,
            progress,
            _gate: gate,
        }
    }

    pub fn progress(&self) -> ReplayProgress {
        self.progress
    }
}

impl Iterator for ReplayIter<'_> {
    type Item = Result<JournalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.cursor.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            self.progress.current_sequence = entry.sequence;
            if let Some(types) = &self.event_types {
                if !types.iter().any(|t| *t == entry.event_type) {
                    continue;
                }
            }
            self.progress.processed += 1;
            return Some(Ok(entry));
        }
    }
}
