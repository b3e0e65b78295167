//! One priority lane: a power-of-two slot array, an atomically claimed
//! cursor and the gating sequences of every registered consumer.
//!
//! Sequences start at 1. A claim of `n` slots succeeds only while
//! `cursor + n - min_gating <= capacity`, so a slot is never reused before
//! the slowest consumer has moved past it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use super::priority::EventPriority;

/// An event as consumers see it.
#[derive(Debug, Clone)]
pub struct RingBufferEvent<P> {
    pub sequence: u64,
    /// Epoch milliseconds at publish.
    pub timestamp: u64,
    pub priority: EventPriority,
    pub event_type: String,
    pub payload: P,
    pub metadata: Option<Value>,
    pub(crate) published_at: Instant,
}

struct Slot<P> {
    sequence: u64,
    published: bool,
    event: Option<Arc<RingBufferEvent<P>>>,
}

/// Claim refused: the lane has no room for the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Full {
    pub cursor: u64,
    pub min_gating: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneStats {
    pub priority: EventPriority,
    pub capacity: u64,
    /// Last claimed sequence.
    pub cursor: u64,
    /// Highest sequence made visible to consumers.
    pub published: u64,
    pub min_gating: u64,
    pub consumers: usize,
    pub used: u64,
    pub utilization: f64,
}

struct Gates {
    consumers: Vec<(String, Arc<AtomicU64>)>,
    /// Stands in for the minimum while no consumer is registered.
    floor: u64,
}

pub(crate) struct Lane<P> {
    priority: EventPriority,
    capacity: u64,
    mask: u64,
    slots: Box<[Mutex<Slot<P>>]>,
    cursor: AtomicU64,
    published: AtomicU64,
    gates: RwLock<Gates>,
}

impl<P> Lane<P> {
    /// `capacity` must already be validated as a non-zero power of two.
    pub(crate) fn new(priority: EventPriority, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| {
                Mutex::new(Slot {
                    sequence: 0,
                    published: false,
                    event: None,
                })
            })
            .collect();
        Self {
            priority,
            capacity: capacity as u64,
            mask: capacity as u64 - 1,
            slots,
            cursor: AtomicU64::new(0),
            published: AtomicU64::new(0),
            gates: RwLock::new(Gates {
                consumers: Vec::new(),
                floor: 0,
            }),
        }
    }

    pub(crate) fn priority(&self) -> EventPriority {
        self.priority
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    fn read_gates(&self) -> std::sync::RwLockReadGuard<'_, Gates> {
        self.gates.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_gates(&self) -> std::sync::RwLockWriteGuard<'_, Gates> {
        self.gates.write().unwrap_or_else(|p| p.into_inner())
    }

    fn min_of(gates: &Gates) -> u64 {
        gates
            .consumers
            .iter()
            .map(|(_, g)| g.load(Ordering::Acquire))
            .min()
            .unwrap_or(gates.floor)
    }

    pub(crate) fn min_gating(&self) -> u64 {
        Self::min_of(&self.read_gates())
    }

    /// Reserve `n` contiguous sequences and return the first. Never blocks:
    /// contention retries the CAS, lack of room returns `Full`.
    pub(crate) fn try_claim(&self, n: u64) -> Result<u64, Full> {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            let min_gating = self.min_gating();
            let next = current + n;
            if next.saturating_sub(min_gating) > self.capacity {
                return Err(Full {
                    cursor: current,
                    min_gating,
                });
            }
            match self
                .cursor
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Fill a claimed slot and make it visible.
    pub(crate) fn write(&self, event: RingBufferEvent<P>) {
        let sequence = event.sequence;
        let mut slot = self.slots[(sequence & self.mask) as usize]
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        slot.sequence = sequence;
        slot.event = Some(Arc::new(event));
        slot.published = true;
        drop(slot);
        self.published.fetch_max(sequence, Ordering::AcqRel);
    }

    /// The event at `sequence`, if it has been published at this wrap.
    pub(crate) fn read(&self, sequence: u64) -> Option<Arc<RingBufferEvent<P>>> {
        let slot = self.slots[(sequence & self.mask) as usize]
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if slot.published && slot.sequence == sequence {
            slot.event.clone()
        } else {
            None
        }
    }

    /// Up to `max` contiguous published events starting at `from`.
    pub(crate) fn read_batch(&self, from: u64, max: usize) -> Vec<Arc<RingBufferEvent<P>>> {
        let mut out = Vec::new();
        let mut seq = from;
        while out.len() < max {
            match self.read(seq) {
                Some(ev) => out.push(ev),
                None => break,
            }
            seq += 1;
        }
        out
    }

    /// Register a gating sequence starting at the current minimum, so the
    /// new consumer sees everything still retained in the lane.
    pub(crate) fn add_gate(&self, consumer_id: &str) -> Arc<AtomicU64> {
        let mut gates = self.write_gates();
        let start = Self::min_of(&gates);
        let gate = Arc::new(AtomicU64::new(start));
        gates.consumers.push((consumer_id.to_string(), gate.clone()));
        gate
    }

    /// Drop a consumer's gating sequence, releasing whatever it held back.
    /// Once the last consumer is gone, everything claimed so far is released.
    pub(crate) fn remove_gate(&self, consumer_id: &str) {
        let mut gates = self.write_gates();
        if let Some(pos) = gates.consumers.iter().position(|(id, _)| id == consumer_id) {
            gates.consumers.remove(pos);
            if gates.consumers.is_empty() {
                gates.floor = gates.floor.max(self.cursor());
            }
        }
    }

    pub(crate) fn remaining_capacity(&self) -> u64 {
        self.capacity - self.used()
    }

    fn used(&self) -> u64 {
        self.cursor().saturating_sub(self.min_gating()).min(self.capacity)
    }

    pub(crate) fn stats(&self) -> LaneStats {
        let (min_gating, consumers) = {
            let gates = self.read_gates();
            (Self::min_of(&gates), gates.consumers.len())
        };
        let cursor = self.cursor();
        let used = cursor.saturating_sub(min_gating).min(self.capacity);
        LaneStats {
            priority: self.priority,
            capacity: self.capacity,
            cursor,
            published: self.published.load(Ordering::Acquire),
            min_gating,
            consumers,
            used,
            utilization: used as f64 / self.capacity as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: u64) -> RingBufferEvent<Value> {
        RingBufferEvent {
            sequence: seq,
            timestamp: 0,
            priority: EventPriority::Orders,
            event_type: "order".to_string(),
            payload: json!({"n": seq}),
            metadata: None,
            published_at: Instant::now(),
        }
    }

    fn fill(lane: &Lane<Value>, n: u64) {
        for _ in 0..n {
            let seq = lane.try_claim(1).unwrap();
            lane.write(event(seq));
        }
    }

    #[test]
    fn test_claim_refused_when_full() {
        let lane: Lane<Value> = Lane::new(EventPriority::Orders, 4);
        fill(&lane, 4);
        assert_eq!(lane.try_claim(1), Err(Full { cursor: 4, min_gating: 0 }));
        assert_eq!(lane.remaining_capacity(), 0);
    }

    #[test]
    fn test_gate_frees_capacity() {
        let lane: Lane<Value> = Lane::new(EventPriority::Orders, 4);
        fill(&lane, 4);
        let gate = lane.add_gate("c1");
        assert_eq!(gate.load(Ordering::Acquire), 0);
        gate.store(1, Ordering::Release);
        assert_eq!(lane.try_claim(1), Ok(5));
        // Slot 1 was reused by sequence 5 only after the consumer moved past it.
        lane.write(event(5));
        assert!(lane.read(1).is_none());
        assert_eq!(lane.read(5).unwrap().sequence, 5);
    }

    #[test]
    fn test_range_claim_is_all_or_nothing() {
        let lane: Lane<Value> = Lane::new(EventPriority::Orders, 8);
        fill(&lane, 5);
        assert!(lane.try_claim(4).is_err());
        assert_eq!(lane.cursor(), 5);
        assert_eq!(lane.try_claim(3), Ok(6));
        assert_eq!(lane.cursor(), 8);
    }

    #[test]
    fn test_read_batch_stops_at_unpublished() {
        let lane: Lane<Value> = Lane::new(EventPriority::Orders, 8);
        fill(&lane, 3);
        let _claimed = lane.try_claim(1).unwrap();
        let batch = lane.read_batch(1, 10);
        assert_eq!(batch.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_new_gate_starts_at_slowest() {
        let lane: Lane<Value> = Lane::new(EventPriority::Orders, 8);
        fill(&lane, 6);
        let a = lane.add_gate("a");
        a.store(4, Ordering::Release);
        let b = lane.add_gate("b");
        assert_eq!(b.load(Ordering::Acquire), 4);
    }

    #[test]
    fn test_removing_slowest_gate_frees_capacity() {
        let lane: Lane<Value> = Lane::new(EventPriority::Orders, 4);
        let slow = lane.add_gate("slow");
        let fast = lane.add_gate("fast");
        fill(&lane, 4);
        fast.store(3, Ordering::Release);
        assert_eq!(slow.load(Ordering::Acquire), 0);
        assert_eq!(lane.remaining_capacity(), 0);

        lane.remove_gate("slow");
        assert_eq!(lane.min_gating(), 3);
        assert_eq!(lane.remaining_capacity(), 3);
    }

    #[test]
    fn test_removing_last_gate_releases_lane() {
        let lane: Lane<Value> = Lane::new(EventPriority::Orders, 4);
        let a = lane.add_gate("a");
        fill(&lane, 4);
        a.store(1, Ordering::Release);
        lane.remove_gate("a");
        let stats = lane.stats();
        assert_eq!(stats.consumers, 0);
        assert_eq!(stats.min_gating, 4);
        assert_eq!(stats.used, 0);
        // A later consumer starts after the released range.
        assert_eq!(lane.add_gate("b").load(Ordering::Acquire), 4);
    }
}
