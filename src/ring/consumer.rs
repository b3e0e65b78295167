//! Registered consumers and their poll loops.
//!
//! Every consumer owns one gating sequence per lane and is the only writer of
//! it. The loop scans lanes in priority order, delivers from the first lane
//! with published data, advances that lane's gate and starts over from the
//! top. A failing handler is logged and counted; the entry still counts as
//! delivered.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use super::lane::RingBufferEvent;
use super::priority::EventPriority;
use super::wait::{Idler, WaitStrategy};
use super::Shared;
use crate::logging::{log, log_handler_failure, obj, v_str, Domain, Level};

pub type SingleHandler<P> = Box<dyn FnMut(&RingBufferEvent<P>) -> anyhow::Result<()> + Send>;
pub type BatchHandler<P> = Box<dyn FnMut(&[Arc<RingBufferEvent<P>>]) -> anyhow::Result<()> + Send>;

pub enum ConsumerHandler<P> {
    Single(SingleHandler<P>),
    /// `batch_size` of 0 means the buffer's configured batch size.
    Batch {
        handler: BatchHandler<P>,
        batch_size: usize,
    },
}

impl<P> ConsumerHandler<P> {
    pub fn single<F>(f: F) -> Self
    where
        F: FnMut(&RingBufferEvent<P>) -> anyhow::Result<()> + Send + 'static,
    {
        ConsumerHandler::Single(Box::new(f))
    }

    pub fn batch<F>(f: F, batch_size: usize) -> Self
    where
        F: FnMut(&[Arc<RingBufferEvent<P>>]) -> anyhow::Result<()> + Send + 'static,
    {
        ConsumerHandler::Batch {
            handler: Box::new(f),
            batch_size,
        }
    }

    pub(crate) fn with_default_batch(mut self, default: usize) -> Self {
        if let ConsumerHandler::Batch { batch_size, .. } = &mut self {
            if *batch_size == 0 {
                *batch_size = default;
            }
        }
        self
    }
}

pub(crate) struct Consumer<P> {
    id: String,
    /// Indexed by `EventPriority::index`.
    gates: Vec<Arc<AtomicU64>>,
    handler: Mutex<ConsumerHandler<P>>,
    running: AtomicBool,
}

impl<P> Consumer<P> {
    /// Register gating sequences on every lane.
    pub(crate) fn register(id: &str, handler: ConsumerHandler<P>, shared: &Shared<P>) -> Self {
        let gates = shared.lanes.iter().map(|lane| lane.add_gate(id)).collect();
        Self {
            id: id.to_string(),
            gates,
            handler: Mutex::new(handler),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn unregister(&self, shared: &Shared<P>) {
        for lane in &shared.lanes {
            lane.remove_gate(&self.id);
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn position(&self, priority: EventPriority) -> u64 {
        self.gates[priority.index()].load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Poll until `set_running(false)`. The current delivery always completes.
    pub(crate) fn run(&self, shared: &Shared<P>, strategy: WaitStrategy) {
        let mut handler = self.handler.lock().unwrap_or_else(|p| p.into_inner());
        let mut idler = Idler::new(strategy);
        log(
            Level::Debug,
            Domain::Consumer,
            "consumer_started",
            obj(&[("consumer_id", v_str(&self.id)), ("wait", v_str(strategy.as_str()))]),
        );
        while self.is_running() {
            let seen = shared.signal.generation();
            if self.poll_once(shared, &mut handler) {
                idler.reset();
            } else {
                idler.idle(&shared.signal, seen);
            }
        }
        log(
            Level::Debug,
            Domain::Consumer,
            "consumer_stopped",
            obj(&[
                ("consumer_id", v_str(&self.id)),
                (
                    "positions",
                    json!(self.gates.iter().map(|g| g.load(Ordering::Acquire)).collect::<Vec<_>>()),
                ),
            ]),
        );
    }

    /// One scan. Returns true if anything was delivered.
    pub(crate) fn poll_once(&self, shared: &Shared<P>, handler: &mut ConsumerHandler<P>) -> bool {
        for lane in &shared.lanes {
            let gate = &self.gates[lane.priority().index()];
            let next = gate.load(Ordering::Acquire) + 1;
            match &mut *handler {
                ConsumerHandler::Single(f) => {
                    let Some(event) = lane.read(next) else {
                        continue;
                    };
                    let outcome = invoke(|| f(event.as_ref()));
                    self.settle(shared, lane.priority(), next, outcome);
                    record_latency(shared, std::slice::from_ref(&event));
                    gate.store(next, Ordering::Release);
                    shared.metrics.on_consumed(1);
                    return true;
                }
                ConsumerHandler::Batch { handler: f, batch_size } => {
                    let batch = lane.read_batch(next, (*batch_size).max(1));
                    if batch.is_empty() {
                        continue;
                    }
                    let last = next + batch.len() as u64 - 1;
                    let outcome = invoke(|| f(&batch));
                    self.settle(shared, lane.priority(), next, outcome);
                    record_latency(shared, &batch);
                    gate.store(last, Ordering::Release);
                    shared.metrics.on_consumed(batch.len() as u64);
                    shared.metrics.on_batch();
                    return true;
                }
            }
        }
        false
    }

    fn settle(&self, shared: &Shared<P>, priority: EventPriority, sequence: u64, outcome: Result<(), String>) {
        if let Err(error) = outcome {
            shared.metrics.on_handler_error();
            log_handler_failure(&self.id, priority.as_str(), sequence, &error);
        }
    }
}

/// Run a handler, turning both `Err` and panics into a message.
fn invoke(f: impl FnOnce() -> anyhow::Result<()>) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(match panic.downcast_ref::<&str>() {
            Some(s) => format!("handler panicked: {}", s),
            None => match panic.downcast_ref::<String>() {
                Some(s) => format!("handler panicked: {}", s),
                None => "handler panicked".to_string(),
            },
        }),
    }
}

fn record_latency<P>(shared: &Shared<P>, events: &[Arc<RingBufferEvent<P>>]) {
    for event in events {
        shared
            .metrics
            .record_latency(event.published_at.elapsed().as_micros() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingBufferConfig;
    use crate::ring::PriorityRingBuffer;
    use serde_json::{json, Value};

    #[test]
    fn test_poll_prefers_higher_priority() {
        let ring: PriorityRingBuffer<Value> = PriorityRingBuffer::new(RingBufferConfig::new(
            8,
            WaitStrategy::BusySpin,
            10,
        ))
        .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = Consumer::register(
            "probe",
            ConsumerHandler::single(move |e: &RingBufferEvent<Value>| {
                sink.lock().unwrap().push(e.priority);
                Ok(())
            }),
            ring.shared(),
        );
        ring.publish("heartbeat", json!(null), EventPriority::System).unwrap();
        ring.publish("halt", json!(null), EventPriority::Critical).unwrap();

        let mut handler = consumer.handler.lock().unwrap();
        assert!(consumer.poll_once(ring.shared(), &mut handler));
        assert!(consumer.poll_once(ring.shared(), &mut handler));
        assert!(!consumer.poll_once(ring.shared(), &mut handler));
        assert_eq!(*seen.lock().unwrap(), vec![EventPriority::Critical, EventPriority::System]);
        assert_eq!(consumer.position(EventPriority::System), 1);
    }

    #[test]
    fn test_failing_handler_still_advances() {
        let ring: PriorityRingBuffer<Value> = PriorityRingBuffer::new(RingBufferConfig::new(
            8,
            WaitStrategy::BusySpin,
            10,
        ))
        .unwrap();
        let consumer = Consumer::register(
            "flaky",
            ConsumerHandler::single(|e: &RingBufferEvent<Value>| {
                if e.sequence == 1 {
                    panic!("bad tick");
                }
                anyhow::bail!("rejected {}", e.sequence)
            }),
            ring.shared(),
        );
        ring.publish("tick", json!(1), EventPriority::MarketData).unwrap();
        ring.publish("tick", json!(2), EventPriority::MarketData).unwrap();

        let mut handler = consumer.handler.lock().unwrap();
        assert!(consumer.poll_once(ring.shared(), &mut handler));
        assert!(consumer.poll_once(ring.shared(), &mut handler));
        assert_eq!(consumer.position(EventPriority::MarketData), 2);
        let metrics = ring.get_metrics();
        assert_eq!(metrics.handler_errors, 2);
        assert_eq!(metrics.consumed, 2);
    }

    #[test]
    fn test_batch_handler_takes_contiguous_run() {
        let ring: PriorityRingBuffer<Value> = PriorityRingBuffer::new(RingBufferConfig::new(
            16,
            WaitStrategy::BusySpin,
            10,
        ))
        .unwrap();
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = sizes.clone();
        let consumer = Consumer::register(
            "batcher",
            ConsumerHandler::batch(
                move |batch: &[Arc<RingBufferEvent<Value>>]| {
                    sink.lock().unwrap().push(batch.len());
                    Ok(())
                },
                4,
            ),
            ring.shared(),
        );
        for i in 0..6 {
            ring.publish("bar", json!(i), EventPriority::Analytics).unwrap();
        }
        let mut handler = consumer.handler.lock().unwrap();
        while consumer.poll_once(ring.shared(), &mut handler) {}
        assert_eq!(*sizes.lock().unwrap(), vec![4, 2]);
        assert_eq!(ring.get_metrics().batches_processed, 2);
    }
}
