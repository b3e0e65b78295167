//! Priority-laned ring buffer with consumer-gated backpressure.
//!
//! One fixed-size lane per [`EventPriority`]. Producers claim slots with a
//! CAS on the lane cursor and are refused, never blocked, when the slowest
//! consumer is a full lane behind. Each registered consumer runs its own
//! thread and drains lanes strictly in priority order.

pub mod consumer;
pub mod lane;
pub mod metrics;
pub mod priority;
pub mod wait;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use serde_json::{json, Value};

use crate::config::RingBufferConfig;
use crate::error::RingBufferError;
use crate::logging::{log, log_backpressure, obj, ts_epoch_ms, v_str, Domain, Level};

pub use consumer::{BatchHandler, ConsumerHandler, SingleHandler};
pub use lane::{LaneStats, RingBufferEvent};
pub use metrics::RingBufferMetrics;
pub use priority::EventPriority;
pub use wait::WaitStrategy;

use consumer::Consumer;
use lane::Lane;
use metrics::MetricsRecorder;
use wait::Signal;

/// State shared between producers and consumer threads.
pub(crate) struct Shared<P> {
    /// Indexed by `EventPriority::index`, highest priority first.
    pub(crate) lanes: Vec<Lane<P>>,
    pub(crate) metrics: MetricsRecorder,
    pub(crate) signal: Signal,
}

/// One event of a `publish_batch` call.
#[derive(Debug, Clone)]
pub struct BatchEvent<P> {
    pub event_type: String,
    pub payload: P,
    pub priority: EventPriority,
    pub metadata: Option<Value>,
}

impl<P> BatchEvent<P> {
    pub fn new(event_type: &str, payload: P, priority: EventPriority) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            priority,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

struct Registered<P> {
    consumer: Arc<Consumer<P>>,
    thread: Option<JoinHandle<()>>,
}

pub struct PriorityRingBuffer<P = Value> {
    config: RingBufferConfig,
    shared: Arc<Shared<P>>,
    consumers: Mutex<BTreeMap<String, Registered<P>>>,
    running: AtomicBool,
}

impl<P> PriorityRingBuffer<P> {
    /// Allocate every lane up front. Capacities must be non-zero powers of two.
    pub fn new(config: RingBufferConfig) -> Result<Self, RingBufferError> {
        if config.batch_size == 0 {
            return Err(RingBufferError::InvalidBatchSize);
        }
        let mut lanes = Vec::with_capacity(EventPriority::ALL.len());
        for priority in EventPriority::ALL {
            let capacity = config.capacity_for(priority);
            if !capacity.is_power_of_two() {
                return Err(RingBufferError::InvalidCapacity(capacity));
            }
            lanes.push(Lane::new(priority, capacity));
        }
        log(
            Level::Info,
            Domain::Ring,
            "ring_buffer_created",
            obj(&[
                ("capacity", json!(config.capacity)),
                ("wait", v_str(config.wait_strategy.as_str())),
                ("batch_size", json!(config.batch_size)),
            ]),
        );
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                lanes,
                metrics: MetricsRecorder::default(),
                signal: Signal::new(),
            }),
            consumers: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RingBufferConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared<P> {
        &self.shared
    }

    fn lock_consumers(&self) -> MutexGuard<'_, BTreeMap<String, Registered<P>>> {
        self.consumers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lane(&self, priority: EventPriority) -> &Lane<P> {
        &self.shared.lanes[priority.index()]
    }

    // =========================================================================
    // Producers
    // =========================================================================

    pub fn publish(&self, event_type: &str, payload: P, priority: EventPriority) -> Result<u64, RingBufferError> {
        self.publish_event(BatchEvent::new(event_type, payload, priority))
    }

    pub fn publish_with_metadata(
        &self,
        event_type: &str,
        payload: P,
        priority: EventPriority,
        metadata: Value,
    ) -> Result<u64, RingBufferError> {
        self.publish_event(BatchEvent::new(event_type, payload, priority).with_metadata(metadata))
    }

    /// Claim one slot, fill it and wake waiting consumers. Refused, not
    /// blocked, when the lane is full.
    pub fn publish_event(&self, event: BatchEvent<P>) -> Result<u64, RingBufferError> {
        let priority = event.priority;
        let lane = self.lane(priority);
        let sequence = self.claim(lane, 1)?;
        lane.write(Self::materialize(sequence, event));
        self.shared.metrics.on_published(1);
        self.shared.signal.notify();
        Ok(sequence)
    }

    /// Publish several events. Each lane's share is reserved as one
    /// contiguous range or rejected as a whole; lanes are independent.
    /// Results come back in input order.
    pub fn publish_batch(&self, events: Vec<BatchEvent<P>>) -> Vec<Result<u64, RingBufferError>> {
        let mut results: Vec<Option<Result<u64, RingBufferError>>> = (0..events.len()).map(|_| None).collect();
        let mut groups: BTreeMap<EventPriority, Vec<(usize, BatchEvent<P>)>> = BTreeMap::new();
        for (i, event) in events.into_iter().enumerate() {
            groups.entry(event.priority).or_default().push((i, event));
        }

        let mut published = 0u64;
        for (priority, group) in groups {
            let lane = self.lane(priority);
            let count = group.len() as u64;
            match self.claim(lane, count) {
                Ok(first) => {
                    for (offset, (i, event)) in group.into_iter().enumerate() {
                        let sequence = first + offset as u64;
                        lane.write(Self::materialize(sequence, event));
                        results[i] = Some(Ok(sequence));
                    }
                    published += count;
                }
                Err(_) => {
                    for (i, _) in group {
                        results[i] = Some(Err(RingBufferError::BackpressureRejected { priority }));
                    }
                }
            }
        }
        if published > 0 {
            self.shared.metrics.on_published(published);
            self.shared.signal.notify();
        }
        results.into_iter().flatten().collect()
    }

    fn claim(&self, lane: &Lane<P>, n: u64) -> Result<u64, RingBufferError> {
        lane.try_claim(n).map_err(|full| {
            self.shared.metrics.on_rejected(n);
            log_backpressure(
                lane.priority().as_str(),
                n,
                full.cursor,
                full.min_gating,
                lane.capacity(),
            );
            RingBufferError::BackpressureRejected {
                priority: lane.priority(),
            }
        })
    }

    fn materialize(sequence: u64, event: BatchEvent<P>) -> RingBufferEvent<P> {
        RingBufferEvent {
            sequence,
            timestamp: ts_epoch_ms(),
            priority: event.priority,
            event_type: event.event_type,
            payload: event.payload,
            metadata: event.metadata,
            published_at: Instant::now(),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn consumer_ids(&self) -> Vec<String> {
        self.lock_consumers().keys().cloned().collect()
    }

    /// Last sequence `consumer_id` has taken from the lane.
    pub fn consumer_position(&self, consumer_id: &str, priority: EventPriority) -> Option<u64> {
        self.lock_consumers()
            .get(consumer_id)
            .map(|r| r.consumer.position(priority))
    }

    /// Slots a producer could claim on the lane right now.
    pub fn remaining_capacity(&self, priority: EventPriority) -> u64 {
        self.lane(priority).remaining_capacity()
    }

    pub fn get_metrics(&self) -> RingBufferMetrics {
        let lanes = self.shared.lanes.iter().map(|l| l.stats()).collect();
        self.shared.metrics.snapshot(lanes)
    }

    pub fn reset_metrics(&self) {
        self.shared.metrics.reset();
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stop every consumer loop and wait for in-flight deliveries to finish.
    /// Registrations, and the capacity they hold back, stay in place.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let threads: Vec<(String, JoinHandle<()>)> = {
            let mut consumers = self.lock_consumers();
            consumers
                .iter_mut()
                .filter_map(|(id, r)| {
                    r.consumer.set_running(false);
                    r.thread.take().map(|t| (id.clone(), t))
                })
                .collect()
        };
        self.shared.signal.notify();
        for (id, thread) in threads {
            join_consumer(&id, thread);
        }
        log(Level::Info, Domain::Ring, "ring_buffer_stopped", obj(&[]));
    }

    /// Unregister a consumer: its loop stops and its gating sequences no
    /// longer hold back producers.
    pub fn remove_handler(&self, consumer_id: &str) -> Result<(), RingBufferError> {
        let registered = self
            .lock_consumers()
            .remove(consumer_id)
            .ok_or_else(|| RingBufferError::UnknownConsumer(consumer_id.to_string()))?;
        registered.consumer.set_running(false);
        if let Some(thread) = registered.thread {
            self.shared.signal.notify();
            join_consumer(consumer_id, thread);
        }
        registered.consumer.unregister(&self.shared);
        log(
            Level::Info,
            Domain::Consumer,
            "consumer_removed",
            obj(&[("consumer_id", v_str(consumer_id))]),
        );
        Ok(())
    }
}

impl<P: Send + Sync + 'static> PriorityRingBuffer<P> {
    /// Register a consumer on every lane. Its gating sequences start at the
    /// slowest existing position, so it sees every event still in the lane.
    /// The loop starts now if the buffer is running, otherwise on `start`.
    pub fn add_handler(&self, consumer_id: &str, handler: ConsumerHandler<P>) -> Result<(), RingBufferError> {
        let mut consumers = self.lock_consumers();
        if consumers.contains_key(consumer_id) {
            return Err(RingBufferError::DuplicateConsumer(consumer_id.to_string()));
        }
        let handler = handler.with_default_batch(self.config.batch_size);
        let consumer = Arc::new(Consumer::register(consumer_id, handler, &self.shared));
        let thread = if self.is_running() {
            match self.spawn(consumer.clone()) {
                Ok(t) => Some(t),
                Err(e) => {
                    consumer.unregister(&self.shared);
                    return Err(e);
                }
            }
        } else {
            None
        };
        consumers.insert(consumer_id.to_string(), Registered { consumer, thread });
        log(
            Level::Info,
            Domain::Consumer,
            "consumer_added",
            obj(&[("consumer_id", v_str(consumer_id))]),
        );
        Ok(())
    }

    /// Start a poll loop for every registered consumer.
    pub fn start(&self) -> Result<(), RingBufferError> {
        let mut consumers = self.lock_consumers();
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for registered in consumers.values_mut() {
            if registered.thread.is_none() {
                registered.thread = Some(self.spawn(registered.consumer.clone())?);
            }
        }
        log(
            Level::Info,
            Domain::Ring,
            "ring_buffer_started",
            obj(&[("consumers", json!(consumers.len()))]),
        );
        Ok(())
    }

    fn spawn(&self, consumer: Arc<Consumer<P>>) -> Result<JoinHandle<()>, RingBufferError> {
        consumer.set_running(true);
        let shared = self.shared.clone();
        let strategy = self.config.wait_strategy;
        let name = format!("ring-{}", consumer.id());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || consumer.run(&shared, strategy))?;
        Ok(handle)
    }
}

impl<P> Drop for PriorityRingBuffer<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join a consumer thread unless we are that thread (a handler removing itself).
fn join_consumer(consumer_id: &str, handle: JoinHandle<()>) {
    handle.thread().unpark();
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        log(
            Level::Error,
            Domain::Consumer,
            "consumer_thread_panicked",
            obj(&[("consumer_id", v_str(consumer_id))]),
        );
    }
}
