//! Ring buffer behaviour through the public API: backpressure, priority
//! ordering, batch publishing and consumer lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use tradebus::{
    BatchEvent, ConsumerHandler, EventPriority, PriorityRingBuffer, RingBufferConfig, RingBufferError,
    RingBufferEvent, WaitStrategy,
};

fn ring(capacity: usize, wait: WaitStrategy) -> PriorityRingBuffer<Value> {
    PriorityRingBuffer::new(RingBufferConfig::new(capacity, wait, 4)).unwrap()
}

/// Poll `cond` until it holds or five seconds pass.
fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_backpressure_rejects_then_recovers() {
    let rb = ring(8, WaitStrategy::Yielding);
    for i in 1..=8 {
        assert_eq!(rb.publish("order", json!(i), EventPriority::Orders).unwrap(), i);
    }
    let err = rb.publish("order", json!(9), EventPriority::Orders).unwrap_err();
    assert!(err.is_backpressure());
    assert!(matches!(
        err,
        RingBufferError::BackpressureRejected {
            priority: EventPriority::Orders
        }
    ));
    // Other lanes are unaffected.
    assert!(rb.publish("tick", json!(0), EventPriority::MarketData).is_ok());

    rb.add_handler("drain", ConsumerHandler::single(|_: &RingBufferEvent<Value>| Ok(())))
        .unwrap();
    rb.start().unwrap();
    assert!(wait_for(|| rb.consumer_position("drain", EventPriority::Orders) >= Some(1)));

    assert_eq!(rb.publish("order", json!(9), EventPriority::Orders).unwrap(), 9);
    let metrics = rb.get_metrics();
    assert_eq!(metrics.backpressure_rejections, 1);
    assert_eq!(metrics.dropped, 1);
    rb.stop();
}

#[test]
fn test_critical_delivered_before_system() {
    let rb = ring(16, WaitStrategy::Blocking);
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    rb.add_handler(
        "ordered",
        ConsumerHandler::single(move |e: &RingBufferEvent<Value>| {
            sink.lock().unwrap().push(e.priority);
            Ok(())
        }),
    )
    .unwrap();

    rb.publish("heartbeat", json!({}), EventPriority::System).unwrap();
    rb.publish("kill_switch", json!({}), EventPriority::Critical).unwrap();
    rb.start().unwrap();

    assert!(wait_for(|| order.lock().unwrap().len() == 2));
    assert_eq!(
        *order.lock().unwrap(),
        vec![EventPriority::Critical, EventPriority::System]
    );
    rb.stop();
}

#[test]
fn test_burst_of_critical_drains_first() {
    let rb = ring(64, WaitStrategy::Sleeping);
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    rb.add_handler(
        "ordered",
        ConsumerHandler::single(move |e: &RingBufferEvent<Value>| {
            sink.lock().unwrap().push(e.priority);
            Ok(())
        }),
    )
    .unwrap();
    for _ in 0..5 {
        rb.publish("audit", json!({}), EventPriority::Analytics).unwrap();
    }
    for _ in 0..5 {
        rb.publish("risk_breach", json!({}), EventPriority::Critical).unwrap();
    }
    rb.start().unwrap();

    assert!(wait_for(|| order.lock().unwrap().len() == 10));
    let got = order.lock().unwrap().clone();
    assert!(got[..5].iter().all(|p| *p == EventPriority::Critical));
    assert!(got[5..].iter().all(|p| *p == EventPriority::Analytics));
    rb.stop();
}

#[test]
fn test_batch_rejection_is_per_lane() {
    let rb = ring(4, WaitStrategy::Yielding);
    let first = rb.publish_batch(vec![
        BatchEvent::new("order", json!(1), EventPriority::Orders),
        BatchEvent::new("halt", json!(1), EventPriority::Critical),
        BatchEvent::new("order", json!(2), EventPriority::Orders),
        BatchEvent::new("order", json!(3), EventPriority::Orders),
    ]);
    let seqs: Vec<u64> = first.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(seqs, vec![1, 1, 2, 3]);

    // Orders has one slot left; a two-event sub-batch must be refused whole.
    let second = rb.publish_batch(vec![
        BatchEvent::new("order", json!(4), EventPriority::Orders),
        BatchEvent::new("halt", json!(2), EventPriority::Critical).with_metadata(json!({"src": "risk"})),
        BatchEvent::new("order", json!(5), EventPriority::Orders),
    ]);
    assert!(second[0].as_ref().unwrap_err().is_backpressure());
    assert_eq!(*second[1].as_ref().unwrap(), 2);
    assert!(second[2].as_ref().unwrap_err().is_backpressure());
    assert_eq!(rb.remaining_capacity(EventPriority::Orders), 1);

    let metrics = rb.get_metrics();
    assert_eq!(metrics.published, 5);
    assert_eq!(metrics.dropped, 2);
    assert_eq!(metrics.backpressure_rejections, 1);
}

#[test]
fn test_handler_failures_do_not_stop_the_loop() {
    let rb = ring(16, WaitStrategy::Yielding);
    let calls = Arc::new(AtomicU64::new(0));
    let counter = calls.clone();
    rb.add_handler(
        "flaky",
        ConsumerHandler::single(move |e: &RingBufferEvent<Value>| {
            counter.fetch_add(1, Ordering::SeqCst);
            match e.sequence {
                2 => panic!("malformed signal"),
                4 => anyhow::bail!("downstream unavailable"),
                _ => Ok(()),
            }
        }),
    )
    .unwrap();
    rb.start().unwrap();
    for i in 0..5 {
        rb.publish("signal", json!(i), EventPriority::Signals).unwrap();
    }

    assert!(wait_for(|| rb.get_metrics().consumed == 5));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    let metrics = rb.get_metrics();
    assert_eq!(metrics.handler_errors, 2);
    assert_eq!(rb.consumer_position("flaky", EventPriority::Signals), Some(5));
    rb.stop();
}

#[test]
fn test_batch_consumer_respects_batch_size() {
    let rb = ring(64, WaitStrategy::BusySpin);
    for i in 0..10 {
        rb.publish("bar", json!({"close": i}), EventPriority::Analytics).unwrap();
    }
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sink = sizes.clone();
    rb.add_handler(
        "stats",
        ConsumerHandler::batch(
            move |batch: &[Arc<RingBufferEvent<Value>>]| {
                sink.lock().unwrap().push(batch.len());
                Ok(())
            },
            0,
        ),
    )
    .unwrap();
    rb.start().unwrap();

    assert!(wait_for(|| sizes.lock().unwrap().iter().sum::<usize>() == 10));
    // Configured batch size is 4 and everything was published up front.
    assert_eq!(*sizes.lock().unwrap(), vec![4, 4, 2]);
    assert_eq!(rb.get_metrics().batches_processed, 3);
    rb.stop();
}

#[test]
fn test_remove_handler_frees_capacity() {
    let rb = ring(4, WaitStrategy::Yielding);
    rb.add_handler("idle", ConsumerHandler::single(|_: &RingBufferEvent<Value>| Ok(())))
        .unwrap();
    for i in 0..4 {
        rb.publish("tick", json!(i), EventPriority::MarketData).unwrap();
    }
    assert!(rb.publish("tick", json!(4), EventPriority::MarketData).is_err());

    rb.remove_handler("idle").unwrap();
    assert!(rb.consumer_ids().is_empty());
    assert_eq!(rb.remaining_capacity(EventPriority::MarketData), 4);
    assert!(rb.publish("tick", json!(4), EventPriority::MarketData).is_ok());
    assert!(matches!(
        rb.remove_handler("idle"),
        Err(RingBufferError::UnknownConsumer(_))
    ));
}

#[test]
fn test_consumer_registry() {
    let rb = ring(8, WaitStrategy::Sleeping);
    rb.add_handler("a", ConsumerHandler::single(|_: &RingBufferEvent<Value>| Ok(())))
        .unwrap();
    assert!(matches!(
        rb.add_handler("a", ConsumerHandler::single(|_: &RingBufferEvent<Value>| Ok(()))),
        Err(RingBufferError::DuplicateConsumer(_))
    ));
    rb.start().unwrap();
    assert!(rb.is_running());

    // Added while running: starts immediately.
    let hits = Arc::new(AtomicU64::new(0));
    let h = hits.clone();
    rb.add_handler(
        "b",
        ConsumerHandler::single(move |_: &RingBufferEvent<Value>| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    )
    .unwrap();
    rb.publish("tick", json!(1), EventPriority::MarketData).unwrap();
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
    assert_eq!(rb.consumer_ids(), vec!["a".to_string(), "b".to_string()]);

    rb.stop();
    assert!(!rb.is_running());
}

#[test]
fn test_multi_producer_sequences_are_unique() {
    let rb = Arc::new(ring(1024, WaitStrategy::Yielding));
    let consumed = Arc::new(AtomicU64::new(0));
    let c = consumed.clone();
    rb.add_handler(
        "count",
        ConsumerHandler::batch(
            move |batch: &[Arc<RingBufferEvent<Value>>]| {
                c.fetch_add(batch.len() as u64, Ordering::SeqCst);
                Ok(())
            },
            32,
        ),
    )
    .unwrap();
    rb.start().unwrap();

    let mut producers = Vec::new();
    for t in 0..4 {
        let rb = rb.clone();
        producers.push(thread::spawn(move || {
            let mut seqs = Vec::new();
            for i in 0..200 {
                loop {
                    match rb.publish("tick", json!({"t": t, "i": i}), EventPriority::MarketData) {
                        Ok(seq) => {
                            seqs.push(seq);
                            break;
                        }
                        Err(e) if e.is_backpressure() => thread::yield_now(),
                        Err(e) => panic!("{e}"),
                    }
                }
            }
            seqs
        }));
    }
    let mut all: Vec<u64> = producers.into_iter().flat_map(|p| p.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, (1..=800).collect::<Vec<_>>());

    assert!(wait_for(|| consumed.load(Ordering::SeqCst) == 800));
    let metrics = rb.get_metrics();
    assert_eq!(metrics.published, 800);
    assert_eq!(metrics.consumed, 800);
    assert!(metrics.max_latency_us as f64 >= metrics.avg_latency_us.floor());
    rb.stop();
}

#[test]
fn test_invalid_config_rejected() {
    assert!(matches!(
        PriorityRingBuffer::<Value>::new(RingBufferConfig::new(1000, WaitStrategy::BusySpin, 1)),
        Err(RingBufferError::InvalidCapacity(1000))
    ));
    assert!(matches!(
        PriorityRingBuffer::<Value>::new(RingBufferConfig::new(8, WaitStrategy::BusySpin, 0)),
        Err(RingBufferError::InvalidBatchSize)
    ));
    let cfg = RingBufferConfig::new(8, WaitStrategy::BusySpin, 1).with_lane_capacity(EventPriority::System, 6);
    assert!(matches!(
        PriorityRingBuffer::<Value>::new(cfg),
        Err(RingBufferError::InvalidCapacity(6))
    ));
}

#[test]
fn test_per_lane_capacity_and_utilization() {
    let cfg = RingBufferConfig::new(8, WaitStrategy::Yielding, 1).with_lane_capacity(EventPriority::Critical, 2);
    let rb: PriorityRingBuffer<Value> = PriorityRingBuffer::new(cfg).unwrap();
    rb.publish("halt", json!(1), EventPriority::Critical).unwrap();
    rb.publish("halt", json!(2), EventPriority::Critical).unwrap();
    assert!(rb.publish("halt", json!(3), EventPriority::Critical).is_err());

    let metrics = rb.get_metrics();
    let critical = &metrics.lanes[EventPriority::Critical.index()];
    assert_eq!(critical.capacity, 2);
    assert_eq!(critical.utilization, 1.0);
    // 2 used out of 2 + 5 * 8 total slots.
    assert!((metrics.utilization - 2.0 / 42.0).abs() < 1e-12);

    rb.reset_metrics();
    assert_eq!(rb.get_metrics().published, 0);
    assert_eq!(rb.get_metrics().lanes[0].used, 2);
}
