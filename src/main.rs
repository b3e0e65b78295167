use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use tokio::time::{interval, Duration, Instant};

use tradebus::journal::timers::spawn_maintenance;
use tradebus::logging::{log, obj, v_num, v_str, Domain, Level};
use tradebus::{
    ConsumerHandler, EventMetadata, EventPriority, Journal, JournalConfig, PriorityRingBuffer, RingBufferConfig,
    RingBufferEvent,
};

const SYMBOL: &str = "BTCUSDT";

#[tokio::main]
async fn main() -> Result<()> {
    let journal_cfg = JournalConfig::from_env();
    let ring_cfg = RingBufferConfig::from_env();
    let run_secs: u64 = std::env::var("RUN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("journal_dir", v_str(&journal_cfg.dir.to_string_lossy())),
            ("ring_capacity", json!(ring_cfg.capacity)),
            ("wait", v_str(ring_cfg.wait_strategy.as_str())),
            ("run_secs", json!(run_secs)),
        ]),
    );

    let journal = Arc::new(Journal::open(journal_cfg)?);
    let maintenance = spawn_maintenance(journal.clone());

    // Resume the synthetic price from the last snapshot, if any
    let mut price = match journal.restore_latest()? {
        Some((cp, Some(state))) => {
            log(
                Level::Info,
                Domain::Checkpoint,
                "state_restored",
                obj(&[("checkpoint_id", v_str(&cp.checkpoint_id))]),
            );
            state["price"].as_f64().unwrap_or(50_000.0)
        }
        _ => 50_000.0,
    };

    let ring: Arc<PriorityRingBuffer> = Arc::new(PriorityRingBuffer::new(ring_cfg)?);

    ring.add_handler(
        "audit",
        ConsumerHandler::single(|e: &RingBufferEvent<serde_json::Value>| {
            if e.priority <= EventPriority::Orders && e.event_type != "tick" {
                log(
                    Level::Info,
                    Domain::Consumer,
                    "audit",
                    obj(&[
                        ("priority", v_str(e.priority.as_str())),
                        ("event_type", v_str(&e.event_type)),
                        ("sequence", json!(e.sequence)),
                        ("payload", e.payload.clone()),
                    ]),
                );
            }
            Ok(())
        }),
    )?;

    let analyzed = Arc::new(AtomicU64::new(0));
    let analyzed_sink = analyzed.clone();
    ring.add_handler(
        "analytics",
        ConsumerHandler::batch(
            move |batch: &[Arc<RingBufferEvent<serde_json::Value>>]| {
                let prices: Vec<f64> = batch.iter().filter_map(|e| e.payload["price"].as_f64()).collect();
                if !prices.is_empty() {
                    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
                    log(
                        Level::Trace,
                        Domain::Consumer,
                        "batch_mean",
                        obj(&[("n", json!(prices.len())), ("mean", v_num(mean))]),
                    );
                }
                analyzed_sink.fetch_add(batch.len() as u64, Ordering::Relaxed);
                Ok(())
            },
            0,
        ),
    )?;
    ring.start()?;

    let deadline = Instant::now() + Duration::from_secs(run_secs);
    let mut ticker = interval(Duration::from_millis(10));
    let mut rng = rand::thread_rng();
    let mut ticks = 0u64;
    let mut rejected = 0u64;

    while Instant::now() < deadline {
        ticker.tick().await;
        ticks += 1;
        price *= 1.0 + rng.gen_range(-0.0005..0.0005);
        let tick = json!({"symbol": SYMBOL, "price": price, "ts": tradebus::logging::ts_epoch_ms()});

        journal.append("tick", tick.clone(), EventMetadata::with_source("demo-feed"))?;
        if ring.publish("tick", tick, EventPriority::MarketData).is_err() {
            rejected += 1;
        }

        if ticks % 25 == 0 {
            let signal = json!({"symbol": SYMBOL, "side": if rng.gen_bool(0.5) { "buy" } else { "sell" }});
            let _ = ring.publish("signal", signal, EventPriority::Signals);
        }
        if ticks % 100 == 0 {
            let order = json!({"symbol": SYMBOL, "qty": 0.01, "price": price});
            let seq = journal.append(
                "order_submitted",
                order.clone(),
                EventMetadata::with_source("demo-strategy").correlated(&format!("ord-{}", ticks)),
            )?;
            let _ = ring.publish_with_metadata("order", order, EventPriority::Orders, json!({"journal_sequence": seq}));

            let metrics = ring.get_metrics();
            log(
                Level::Info,
                Domain::Ring,
                "metrics",
                obj(&[
                    ("published", json!(metrics.published)),
                    ("consumed", json!(metrics.consumed)),
                    ("rejections", json!(metrics.backpressure_rejections)),
                    ("avg_latency_us", v_num(metrics.avg_latency_us)),
                    ("max_latency_us", json!(metrics.max_latency_us)),
                    ("utilization", v_num(metrics.utilization)),
                ]),
            );
        }
    }

    ring.publish("shutdown", json!({"ticks": ticks}), EventPriority::System)?;
    ring.stop();
    maintenance.abort();

    let cp = journal.create_checkpoint(Some(json!({"price": price, "ticks": ticks})))?;
    let stats = journal.stats();
    journal.close()?;

    log(
        Level::Info,
        Domain::System,
        "shutdown",
        obj(&[
            ("ticks", json!(ticks)),
            ("rejected", json!(rejected)),
            ("analyzed", json!(analyzed.load(Ordering::Relaxed))),
            ("last_sequence", json!(stats.last_sequence)),
            ("segments", json!(stats.segment_count)),
            ("checkpoint_id", v_str(&cp.checkpoint_id)),
        ]),
    );
    Ok(())
}
