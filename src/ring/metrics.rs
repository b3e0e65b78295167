use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::lane::LaneStats;

/// Weight of the newest sample in the rolling latency average.
const LATENCY_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RingBufferMetrics {
    pub published: u64,
    pub consumed: u64,
    /// Events that never entered a lane.
    pub dropped: u64,
    /// Refused claims; a rejected batch sub-range counts once.
    pub backpressure_rejections: u64,
    pub batches_processed: u64,
    pub handler_errors: u64,
    /// Rolling average publish-to-consume latency.
    pub avg_latency_us: f64,
    pub max_latency_us: u64,
    /// Used slots over total slots across all lanes.
    pub utilization: f64,
    pub lanes: Vec<LaneStats>,
}

#[derive(Default)]
pub(crate) struct MetricsRecorder {
    published: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
    backpressure_rejections: AtomicU64,
    batches_processed: AtomicU64,
    handler_errors: AtomicU64,
    /// f64 bits; 0 means no sample yet.
    avg_latency_bits: AtomicU64,
    max_latency_us: AtomicU64,
}

impl MetricsRecorder {
    pub(crate) fn on_published(&self, n: u64) {
        self.published.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn on_rejected(&self, dropped: u64) {
        self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub(crate) fn on_consumed(&self, n: u64) {
        self.consumed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn on_batch(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_latency(&self, micros: u64) {
        self.max_latency_us.fetch_max(micros, Ordering::Relaxed);
        let sample = micros as f64;
        let mut current = self.avg_latency_bits.load(Ordering::Relaxed);
        loop {
            let avg = f64::from_bits(current);
            let next = if current == 0 {
                sample
            } else {
                avg + LATENCY_ALPHA * (sample - avg)
            };
            match self.avg_latency_bits.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn snapshot(&self, lanes: Vec<LaneStats>) -> RingBufferMetrics {
        let used: u64 = lanes.iter().map(|l| l.used).sum();
        let total: u64 = lanes.iter().map(|l| l.capacity).sum();
        RingBufferMetrics {
            published: self.published.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            avg_latency_us: f64::from_bits(self.avg_latency_bits.load(Ordering::Relaxed)),
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
            utilization: if total > 0 { used as f64 / total as f64 } else { 0.0 },
            lanes,
        }
    }

    /// Zero the counters. Lane positions are not metrics and stay put.
    pub(crate) fn reset(&self) {
        for counter in [
            &self.published,
            &self.consumed,
            &self.dropped,
            &self.backpressure_rejections,
            &self.batches_processed,
            &self.handler_errors,
            &self.avg_latency_bits,
            &self.max_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_average_and_max() {
        let m = MetricsRecorder::default();
        m.record_latency(100);
        let snap = m.snapshot(Vec::new());
        assert_eq!(snap.avg_latency_us, 100.0);

        m.record_latency(200);
        let snap = m.snapshot(Vec::new());
        assert!((snap.avg_latency_us - 110.0).abs() < 1e-9);
        assert_eq!(snap.max_latency_us, 200);
    }

    #[test]
    fn test_rejection_counts_once_per_claim() {
        let m = MetricsRecorder::default();
        m.on_rejected(5);
        m.on_rejected(1);
        let snap = m.snapshot(Vec::new());
        assert_eq!(snap.backpressure_rejections, 2);
        assert_eq!(snap.dropped, 6);
        assert_eq!(snap.utilization, 0.0);
    }

    #[test]
    fn test_reset() {
        let m = MetricsRecorder::default();
        m.on_published(3);
        m.on_consumed(2);
        m.record_latency(50);
        m.reset();
        let snap = m.snapshot(Vec::new());
        assert_eq!(snap.published, 0);
        assert_eq!(snap.consumed, 0);
        assert_eq!(snap.avg_latency_us, 0.0);
    }
}
