//! Idle policies for consumer loops and the publisher wake-up signal.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// How a consumer waits when every lane is empty.
///
/// `BusySpin` never gives up the core. It is the lowest-latency option and
/// burns a full CPU per consumer while idle; only pick it for dedicated cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    BusySpin,
    /// Spin briefly, then `thread::yield_now`.
    Yielding,
    /// Spin briefly, then park with a growing timeout.
    Sleeping,
    /// Spin briefly, then wait on a condition variable signalled by publishers.
    Blocking,
}

impl WaitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitStrategy::BusySpin => "busy_spin",
            WaitStrategy::Yielding => "yielding",
            WaitStrategy::Sleeping => "sleeping",
            WaitStrategy::Blocking => "blocking",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "busy_spin" | "busyspin" | "spin" => Some(WaitStrategy::BusySpin),
            "yielding" | "yield" => Some(WaitStrategy::Yielding),
            "sleeping" | "sleep" => Some(WaitStrategy::Sleeping),
            "blocking" | "block" => Some(WaitStrategy::Blocking),
            _ => None,
        }
    }

    fn spin_limit(&self) -> u32 {
        match self {
            WaitStrategy::BusySpin => u32::MAX,
            WaitStrategy::Yielding => 100,
            WaitStrategy::Sleeping | WaitStrategy::Blocking => 10,
        }
    }
}

const MIN_BACKOFF: Duration = Duration::from_micros(50);
const MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Publish generation counter plus a condvar for `Blocking` consumers.
///
/// Publishers always bump the generation; they only take the lock when a
/// consumer is actually waiting.
pub(crate) struct Signal {
    generation: AtomicU64,
    waiters: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn notify(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
            self.cond.notify_all();
        }
    }

    /// Wait until the generation moves past `seen` or `timeout` elapses.
    pub(crate) fn wait(&self, seen: u64, timeout: Duration) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        while self.generation.load(Ordering::SeqCst) == seen {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.cond.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
        drop(guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-consumer idle state.
pub(crate) struct Idler {
    strategy: WaitStrategy,
    idle: u32,
    backoff: Duration,
}

impl Idler {
    pub(crate) fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            idle: 0,
            backoff: MIN_BACKOFF,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.idle = 0;
        self.backoff = MIN_BACKOFF;
    }

    /// Called after a scan found nothing; `seen` is the generation read before the scan.
    pub(crate) fn idle(&mut self, signal: &Signal, seen: u64) {
        self.idle = self.idle.saturating_add(1);
        if self.idle < self.strategy.spin_limit() {
            std::hint::spin_loop();
            return;
        }
        match self.strategy {
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding => thread::yield_now(),
            WaitStrategy::Sleeping => {
                thread::park_timeout(self.backoff);
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
            }
            WaitStrategy::Blocking => {
                signal.wait(seen, self.backoff);
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_parse() {
        assert_eq!(WaitStrategy::parse("busy-spin"), Some(WaitStrategy::BusySpin));
        assert_eq!(WaitStrategy::parse("Yielding"), Some(WaitStrategy::Yielding));
        assert_eq!(WaitStrategy::parse("blocking"), Some(WaitStrategy::Blocking));
        assert_eq!(WaitStrategy::parse("lazy"), None);
    }

    #[test]
    fn test_wait_returns_when_generation_moved() {
        let signal = Signal::new();
        let seen = signal.generation();
        signal.notify();
        let start = Instant::now();
        signal.wait(seen, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let seen = signal.generation();
        let s = signal.clone();
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            s.wait(seen, Duration::from_secs(5));
            start.elapsed()
        });
        thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert!(waiter.join().unwrap() < Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_is_capped() {
        let signal = Signal::new();
        let mut idler = Idler::new(WaitStrategy::Blocking);
        for _ in 0..20 {
            idler.idle(&signal, signal.generation());
        }
        assert_eq!(idler.backoff, MAX_BACKOFF);
        idler.reset();
        assert_eq!(idler.backoff, MIN_BACKOFF);
    }
}
