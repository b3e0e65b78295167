//! Durable event journal and priority ring buffer for the trading event bus.
//!
//! - [`journal`]: segmented, checksum-verified write-ahead journal with
//!   crash recovery, checkpoints, deterministic replay and replica tracking.
//! - [`ring`]: priority-laned ring buffer with consumer-gated backpressure.

pub mod config;
pub mod error;
pub mod journal;
pub mod logging;
pub mod ring;

pub use config::{JournalConfig, RingBufferConfig};
pub use error::{JournalError, RingBufferError};
pub use journal::entry::{EventMetadata, JournalEntry};
pub use journal::replay::{ReplayOptions, ReplayStart};
pub use journal::{Journal, JournalState};
pub use ring::{BatchEvent, ConsumerHandler, EventPriority, PriorityRingBuffer, RingBufferEvent, WaitStrategy};
