//! Process-wide counters exposed on the internal metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Relaxed)
    }
}

/// Subscribe responses received across all targets.
pub static RESPONSES: Counter = Counter::new();

/// Stream errors observed across all targets.
pub static STREAM_ERRORS: Counter = Counter::new();

/// Updates dropped because their value failed to decode.
pub static DECODE_FAILURES: Counter = Counter::new();
