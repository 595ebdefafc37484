//! Lock-free counters for received and successfully handled deliveries.
//!
//! Both fields are independent atomics. A snapshot may observe them at
//! slightly different instants, but `handled` is only ever incremented
//! after the matching `received` increment, so a snapshot that loads
//! `handled` first can never show `handled > received`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct DeliveryCounters {
    received: AtomicU64,
    handled: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub handled: u64,
}

impl DeliveryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value after the increment.
    pub fn increment_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the value after the increment.
    pub fn increment_handled(&self) -> u64 {
        self.handled.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Acquire)
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        // handled first: see module docs
        let handled = self.handled.load(Ordering::Acquire);
        let received = self.received.load(Ordering::Acquire);
        CounterSnapshot { received, handled }
    }
}
