//! Delivery accounting shared by all consumer workers.

pub mod counters;

pub use counters::{CounterSnapshot, DeliveryCounters};
