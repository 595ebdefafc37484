//! # dedupsub
//!
//! `dedupsub` is a harness for watching at-least-once delivery over a
//! topic/subscription broker. Publishers push batches of run-tagged
//! messages; consumer workers handle them under a concurrency cap, fail a
//! configurable share on purpose and count what they received versus
//! what they handled, while the broker redelivers failures.
//!
//! ## Core Modules
//!
//! - `broker`: the broker interface plus an in-memory implementation with
//!   peek-lock delivery, backoff redelivery and dead-lettering.
//! - `config`: loading settings from file and environment.
//! - `consumer`: the consumer worker and its failure simulation.
//! - `metrics`: lock-free received/handled counters.
//! - `orchestrator`: wires publishers and consumers into a run.
//! - `persistence`: the `sled`-backed dead-letter store.
//! - `publisher`: batching publisher.
//! - `run_id`: the per-process run tag used to filter stale messages.
//! - `utils`: errors and logging.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod metrics;
pub mod orchestrator;
pub mod persistence;
pub mod publisher;
pub mod run_id;
pub mod utils;
