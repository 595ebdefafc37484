//! The `persistence` module keeps messages the broker gave up on.
//!
//! Messages that exhaust their delivery budget are moved into a
//! `sled`-backed dead-letter store, one tree per subscription, so they
//! can be inspected after the run. Without a configured path the store
//! is temporary and disappears with the process.

pub mod dead_letter;

pub use dead_letter::{DeadLetter, DeadLetterStore};
