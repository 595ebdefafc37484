//! Broker interface
//!
//! The harness only ever talks to a broker through [`BrokerClient`]:
//! `send` a batch to a topic, and `subscribe` a handler to a subscription
//! with a concurrency cap. Redelivery, backoff and dead-lettering are the
//! broker's business. [`engine::InMemoryBroker`] is the in-process
//! implementation used by the binary and the tests.

pub mod engine;
pub mod message;
pub mod topic;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::utils::error::{BrokerError, HandlerError, TransportError};
pub use engine::{InMemoryBroker, RedeliveryPolicy};
use message::{DeliveryMetadata, Message};

/// Processes one delivery. `Ok` completes the message, `Err` hands it
/// back to the broker for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message, delivery: &DeliveryMetadata)
    -> Result<(), HandlerError>;
}

/// Where a handler failure is reported before the broker redelivers.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, error: &HandlerError, context: &ErrorContext);
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub topic: String,
    pub subscription: String,
    pub message_id: String,
    pub delivery_count: u32,
    /// Lock token of the failed attempt.
    pub lock_token: Uuid,
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerOptions {
    /// Upper bound on concurrently running handler invocations for one
    /// receiver.
    pub max_concurrent_calls: usize,
}

impl HandlerOptions {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            max_concurrent_calls,
        }
    }
}

/// Broker-side delivery statistics, when the broker exposes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub completed: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Send a batch. All-or-nothing: on error none of it was accepted.
    async fn send(&self, topic: &str, batch: Vec<Message>) -> Result<(), TransportError>;

    /// Start a receive loop dispatching to `handler`. Must be called from
    /// within a Tokio runtime.
    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: HandlerOptions,
        handler: Arc<dyn MessageHandler>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Result<ReceiverHandle, BrokerError>;

    /// Stop every receive loop, wait for in-flight handlers and release
    /// the connection. Idempotent.
    async fn close(&self);

    fn stats(&self) -> Option<BrokerStats> {
        None
    }
}

/// A running receive loop.
#[derive(Debug)]
pub struct ReceiverHandle {
    pub id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReceiverHandle {
    pub fn new(id: String, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { id, cancel, task }
    }

    /// Stop receiving and wait until every in-flight handler has settled.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(receiver = %self.id, error = %e, "receive loop panicked");
        }
    }
}

#[cfg(test)]
mod tests;
