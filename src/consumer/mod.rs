//! Consumer worker
//!
//! A `ConsumerWorker` is the handler registered against the shared
//! subscription. Per delivery it:
//! 1. decodes the JSON payload (a malformed body fails the delivery)
//! 2. completes messages from other runs without touching the counters
//! 3. counts the delivery as received
//! 4. fails a configurable share of deliveries on purpose
//! 5. counts the rest as handled and completes them
//!
//! Failures are returned to the broker, which reports them to the
//! worker's error sink and redelivers. There is no local retry.

mod failure;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::broker::message::{DeliveryMetadata, Message};
use crate::broker::{
    BrokerClient, ErrorContext, ErrorSink, HandlerOptions, MessageHandler, ReceiverHandle,
};
use crate::metrics::DeliveryCounters;
use crate::run_id::RunId;
use crate::utils::error::{BrokerError, HandlerError};
pub use failure::FailureSimulator;

pub struct ConsumerWorker {
    worker_id: String,
    run_id: RunId,
    counters: Arc<DeliveryCounters>,
    failures: FailureSimulator,
    handling_delay: Duration,
}

impl ConsumerWorker {
    pub fn new(
        worker_id: impl Into<String>,
        run_id: RunId,
        counters: Arc<DeliveryCounters>,
        failures: FailureSimulator,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            run_id,
            counters,
            failures,
            handling_delay: Duration::ZERO,
        }
    }

    /// Simulated processing time spent on every owned delivery.
    pub fn with_handling_delay(mut self, delay: Duration) -> Self {
        self.handling_delay = delay;
        self
    }

    /// Register this worker against `subscription` with at most
    /// `concurrency_level` deliveries in flight. Runs until the returned
    /// handle (or the broker) is closed.
    pub fn run(
        self,
        broker: &dyn BrokerClient,
        topic: &str,
        subscription: &str,
        concurrency_level: usize,
    ) -> Result<ReceiverHandle, BrokerError> {
        info!(worker_id = %self.worker_id, concurrency_level, "running listener");
        let sink = Arc::new(LoggingErrorSink {
            worker_id: self.worker_id.clone(),
        });
        broker.subscribe(
            topic,
            subscription,
            HandlerOptions::new(concurrency_level),
            Arc::new(self),
            sink,
        )
    }
}

#[async_trait]
impl MessageHandler for ConsumerWorker {
    async fn handle(
        &self,
        message: &Message,
        delivery: &DeliveryMetadata,
    ) -> Result<(), HandlerError> {
        let payload = message.payload()?;

        if !self.run_id.owns(&payload.run_id) {
            debug!(
                worker_id = %self.worker_id,
                message_id = %message.id,
                run_id = %payload.run_id,
                "skipping message from another run"
            );
            return Ok(());
        }

        self.counters.increment_received();

        if !self.handling_delay.is_zero() {
            tokio::time::sleep(self.handling_delay).await;
        }

        if self.failures.should_fail() {
            return Err(HandlerError::Simulated {
                worker_id: self.worker_id.clone(),
                message_id: message.id.clone(),
            });
        }

        let handled = self.counters.increment_handled();
        info!(
            worker_id = %self.worker_id,
            name = %payload.name,
            delivery_count = delivery.delivery_count,
            queued_ms = (Utc::now() - delivery.enqueued_at).num_milliseconds(),
            received = self.counters.received(),
            handled,
            "message handled"
        );
        Ok(())
    }
}

/// Logs handler failures; the broker takes care of redelivery.
pub struct LoggingErrorSink {
    worker_id: String,
}

impl ErrorSink for LoggingErrorSink {
    fn report(&self, error: &HandlerError, context: &ErrorContext) {
        warn!(
            worker_id = %self.worker_id,
            message_id = %context.message_id,
            delivery_count = context.delivery_count,
            lock_token = %context.lock_token,
            error = %error,
            "handler failed"
        );
    }
}
