//! The `error` module defines the error types used within `dedupsub`.
//!
//! Errors are split by failure domain: the transport (sending a batch),
//! the broker connection itself, message handling inside a consumer and
//! a publisher task as a whole.

use thiserror::Error;

/// A batch send failed. Sends are all-or-nothing, so none of the batch
/// was accepted by the broker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("topic '{0}' does not exist")]
    TopicNotFound(String),

    #[error("batch of {size} messages exceeds the broker limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("refusing to send an empty batch")]
    EmptyBatch,

    #[error("broker connection is closed")]
    Closed,

    #[error("send cancelled")]
    Cancelled,

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Connection-level broker failures. These are not recovered; at startup
/// they terminate the process.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unsupported broker endpoint '{0}'")]
    UnsupportedEndpoint(String),

    #[error("subscription '{subscription}' not found on topic '{topic}'")]
    SubscriptionNotFound { topic: String, subscription: String },

    #[error("invalid handler options: {0}")]
    InvalidOptions(String),

    #[error("broker connection is closed")]
    Closed,

    #[error("dead-letter store failure: {0}")]
    DeadLetter(#[from] sled::Error),

    #[error("failed to encode dead letter: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure of a single handler invocation. The broker turns any of these
/// into a negative acknowledgement and redelivers the message.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed payload: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("simulated processing failure in worker {worker_id} for message {message_id}")]
    Simulated {
        worker_id: String,
        message_id: String,
    },
}

/// A publisher task aborted. Only the publisher that hit the error stops;
/// its siblings keep running.
#[derive(Debug, Error)]
#[error("publisher {publisher} failed sending the batch starting at sequence {first_sequence}: {source}")]
pub struct PublishError {
    pub publisher: usize,
    pub first_sequence: u64,
    /// Messages the broker accepted before the failing batch.
    pub sent: u64,
    #[source]
    pub source: TransportError,
}
