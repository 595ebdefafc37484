//! Publisher
//!
//! Builds `total_count` messages tagged with the run id and sends them in
//! batches of at most `batch_size`, in sequence order. A failed batch
//! aborts this publisher only.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::BrokerClient;
use crate::broker::message::{Message, MessagePayload};
use crate::run_id::RunId;
use crate::utils::error::{PublishError, TransportError};

/// How message ids are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdFormat {
    /// `{runId}.{seq}`. Publishers of the same run produce the same ids.
    #[default]
    RunSequence,
    /// `{runId}.{publisher}.{seq}`, unique across the publishers of a run.
    RunPublisherSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub publisher: usize,
    pub messages: u64,
    pub batches: u64,
}

pub struct Publisher {
    index: usize,
    run_id: RunId,
    broker: Arc<dyn BrokerClient>,
    topic: String,
    id_format: IdFormat,
    cancel: CancellationToken,
}

impl Publisher {
    pub fn new(index: usize, run_id: RunId, broker: Arc<dyn BrokerClient>, topic: &str) -> Self {
        Self {
            index,
            run_id,
            broker,
            topic: topic.to_string(),
            id_format: IdFormat::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_id_format(mut self, id_format: IdFormat) -> Self {
        self.id_format = id_format;
        self
    }

    /// Abort between (and during) batch sends once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn message_id(&self, sequence: u64) -> String {
        match self.id_format {
            IdFormat::RunSequence => format!("{}.{}", self.run_id, sequence),
            IdFormat::RunPublisherSequence => {
                format!("{}.{}.{}", self.run_id, self.index, sequence)
            }
        }
    }

    /// The payload name is the message id.
    pub fn build_message(&self, sequence: u64) -> Result<Message, serde_json::Error> {
        let id = self.message_id(sequence);
        let payload = MessagePayload {
            name: id.clone(),
            run_id: self.run_id.to_string(),
        };
        Message::json(id, &payload)
    }

    /// Send `total_count` messages, sequence numbers starting at 1, in
    /// batches of at most `batch_size`.
    pub async fn publish(
        &self,
        batch_size: usize,
        total_count: u64,
    ) -> Result<PublishReport, PublishError> {
        let batch_size = batch_size.max(1);
        let mut buffer = Vec::with_capacity(batch_size);
        let mut first_sequence = 1;
        let mut batches = 0;

        for sequence in 1..=total_count {
            let message = self
                .build_message(sequence)
                .map_err(|e| self.failed(first_sequence, e.into()))?;
            buffer.push(message);

            if buffer.len() >= batch_size {
                let batch = std::mem::replace(&mut buffer, Vec::with_capacity(batch_size));
                self.send_batch(batch, first_sequence).await?;
                batches += 1;
                first_sequence = sequence + 1;
                tokio::task::yield_now().await;
            }
        }

        if !buffer.is_empty() {
            self.send_batch(buffer, first_sequence).await?;
            batches += 1;
        }

        info!(
            publisher = self.index,
            messages = total_count,
            batches,
            "finished publishing"
        );
        Ok(PublishReport {
            publisher: self.index,
            messages: total_count,
            batches,
        })
    }

    async fn send_batch(&self, batch: Vec<Message>, first_sequence: u64) -> Result<(), PublishError> {
        if self.cancel.is_cancelled() {
            return Err(self.failed(first_sequence, TransportError::Cancelled));
        }

        info!(
            publisher = self.index,
            batch_size = batch.len(),
            first_sequence,
            "sending batch"
        );
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.broker.send(&self.topic, batch) => result,
        };
        result.map_err(|source| self.failed(first_sequence, source))
    }

    fn failed(&self, first_sequence: u64, source: TransportError) -> PublishError {
        let err = PublishError {
            publisher: self.index,
            first_sequence,
            sent: first_sequence - 1,
            source,
        };
        error!(error = %err, "publisher aborted");
        err
    }
}
