//! Orchestrator
//!
//! Wires the configuration to N publishers and M consumer workers:
//! - consumers are registered first so nothing published is missed
//! - publishers run concurrently, each in its own task; the orchestrator
//!   waits for all of them
//! - consumers then get until the drain timeout (or cancellation) to
//!   handle everything that was published; dead-lettered messages count
//!   as settled
//! - receivers are closed and drained, then the broker is closed, on
//!   every exit path

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, ReceiverHandle};
use crate::config::Settings;
use crate::consumer::{ConsumerWorker, FailureSimulator};
use crate::metrics::DeliveryCounters;
use crate::publisher::{IdFormat, PublishReport, Publisher};
use crate::run_id::RunId;
use crate::utils::error::{BrokerError, PublishError};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Outcome of a run, printed as JSON by the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub published: u64,
    pub publisher_failures: usize,
    pub received: u64,
    pub handled: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    /// Every published message was handled or dead-lettered before the
    /// drain timeout.
    pub drained: bool,
}

pub struct Orchestrator {
    settings: Settings,
    broker: Arc<dyn BrokerClient>,
    counters: Arc<DeliveryCounters>,
    run_id: RunId,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(settings: Settings, broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            settings,
            broker,
            counters: Arc::new(DeliveryCounters::new()),
            run_id: RunId::start(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn counters(&self) -> Arc<DeliveryCounters> {
        self.counters.clone()
    }

    /// Cancelling this token stops publishers and cuts the drain short.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<RunSummary, BrokerError> {
        info!(
            run_id = %self.run_id,
            publishers = self.settings.publisher.count,
            consumers = self.settings.consumer.count,
            "starting run"
        );

        let receivers = match self.start_consumers() {
            Ok(receivers) => receivers,
            Err(e) => {
                self.broker.close().await;
                return Err(e);
            }
        };

        let results = self.publish_all().await;
        // an aborted publisher still counts the batches the broker accepted
        let published: u64 = results
            .iter()
            .map(|result| match result {
                Ok(report) => report.messages,
                Err(e) => e.sent,
            })
            .sum();
        // panicked publisher tasks have no result at all
        let completed = results.iter().filter(|result| result.is_ok()).count();
        let publisher_failures = self.settings.publisher.count - completed;

        let drained = self.wait_for_drain(published).await;
        if !drained {
            warn!(
                published,
                handled = self.counters.handled(),
                "consumers did not settle every published message before the drain ended"
            );
        }

        for receiver in receivers {
            receiver.close().await;
        }
        let stats = self.broker.stats().unwrap_or_default();
        self.broker.close().await;

        let snapshot = self.counters.snapshot();
        let summary = RunSummary {
            run_id: self.run_id.to_string(),
            published,
            publisher_failures,
            received: snapshot.received,
            handled: snapshot.handled,
            redelivered: stats.redelivered,
            dead_lettered: stats.dead_lettered,
            drained,
        };
        info!(
            received = summary.received,
            handled = summary.handled,
            "[Summary]"
        );
        Ok(summary)
    }

    fn start_consumers(&self) -> Result<Vec<ReceiverHandle>, BrokerError> {
        let consumer = &self.settings.consumer;
        let mut receivers = Vec::with_capacity(consumer.count);

        for worker in 0..consumer.count {
            let failures = FailureSimulator::new(
                consumer.simulate_failure_percent,
                consumer.seed.map(|seed| seed.wrapping_add(worker as u64)),
            );
            let handle = ConsumerWorker::new(
                worker.to_string(),
                self.run_id.clone(),
                self.counters.clone(),
                failures,
            )
            .with_handling_delay(Duration::from_millis(consumer.handling_delay_ms))
            .run(
                self.broker.as_ref(),
                &self.settings.broker.topic,
                &self.settings.broker.subscription,
                consumer.concurrency_level,
            );

            match handle {
                Ok(handle) => receivers.push(handle),
                Err(e) => {
                    error!(worker, error = %e, "failed to start consumer");
                    return Err(e);
                }
            }
        }

        Ok(receivers)
    }

    async fn publish_all(&self) -> Vec<Result<PublishReport, PublishError>> {
        let settings = &self.settings.publisher;
        let id_format = if settings.unique_ids {
            IdFormat::RunPublisherSequence
        } else {
            IdFormat::RunSequence
        };

        let tasks = (0..settings.count).map(|index| {
            let publisher = Publisher::new(
                index,
                self.run_id.clone(),
                self.broker.clone(),
                &self.settings.broker.topic,
            )
            .with_id_format(id_format)
            .with_cancellation(self.cancel.child_token());
            let batch_size = settings.batch_size;
            let total = settings.messages_per_publisher;
            tokio::spawn(async move { publisher.publish(batch_size, total).await })
        });

        join_all(tasks)
            .await
            .into_iter()
            .enumerate()
            .filter_map(|(index, joined)| match joined {
                Ok(result) => Some(result),
                Err(e) => {
                    error!(publisher = index, error = %e, "publisher task panicked");
                    None
                }
            })
            .collect()
    }

    /// Wait until every one of `expected` messages is settled: handled by
    /// a consumer or dead-lettered by the broker. Returns false on timeout
    /// or cancellation.
    async fn wait_for_drain(&self, expected: u64) -> bool {
        let timeout = Duration::from_secs(self.settings.run.drain_timeout_secs);
        let caught_up = async {
            while self.settled() < expected {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = tokio::time::timeout(timeout, caught_up) => result.is_ok(),
        }
    }

    fn settled(&self) -> u64 {
        let dead_lettered = self
            .broker
            .stats()
            .map_or(0, |stats| stats.dead_lettered);
        self.counters.handled() + dead_lettered
    }
}
