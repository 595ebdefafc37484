//! In-memory broker engine
//!
//! This module contains the in-process broker the harness runs against.
//! It is responsible for:
//! - managing topics and their subscriptions
//! - accepting batches all-or-nothing and fanning them out
//! - running peek-lock receive loops capped at a per-receiver concurrency
//! - redelivering failed messages with exponential backoff and moving
//!   them to the dead-letter store once the delivery limit is reached
//!
//! Concurrency and usage notes:
//! - Topics are kept behind a short-lived lock that is never held across
//!   an await point.
//! - Receive loops, handler invocations and redelivery timers are all
//!   spawned on one `TaskTracker`, so `close` can wait for every one of
//!   them before flushing the dead-letter store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::message::{DeliveryMetadata, Message};
use crate::broker::topic::{Delivery, Subscription, Topic};
use crate::broker::{
    BrokerClient, BrokerStats, ErrorContext, ErrorSink, HandlerOptions, MessageHandler,
    ReceiverHandle,
};
use crate::config::BrokerSettings;
use crate::persistence::{DeadLetter, DeadLetterStore};
use crate::utils::error::{BrokerError, HandlerError, TransportError};

pub const MEMORY_SCHEME: &str = "memory://";

/// Largest per-receiver concurrency cap: the semaphore's permit limit, and
/// the drain acquires every permit in one `u32` request.
pub const MAX_CONCURRENT_CALLS: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

/// When and how often a failed message comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Deliveries allowed before a message is dead-lettered.
    pub max_delivery_count: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RedeliveryPolicy {
    /// Backoff before the redelivery that follows attempt `delivery_count`:
    /// `base * 2^(delivery_count - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, delivery_count: u32) -> Duration {
        let factor = 1u32
            .checked_shl(delivery_count.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn is_exhausted(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_delivery_count
    }
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_delivery_count: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl From<&BrokerSettings> for RedeliveryPolicy {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            max_delivery_count: settings.max_delivery_count,
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            max_delay: Duration::from_millis(settings.retry_max_delay_ms),
        }
    }
}

#[derive(Debug)]
struct Shared {
    topics: Mutex<HashMap<String, Topic>>,
    policy: RedeliveryPolicy,
    max_batch_size: usize,
    dead_letters: DeadLetterStore,
    completed: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Shared {
    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything a receive loop and its handler tasks share.
struct Receiver {
    id: String,
    topic: String,
    subscription: Arc<Subscription>,
    handler: Arc<dyn MessageHandler>,
    error_sink: Arc<dyn ErrorSink>,
    permits: Arc<Semaphore>,
    max_concurrent_calls: u32,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new(policy: RedeliveryPolicy, max_batch_size: usize, dead_letters: DeadLetterStore) -> Self {
        Self {
            shared: Arc::new(Shared {
                topics: Mutex::new(HashMap::new()),
                policy,
                max_batch_size,
                dead_letters,
                completed: AtomicU64::new(0),
                redelivered: AtomicU64::new(0),
                dead_lettered: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Open a broker for a `memory://` endpoint and create the configured
    /// topic and subscription.
    pub fn connect(settings: &BrokerSettings) -> Result<Self, BrokerError> {
        if !settings.endpoint.starts_with(MEMORY_SCHEME) {
            return Err(BrokerError::UnsupportedEndpoint(settings.endpoint.clone()));
        }

        let dead_letters = DeadLetterStore::open(settings.dead_letter_path.as_deref())?;
        let broker = Self::new(
            RedeliveryPolicy::from(settings),
            settings.max_batch_size,
            dead_letters,
        );
        broker.create_subscription(&settings.topic, &settings.subscription);

        info!(
            endpoint = %settings.endpoint,
            topic = %settings.topic,
            subscription = %settings.subscription,
            "connected to broker"
        );
        Ok(broker)
    }

    /// Create a subscription, creating the topic too if it doesn't exist.
    /// Only messages sent after this call reach the subscription.
    pub fn create_subscription(&self, topic: &str, name: &str) {
        self.shared
            .topics()
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .add_subscription(name);
    }

    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.shared.dead_letters
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn send(&self, topic: &str, batch: Vec<Message>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if batch.is_empty() {
            return Err(TransportError::EmptyBatch);
        }
        if batch.len() > self.shared.max_batch_size {
            return Err(TransportError::BatchTooLarge {
                size: batch.len(),
                max: self.shared.max_batch_size,
            });
        }

        let topics = self.shared.topics();
        let target = topics
            .get(topic)
            .ok_or_else(|| TransportError::TopicNotFound(topic.to_string()))?;
        for message in &batch {
            target.fan_out(message);
        }

        debug!(topic, batch_size = batch.len(), "batch accepted");
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: HandlerOptions,
        handler: Arc<dyn MessageHandler>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Result<ReceiverHandle, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let max_concurrent_calls = Some(options.max_concurrent_calls)
            .filter(|&n| (1..=MAX_CONCURRENT_CALLS).contains(&n))
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                BrokerError::InvalidOptions(format!(
                    "max_concurrent_calls must be between 1 and {}, got {}",
                    MAX_CONCURRENT_CALLS,
                    options.max_concurrent_calls
                ))
            })?;

        let queue = self
            .shared
            .topics()
            .get(topic)
            .and_then(|t| t.subscription(subscription))
            .ok_or_else(|| BrokerError::SubscriptionNotFound {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
            })?;

        let id = Uuid::new_v4().to_string();
        let cancel = self.shared.shutdown.child_token();
        let receiver = Arc::new(Receiver {
            id: id.clone(),
            topic: topic.to_string(),
            subscription: queue,
            handler,
            error_sink,
            permits: Arc::new(Semaphore::new(max_concurrent_calls as usize)),
            max_concurrent_calls,
            cancel: cancel.clone(),
        });

        let task = self
            .shared
            .tracker
            .spawn(receive_loop(self.shared.clone(), receiver));

        info!(
            receiver = %id,
            topic,
            subscription,
            max_concurrent_calls,
            "receiver started"
        );
        Ok(ReceiverHandle::new(id, cancel, task))
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        if let Err(e) = self.shared.dead_letters.flush().await {
            error!(error = %e, "failed to flush dead-letter store");
        }
        info!("broker connection closed");
    }

    fn stats(&self) -> Option<BrokerStats> {
        Some(BrokerStats {
            completed: self.shared.completed.load(Ordering::Acquire),
            redelivered: self.shared.redelivered.load(Ordering::Acquire),
            dead_lettered: self.shared.dead_lettered.load(Ordering::Acquire),
        })
    }
}

async fn receive_loop(shared: Arc<Shared>, receiver: Arc<Receiver>) {
    loop {
        // Take a permit before the message so a waiting message stays
        // available to other receivers.
        let permit = tokio::select! {
            _ = receiver.cancel.cancelled() => break,
            permit = receiver.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            _ = receiver.cancel.cancelled() => break,
            delivery = receiver.subscription.receive() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let task_shared = shared.clone();
        let task_receiver = receiver.clone();
        shared.tracker.spawn(async move {
            let _permit = permit;
            dispatch(&task_shared, &task_receiver, delivery).await;
        });
    }

    // drain: every permit back means nothing is in flight
    if let Ok(all) = receiver
        .permits
        .acquire_many(receiver.max_concurrent_calls)
        .await
    {
        drop(all);
    }
    debug!(receiver = %receiver.id, "receive loop stopped");
}

async fn dispatch(shared: &Arc<Shared>, receiver: &Receiver, delivery: Delivery) {
    let metadata = DeliveryMetadata {
        delivery_count: delivery.delivery_count,
        lock_token: Uuid::new_v4(),
        enqueued_at: delivery.enqueued_at,
    };

    match receiver.handler.handle(&delivery.message, &metadata).await {
        Ok(()) => {
            shared.completed.fetch_add(1, Ordering::AcqRel);
        }
        Err(err) => {
            receiver.error_sink.report(
                &err,
                &ErrorContext {
                    topic: receiver.topic.clone(),
                    subscription: receiver.subscription.name.clone(),
                    message_id: delivery.message.id.clone(),
                    delivery_count: delivery.delivery_count,
                    lock_token: metadata.lock_token,
                },
            );
            abandon(shared, receiver, delivery, &err);
        }
    }
}

/// Negative acknowledgement: schedule a redelivery, or dead-letter the
/// message once its delivery budget is spent.
fn abandon(shared: &Arc<Shared>, receiver: &Receiver, delivery: Delivery, err: &HandlerError) {
    if shared.policy.is_exhausted(delivery.delivery_count) {
        let letter = DeadLetter {
            message_id: delivery.message.id.clone(),
            content_type: delivery.message.content_type.clone(),
            body: delivery.message.body.clone(),
            delivery_count: delivery.delivery_count,
            reason: err.to_string(),
            dead_lettered_at: Utc::now().timestamp_millis(),
        };
        match shared
            .dead_letters
            .store(&receiver.subscription.name, &letter)
        {
            Ok(()) => {
                shared.dead_lettered.fetch_add(1, Ordering::AcqRel);
                warn!(
                    message_id = %letter.message_id,
                    delivery_count = letter.delivery_count,
                    "message moved to dead-letter store"
                );
            }
            Err(e) => {
                error!(message_id = %letter.message_id, error = %e, "failed to dead-letter message");
            }
        }
        return;
    }

    shared.redelivered.fetch_add(1, Ordering::AcqRel);
    let delay = shared.policy.delay_for(delivery.delivery_count);
    let subscription = receiver.subscription.clone();
    let shutdown = shared.shutdown.clone();
    let next = Delivery {
        delivery_count: delivery.delivery_count + 1,
        ..delivery
    };

    debug!(
        message_id = %next.message.id,
        delivery_count = next.delivery_count,
        delay_ms = delay.as_millis() as u64,
        "redelivery scheduled"
    );
    shared.tracker.spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => subscription.requeue(next),
        }
    });
}
