//! Topic management
//!
//! A `Topic` fans every accepted message out to each of its
//! subscriptions. A `Subscription` is a peek-lock queue: a message taken
//! by one receiver is invisible to the others until it is completed,
//! redelivered or dead-lettered.
//!
//! Concurrency note: callers must synchronize access to `Topic` (the
//! broker keeps topics behind a lock); subscriptions themselves are
//! shared through `Arc` and are safe to use concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};

use crate::broker::message::Message;

/// A message sitting in (or taken from) a subscription queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Subscription {
    pub name: String,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl Subscription {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Queue a first delivery of `message`.
    pub fn enqueue(&self, message: Message) {
        self.requeue(Delivery {
            message,
            delivery_count: 1,
            enqueued_at: Utc::now(),
        });
    }

    /// Put a delivery back on the queue as-is.
    pub fn requeue(&self, delivery: Delivery) {
        // the receiver lives as long as self, so this cannot fail
        let _ = self.sender.send(delivery);
    }

    /// Take the next available delivery. Competing receivers are served
    /// one at a time. Cancel-safe.
    pub async fn receive(&self) -> Option<Delivery> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }
}

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscriptions: HashMap<String, Arc<Subscription>>,
}

impl Topic {
    /// Create a new topic with the given name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: HashMap::new(),
        }
    }

    /// Add a subscription. Adding an existing name returns the existing one.
    pub fn add_subscription(&mut self, name: &str) -> Arc<Subscription> {
        self.subscriptions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Subscription::new(name)))
            .clone()
    }

    pub fn subscription(&self, name: &str) -> Option<Arc<Subscription>> {
        self.subscriptions.get(name).cloned()
    }

    /// Hand a copy of `message` to every subscription.
    pub fn fan_out(&self, message: &Message) {
        for subscription in self.subscriptions.values() {
            subscription.enqueue(message.clone());
        }
    }
}
