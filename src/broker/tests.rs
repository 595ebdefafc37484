use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::engine::MAX_CONCURRENT_CALLS;
use super::message::{DeliveryMetadata, Message, MessagePayload};
use super::topic::Topic;
use super::{
    BrokerClient, ErrorContext, ErrorSink, HandlerOptions, InMemoryBroker, MessageHandler,
    RedeliveryPolicy,
};
use crate::persistence::DeadLetterStore;
use crate::utils::error::{BrokerError, HandlerError, TransportError};

fn broker(max_delivery_count: u32) -> InMemoryBroker {
    let policy = RedeliveryPolicy {
        max_delivery_count,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    };
    let broker = InMemoryBroker::new(policy, 50, DeadLetterStore::open(None).unwrap());
    broker.create_subscription("test_topic", "sub");
    broker
}

fn message(id: &str) -> Message {
    Message::json(
        id,
        &MessagePayload {
            name: id.to_string(),
            run_id: "000000".to_string(),
        },
    )
    .unwrap()
}

fn batch(n: usize) -> Vec<Message> {
    (1..=n).map(|i| message(&format!("m.{i}"))).collect()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Records every delivery; fails until a message reaches `succeed_on`.
struct Recorder {
    seen: Mutex<Vec<(String, u32)>>,
    leases: Mutex<Vec<(Uuid, DateTime<Utc>)>>,
    succeed_on: u32,
}

impl Recorder {
    fn new(succeed_on: u32) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            leases: Mutex::new(Vec::new()),
            succeed_on,
        })
    }

    fn seen(&self) -> Vec<(String, u32)> {
        self.seen.lock().unwrap().clone()
    }

    fn leases(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        self.leases.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(
        &self,
        message: &Message,
        delivery: &DeliveryMetadata,
    ) -> Result<(), HandlerError> {
        self.seen
            .lock()
            .unwrap()
            .push((message.id.clone(), delivery.delivery_count));
        self.leases
            .lock()
            .unwrap()
            .push((delivery.lock_token, delivery.enqueued_at));
        if delivery.delivery_count < self.succeed_on {
            return Err(HandlerError::Simulated {
                worker_id: "recorder".to_string(),
                message_id: message.id.clone(),
            });
        }
        Ok(())
    }
}

/// Tracks how many invocations overlap.
#[derive(Default)]
struct SlowHandler {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, _: &Message, _: &DeliveryMetadata) -> Result<(), HandlerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct CountingSink {
    reports: Mutex<Vec<ErrorContext>>,
}

impl ErrorSink for CountingSink {
    fn report(&self, _error: &HandlerError, context: &ErrorContext) {
        self.reports.lock().unwrap().push(context.clone());
    }
}

#[test]
fn test_topic_new() {
    let topic = Topic::new("test_topic");
    assert_eq!(topic.name, "test_topic");
    assert!(topic.subscriptions.is_empty());
}

#[test]
fn test_topic_add_subscription_is_idempotent() {
    let mut topic = Topic::new("test_topic");
    let a = topic.add_subscription("sub");
    let b = topic.add_subscription("sub");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(topic.subscriptions.len(), 1);
}

#[test]
fn test_redelivery_delay_doubles_and_caps() {
    let policy = RedeliveryPolicy {
        max_delivery_count: 10,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
    };
    assert_eq!(policy.delay_for(1), Duration::from_secs(1));
    assert_eq!(policy.delay_for(2), Duration::from_secs(2));
    assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    assert_eq!(policy.delay_for(5), Duration::from_secs(10));
    assert_eq!(policy.delay_for(200), Duration::from_secs(10));
    assert!(!policy.is_exhausted(9));
    assert!(policy.is_exhausted(10));
}

#[tokio::test]
async fn test_send_to_nonexistent_topic() {
    let broker = broker(3);
    let err = broker.send("nonexistent_topic", batch(1)).await.unwrap_err();
    assert!(matches!(err, TransportError::TopicNotFound(_)));
}

#[tokio::test]
async fn test_send_rejects_bad_batches_whole() {
    let broker = broker(3);
    assert!(matches!(
        broker.send("test_topic", Vec::new()).await,
        Err(TransportError::EmptyBatch)
    ));
    assert!(matches!(
        broker.send("test_topic", batch(51)).await,
        Err(TransportError::BatchTooLarge { size: 51, max: 50 })
    ));

    // nothing from the rejected batches reached the subscription
    let recorder = Recorder::new(1);
    let handle = broker
        .subscribe(
            "test_topic",
            "sub",
            HandlerOptions::new(1),
            recorder.clone(),
            Arc::new(CountingSink::default()),
        )
        .unwrap();
    broker.send("test_topic", batch(2)).await.unwrap();
    eventually("two deliveries", || recorder.seen().len() == 2).await;
    handle.close().await;

    let ids: Vec<_> = recorder.seen().into_iter().map(|(id, _)| id).collect();
    assert_eq!(ids, vec!["m.1", "m.2"]);
}

#[tokio::test]
async fn test_subscribe_validates_target_and_options() {
    let broker = broker(3);
    let sink = Arc::new(CountingSink::default());

    let missing = broker.subscribe(
        "test_topic",
        "other",
        HandlerOptions::new(1),
        Recorder::new(1),
        sink.clone(),
    );
    assert!(matches!(missing, Err(BrokerError::SubscriptionNotFound { .. })));

    let zero = broker.subscribe(
        "test_topic",
        "sub",
        HandlerOptions::new(0),
        Recorder::new(1),
        sink.clone(),
    );
    assert!(matches!(zero, Err(BrokerError::InvalidOptions(_))));

    let too_many = broker.subscribe(
        "test_topic",
        "sub",
        HandlerOptions::new(MAX_CONCURRENT_CALLS + 1),
        Recorder::new(1),
        sink,
    );
    match too_many {
        Err(BrokerError::InvalidOptions(reason)) => {
            assert!(reason.contains(&MAX_CONCURRENT_CALLS.to_string()), "{reason}");
        }
        other => panic!("expected InvalidOptions, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_delivery_comes_back_with_higher_count() {
    let broker = broker(10);
    let recorder = Recorder::new(3);
    let sink = Arc::new(CountingSink::default());
    let handle = broker
        .subscribe("test_topic", "sub", HandlerOptions::new(2), recorder.clone(), sink.clone())
        .unwrap();

    broker.send("test_topic", vec![message("retry")]).await.unwrap();
    eventually("third attempt", || recorder.seen().len() == 3).await;
    handle.close().await;

    assert_eq!(
        recorder.seen(),
        vec![
            ("retry".to_string(), 1),
            ("retry".to_string(), 2),
            ("retry".to_string(), 3)
        ]
    );
    let reports = sink.reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].delivery_count, 2);
    assert_eq!(reports[1].subscription, "sub");

    // each attempt gets a fresh lock; the enqueue time is the original send
    let leases = recorder.leases();
    assert_eq!(reports[0].lock_token, leases[0].0);
    assert_eq!(reports[1].lock_token, leases[1].0);
    assert_ne!(leases[0].0, leases[1].0);
    assert_ne!(leases[1].0, leases[2].0);
    assert!(leases.iter().all(|(_, enqueued_at)| *enqueued_at == leases[0].1));

    let stats = broker.stats().unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.redelivered, 2);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn test_message_dead_lettered_after_max_deliveries() {
    let broker = broker(4);
    let recorder = Recorder::new(u32::MAX);
    let handle = broker
        .subscribe(
            "test_topic",
            "sub",
            HandlerOptions::new(1),
            recorder.clone(),
            Arc::new(CountingSink::default()),
        )
        .unwrap();

    broker.send("test_topic", vec![message("poison")]).await.unwrap();
    eventually("dead letter", || broker.stats().unwrap().dead_lettered == 1).await;
    handle.close().await;

    assert_eq!(recorder.seen().len(), 4);
    let letters = broker.dead_letters().load("sub").unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, "poison");
    assert_eq!(letters[0].delivery_count, 4);
    assert!(letters[0].reason.contains("simulated"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_cap_is_respected() {
    let broker = broker(3);
    let handler = Arc::new(SlowHandler::default());
    let handle = broker
        .subscribe(
            "test_topic",
            "sub",
            HandlerOptions::new(5),
            handler.clone(),
            Arc::new(CountingSink::default()),
        )
        .unwrap();

    broker.send("test_topic", batch(40)).await.unwrap();
    eventually("all handled", || handler.done.load(Ordering::SeqCst) == 40).await;
    handle.close().await;

    let peak = handler.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak in-flight was {peak}");
    assert!(peak > 1, "handlers never overlapped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_receivers_split_the_queue() {
    let broker = broker(3);
    let a = Recorder::new(1);
    let b = Recorder::new(1);
    let sink = Arc::new(CountingSink::default());
    let ha = broker
        .subscribe("test_topic", "sub", HandlerOptions::new(2), a.clone(), sink.clone())
        .unwrap();
    let hb = broker
        .subscribe("test_topic", "sub", HandlerOptions::new(2), b.clone(), sink)
        .unwrap();

    broker.send("test_topic", batch(50)).await.unwrap();
    eventually("all handled", || a.seen().len() + b.seen().len() == 50).await;
    ha.close().await;
    hb.close().await;

    let mut ids: Vec<_> = a
        .seen()
        .into_iter()
        .chain(b.seen())
        .map(|(id, _)| id)
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 50);
}

#[tokio::test]
async fn test_every_subscription_gets_a_copy() {
    let broker = broker(3);
    broker.create_subscription("test_topic", "audit");
    let main = Recorder::new(1);
    let audit = Recorder::new(1);
    let sink = Arc::new(CountingSink::default());
    let h1 = broker
        .subscribe("test_topic", "sub", HandlerOptions::new(1), main.clone(), sink.clone())
        .unwrap();
    let h2 = broker
        .subscribe("test_topic", "audit", HandlerOptions::new(1), audit.clone(), sink)
        .unwrap();

    broker.send("test_topic", batch(3)).await.unwrap();
    eventually("both copies", || main.seen().len() == 3 && audit.seen().len() == 3).await;
    h1.close().await;
    h2.close().await;
}

#[tokio::test]
async fn test_close_drains_in_flight_and_is_idempotent() {
    let broker = broker(3);
    let handler = Arc::new(SlowHandler::default());
    let _handle = broker
        .subscribe(
            "test_topic",
            "sub",
            HandlerOptions::new(4),
            handler.clone(),
            Arc::new(CountingSink::default()),
        )
        .unwrap();

    broker.send("test_topic", batch(4)).await.unwrap();
    eventually("handlers started", || handler.in_flight.load(Ordering::SeqCst) > 0).await;

    broker.close().await;
    assert_eq!(handler.in_flight.load(Ordering::SeqCst), 0);
    broker.close().await;

    assert!(broker.is_closed());
    assert!(matches!(
        broker.send("test_topic", batch(1)).await,
        Err(TransportError::Closed)
    ));
}
