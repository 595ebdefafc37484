use config::ConfigError;
use serde::Deserialize;

/// Top-level configuration settings for the harness.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub publisher: PublisherSettings,
    pub consumer: ConsumerSettings,
    pub run: RunSettings,
}

/// Broker connection and delivery policy.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub endpoint: String,
    pub topic: String,
    pub subscription: String,
    pub max_delivery_count: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_batch_size: usize,
    /// On-disk dead-letter store; temporary when unset.
    pub dead_letter_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PublisherSettings {
    pub count: usize,
    pub messages_per_publisher: u64,
    pub batch_size: usize,
    /// Put the publisher index in message ids so they are unique across
    /// publishers of one run.
    pub unique_ids: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub count: usize,
    pub concurrency_level: usize,
    pub simulate_failure_percent: u8,
    /// Base seed for the failure simulation; entropy when unset.
    pub seed: Option<u64>,
    pub handling_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RunSettings {
    /// How long to wait for consumers to catch up once publishing ends.
    pub drain_timeout_secs: u64,
    pub log_level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled in from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub run: Option<PartialRunSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub endpoint: Option<String>,
    pub topic: Option<String>,
    pub subscription: Option<String>,
    pub max_delivery_count: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub max_batch_size: Option<usize>,
    pub dead_letter_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPublisherSettings {
    pub count: Option<usize>,
    pub messages_per_publisher: Option<u64>,
    pub batch_size: Option<usize>,
    pub unique_ids: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub count: Option<usize>,
    pub concurrency_level: Option<usize>,
    pub simulate_failure_percent: Option<u8>,
    pub seed: Option<u64>,
    pub handling_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialRunSettings {
    pub drain_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

impl PartialSettings {
    /// Overlay the values that were provided onto `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let broker = self.broker.unwrap_or_default();
        let publisher = self.publisher.unwrap_or_default();
        let consumer = self.consumer.unwrap_or_default();
        let run = self.run.unwrap_or_default();

        Settings {
            broker: BrokerSettings {
                endpoint: broker.endpoint.unwrap_or(default.broker.endpoint),
                topic: broker.topic.unwrap_or(default.broker.topic),
                subscription: broker.subscription.unwrap_or(default.broker.subscription),
                max_delivery_count: broker
                    .max_delivery_count
                    .unwrap_or(default.broker.max_delivery_count),
                retry_base_delay_ms: broker
                    .retry_base_delay_ms
                    .unwrap_or(default.broker.retry_base_delay_ms),
                retry_max_delay_ms: broker
                    .retry_max_delay_ms
                    .unwrap_or(default.broker.retry_max_delay_ms),
                max_batch_size: broker.max_batch_size.unwrap_or(default.broker.max_batch_size),
                dead_letter_path: broker.dead_letter_path.or(default.broker.dead_letter_path),
            },
            publisher: PublisherSettings {
                count: publisher.count.unwrap_or(default.publisher.count),
                messages_per_publisher: publisher
                    .messages_per_publisher
                    .unwrap_or(default.publisher.messages_per_publisher),
                batch_size: publisher.batch_size.unwrap_or(default.publisher.batch_size),
                unique_ids: publisher.unique_ids.unwrap_or(default.publisher.unique_ids),
            },
            consumer: ConsumerSettings {
                count: consumer.count.unwrap_or(default.consumer.count),
                concurrency_level: consumer
                    .concurrency_level
                    .unwrap_or(default.consumer.concurrency_level),
                simulate_failure_percent: consumer
                    .simulate_failure_percent
                    .unwrap_or(default.consumer.simulate_failure_percent),
                seed: consumer.seed.or(default.consumer.seed),
                handling_delay_ms: consumer
                    .handling_delay_ms
                    .unwrap_or(default.consumer.handling_delay_ms),
            },
            run: RunSettings {
                drain_timeout_secs: run
                    .drain_timeout_secs
                    .unwrap_or(default.run.drain_timeout_secs),
                log_level: run.log_level.unwrap_or(default.run.log_level),
            },
        }
    }
}

impl Settings {
    /// Reject combinations the harness cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let problem = if self.publisher.batch_size == 0 {
            Some("publisher.batch_size must be at least 1".to_string())
        } else if self.consumer.concurrency_level == 0 {
            Some("consumer.concurrency_level must be at least 1".to_string())
        } else if self.consumer.simulate_failure_percent > 100 {
            Some(format!(
                "consumer.simulate_failure_percent must be 0-100, got {}",
                self.consumer.simulate_failure_percent
            ))
        } else if self.publisher.batch_size > self.broker.max_batch_size {
            Some(format!(
                "publisher.batch_size ({}) must not exceed broker.max_batch_size ({})",
                self.publisher.batch_size, self.broker.max_batch_size
            ))
        } else if self.broker.max_delivery_count == 0 {
            Some("broker.max_delivery_count must be at least 1".to_string())
        } else if self.broker.retry_base_delay_ms > self.broker.retry_max_delay_ms {
            Some("broker.retry_base_delay_ms must not exceed broker.retry_max_delay_ms".to_string())
        } else {
            None
        };

        match problem {
            Some(msg) => Err(ConfigError::Message(msg)),
            None => Ok(()),
        }
    }
}

/// Defaults: three publishers of 500
/// messages in batches of 50, three consumers of five concurrent calls
/// each, failing roughly a fifth of deliveries.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                endpoint: "memory://local".to_string(),
                topic: "dedup-demo".to_string(),
                subscription: "dedup-demo-sub".to_string(),
                max_delivery_count: 10,
                retry_base_delay_ms: 1000,
                retry_max_delay_ms: 10_000,
                max_batch_size: 100,
                dead_letter_path: None,
            },
            publisher: PublisherSettings {
                count: 3,
                messages_per_publisher: 500,
                batch_size: 50,
                unique_ids: false,
            },
            consumer: ConsumerSettings {
                count: 3,
                concurrency_level: 5,
                simulate_failure_percent: 20,
                seed: None,
                handling_delay_ms: 0,
            },
            run: RunSettings {
                drain_timeout_secs: 30,
                log_level: "info".to_string(),
            },
        }
    }
}
