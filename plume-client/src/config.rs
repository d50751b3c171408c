//! Configuration types for Plume consumers

use std::time::Duration;

/// Delivery semantics of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    /// A single consumer owns the subscription.
    Exclusive,
    /// Messages are distributed round-robin across consumers.
    Shared,
    /// One active consumer, the others stand by.
    Failover,
    /// Messages are routed to consumers by key.
    KeyShared,
}

/// Where a brand new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialPosition {
    Latest,
    Earliest,
}

/// Reconnect backoff configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial retry delay
    pub initial_delay: Duration,
    /// Maximum retry delay
    pub max_delay: Duration,
    /// Retry delay multiplier
    pub multiplier: f64,
    /// Jitter for retry delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Consumer configuration, immutable once the consumer is created.
#[derive(Debug, Clone)]
pub struct ConsumerConfiguration {
    /// Topic to consume from
    pub topic: String,
    /// Subscription name shared by cooperating consumers
    pub subscription_name: String,
    /// Delivery semantics
    pub subscription_type: SubscriptionType,
    /// Start position for a newly created subscription
    pub initial_position: InitialPosition,
    /// Local prefetch queue size; 0 disables initial permits
    pub receiver_queue_size: u32,
    /// Redelivery timeout for unacknowledged messages; zero disables tracking
    pub ack_timeout: Duration,
    /// Tick of the unacked tracker; zero means one tick per `ack_timeout`
    pub ack_timeout_tick: Duration,
    /// Window over which acknowledgments are grouped; zero sends immediately
    pub ack_group_time: Duration,
    /// Read from the compacted view of the topic where available
    pub read_compacted: bool,
    /// Consumer name reported to the broker
    pub consumer_name: String,
    /// Whether the topic is persistent (durable subscription, acks sent)
    pub is_persistent_topic: bool,
    /// Partition this consumer is bound to; -1 for a non-partitioned topic
    pub partition_index: i32,
    /// Set when a partitioned-consumer parent owns this instance and
    /// manages initial flow permits itself
    pub has_parent_consumer: bool,
    /// Overall deadline for the initial subscribe to succeed
    pub operation_timeout: Duration,
    /// Reconnect backoff parameters
    pub retry: RetryConfig,
}

impl Default for ConsumerConfiguration {
    fn default() -> Self {
        Self {
            topic: String::new(),
            subscription_name: String::new(),
            subscription_type: SubscriptionType::Exclusive,
            initial_position: InitialPosition::Latest,
            receiver_queue_size: 1000,
            ack_timeout: Duration::ZERO,
            ack_timeout_tick: Duration::ZERO,
            ack_group_time: Duration::from_millis(100),
            read_compacted: false,
            consumer_name: String::new(),
            is_persistent_topic: true,
            partition_index: -1,
            has_parent_consumer: false,
            operation_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl ConsumerConfiguration {
    /// Create a new configuration builder
    pub fn builder() -> ConsumerConfigurationBuilder {
        ConsumerConfigurationBuilder::new()
    }
}

/// Builder for [`ConsumerConfiguration`]
#[derive(Debug, Default)]
pub struct ConsumerConfigurationBuilder {
    config: ConsumerConfiguration,
}

impl ConsumerConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn subscription<S: Into<String>>(mut self, subscription: S) -> Self {
        self.config.subscription_name = subscription.into();
        self
    }

    pub fn subscription_type(mut self, subscription_type: SubscriptionType) -> Self {
        self.config.subscription_type = subscription_type;
        self
    }

    pub fn initial_position(mut self, initial_position: InitialPosition) -> Self {
        self.config.initial_position = initial_position;
        self
    }

    pub fn receiver_queue_size(mut self, size: u32) -> Self {
        self.config.receiver_queue_size = size;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn ack_timeout_tick(mut self, tick: Duration) -> Self {
        self.config.ack_timeout_tick = tick;
        self
    }

    pub fn ack_group_time(mut self, window: Duration) -> Self {
        self.config.ack_group_time = window;
        self
    }

    pub fn read_compacted(mut self, read_compacted: bool) -> Self {
        self.config.read_compacted = read_compacted;
        self
    }

    pub fn consumer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.consumer_name = name.into();
        self
    }

    pub fn persistent_topic(mut self, persistent: bool) -> Self {
        self.config.is_persistent_topic = persistent;
        self
    }

    pub fn partition_index(mut self, partition_index: i32) -> Self {
        self.config.partition_index = partition_index;
        self
    }

    pub fn has_parent_consumer(mut self, has_parent: bool) -> Self {
        self.config.has_parent_consumer = has_parent;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn build(self) -> ConsumerConfiguration {
        self.config
    }
}
