//! Typed broker commands and responses.
//!
//! The byte-level wire codec lives with the transport; consumers build and
//! consume the typed frames below.

use bytes::Bytes;

use crate::config::{ConsumerConfiguration, InitialPosition, SubscriptionType};
use crate::message::{MessageId, MessageMetadata};

/// Scope of an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// Acknowledge exactly the referenced message.
    Individual,
    /// Acknowledge everything up to and including the referenced message.
    Cumulative,
}

/// Error codes relayed by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerError {
    Unknown,
    MetadataError,
    PersistenceError,
    AuthenticationError,
    AuthorizationError,
    ConsumerBusy,
    ServiceNotReady,
    TooManyRequests,
    TopicNotFound,
    SubscriptionNotFound,
    ConsumerNotFound,
    TopicTerminated,
    NotAllowed,
}

impl ServerError {
    /// Whether the failed operation may succeed against the broker later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ServerError::ServiceNotReady | ServerError::TooManyRequests | ServerError::ConsumerBusy
        )
    }
}

/// Commands a consumer sends to the broker.
#[derive(Debug, Clone)]
pub enum Command {
    Subscribe {
        topic: String,
        subscription: String,
        subscription_type: SubscriptionType,
        consumer_id: u64,
        request_id: u64,
        consumer_name: String,
        initial_position: InitialPosition,
        durable: bool,
        read_compacted: bool,
    },
    /// Grant the broker `permits` more pushes.
    Flow { consumer_id: u64, permits: u32 },
    Ack {
        consumer_id: u64,
        ack_type: AckType,
        message_ids: Vec<MessageId>,
    },
    /// Ask the broker to re-push the listed ids; an empty list means every
    /// unacknowledged message of this consumer.
    RedeliverUnacknowledged {
        consumer_id: u64,
        message_ids: Vec<MessageId>,
    },
    CloseConsumer { consumer_id: u64, request_id: u64 },
    Unsubscribe { consumer_id: u64, request_id: u64 },
}

impl Command {
    /// Operation name used in logs and send-failure errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Subscribe { .. } => "subscribe",
            Command::Flow { .. } => "flow",
            Command::Ack { .. } => "ack",
            Command::RedeliverUnacknowledged { .. } => "redeliver",
            Command::CloseConsumer { .. } => "close-consumer",
            Command::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

/// Reply to a request/response command.
#[derive(Debug, Clone)]
pub enum CommandResponse {
    Success {
        request_id: u64,
    },
    Error {
        request_id: u64,
        code: ServerError,
        message: String,
    },
}

/// One broker entry pushed to a consumer; possibly a compressed batch.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub consumer_id: u64,
    pub ledger_id: u64,
    pub entry_id: u64,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
    pub redelivery_count: u32,
}

/// Build a subscribe command from a consumer configuration.
pub fn subscribe(config: &ConsumerConfiguration, consumer_id: u64, request_id: u64) -> Command {
    Command::Subscribe {
        topic: config.topic.clone(),
        subscription: config.subscription_name.clone(),
        subscription_type: config.subscription_type,
        consumer_id,
        request_id,
        consumer_name: config.consumer_name.clone(),
        initial_position: config.initial_position,
        durable: config.is_persistent_topic,
        read_compacted: config.read_compacted,
    }
}

pub fn flow(consumer_id: u64, permits: u32) -> Command {
    Command::Flow {
        consumer_id,
        permits,
    }
}

pub fn ack(consumer_id: u64, ack_type: AckType, message_ids: Vec<MessageId>) -> Command {
    Command::Ack {
        consumer_id,
        ack_type,
        message_ids,
    }
}

pub fn redeliver(consumer_id: u64, message_ids: Vec<MessageId>) -> Command {
    Command::RedeliverUnacknowledged {
        consumer_id,
        message_ids,
    }
}

pub fn redeliver_all(consumer_id: u64) -> Command {
    Command::RedeliverUnacknowledged {
        consumer_id,
        message_ids: Vec::new(),
    }
}

pub fn close_consumer(consumer_id: u64, request_id: u64) -> Command {
    Command::CloseConsumer {
        consumer_id,
        request_id,
    }
}

pub fn unsubscribe(consumer_id: u64, request_id: u64) -> Command {
    Command::Unsubscribe {
        consumer_id,
        request_id,
    }
}
