//! # Plume Client Library
//!
//! An async Rust client for the Plume message broker. This crate holds the
//! consumer side: a [`Consumer`] maintains a long-lived subscription to one
//! partition of a topic, prefetches messages under credit-based flow
//! control, splits and decompresses batched entries, and coordinates
//! acknowledgments and redelivery with the broker.
//!
//! ## Features
//!
//! - **Async/Await**: Built on tokio; every consumer runs as a single
//!   actor task, so consumer state needs no locks
//! - **Flow Control**: Credit-based prefetch with automatic replenishment
//! - **Batch Handling**: Batched entries are split into logical messages
//!   with per-message acknowledgment tracking
//! - **Redelivery**: Ack-timeout tracking with automatic redelivery
//!   requests, plus explicit redelivery of everything unacknowledged
//! - **Resilience**: Automatic reconnect and resubscribe with exponential
//!   backoff
//! - **Observability**: Structured tracing and built-in metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plume_client::{Consumer, ConsumerConfiguration, SubscriptionType};
//!
//! #[tokio::main]
//! async fn main() -> plume_client::Result<()> {
//!     let config = ConsumerConfiguration::builder()
//!         .topic("orders")
//!         .subscription("billing")
//!         .subscription_type(SubscriptionType::Shared)
//!         .receiver_queue_size(1000)
//!         .build();
//!
//!     // `connector` implements `plume_client::Connector` for your transport
//!     let consumer = Consumer::new(connector, config).await?;
//!
//!     loop {
//!         let message = consumer.receive().await?;
//!         println!("got {} bytes", message.payload.len());
//!         consumer.acknowledge(&message.message_id).await?;
//!     }
//! }
//! ```

pub mod batch;
pub mod commands;
pub mod compression;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod metrics;

mod ack_grouping;
mod unacked;

pub use batch::{BatchAcker, SingleMessageMetadata};
pub use commands::{AckType, Command, CommandResponse, MessageFrame, ServerError};
pub use compression::CompressionType;
pub use config::{
    ConsumerConfiguration, ConsumerConfigurationBuilder, InitialPosition, RetryConfig,
    SubscriptionType,
};
pub use connection::{Connection, Connector, ConsumerEvent};
pub use consumer::Consumer;
pub use error::ClientError;
pub use message::{Message, MessageId, MessageIdKind, MessageMetadata};
pub use metrics::{global_metrics, ConsumerMetrics, MetricsSnapshot};

/// Client library result type
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
