//! Connection seam and reconnect handling.
//!
//! Transport I/O and connection establishment live outside this crate;
//! consumers talk to the broker through the [`Connection`] trait and obtain
//! fresh connections from a [`Connector`]. The [`ConnectionHandler`] owns
//! the lifecycle state machine and the exponential backoff, and reports
//! every connect outcome back to the consumer actor through a channel so
//! that all state changes stay on the actor task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::commands::{Command, CommandResponse, MessageFrame};
use crate::config::RetryConfig;
use crate::error::ClientError;
use crate::Result;

/// Events a connection pushes to a registered consumer.
#[derive(Debug)]
pub enum ConsumerEvent {
    /// A broker entry addressed to this consumer.
    MessageReceived(MessageFrame),
    /// The topic has been terminated and the last message was delivered.
    ReachedEndOfTopic,
    /// The transport dropped; the consumer should reconnect.
    ConnectionClosed,
}

/// Broker connection as seen by a consumer. The implementation is shared
/// by many producers and consumers and must be safe to call concurrently.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Fire-and-forget frame write.
    async fn send(&self, command: Command) -> Result<()>;

    /// Write a frame and wait for the broker's reply to `request_id`.
    async fn send_request(&self, request_id: u64, command: Command) -> Result<CommandResponse>;

    /// Route inbound events for `consumer_id` to the given inbox.
    async fn register_consumer(&self, consumer_id: u64, events: mpsc::Sender<ConsumerEvent>);

    async fn remove_consumer(&self, consumer_id: u64);

    fn is_active(&self) -> bool;
}

/// Establishes connections to the broker (lookup, transport and handshake
/// are the connector's business).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

/// Connection slot shared with helper tasks that need the current
/// connection without touching actor state (the ack flusher).
pub(crate) type SharedConnection = Arc<RwLock<Option<Arc<dyn Connection>>>>;

/// Outcome of an asynchronous connect attempt, delivered to the actor.
#[derive(Debug)]
pub(crate) enum ConnectionOutcome {
    Opened(Arc<dyn Connection>),
    Failed(ClientError),
}

/// Exponential backoff with jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: RetryConfig,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(config: RetryConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// Next delay to wait before reconnecting; grows geometrically up to
    /// the configured maximum.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self
            .current
            .mul_f64(self.config.multiplier)
            .min(self.config.max_delay);
        if self.config.jitter {
            base + base.mul_f64(rand::random::<f64>() * 0.25)
        } else {
            base
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

/// Lifecycle of the consumer's link to the broker.
#[derive(Debug, Clone)]
pub(crate) enum HandlerState {
    Initial,
    Connecting,
    Ready(Arc<dyn Connection>),
    Closing,
    Closed,
    Failed,
    /// The topic was terminated; the subscription stays usable for
    /// draining and acknowledging what is left.
    Terminated(Arc<dyn Connection>),
}

pub(crate) struct ConnectionHandler {
    pub(crate) state: HandlerState,
    connector: Arc<dyn Connector>,
    backoff: Backoff,
}

impl ConnectionHandler {
    pub(crate) fn new(connector: Arc<dyn Connector>, retry: RetryConfig) -> Self {
        Self {
            state: HandlerState::Initial,
            connector,
            backoff: Backoff::new(retry),
        }
    }

    /// Kick off an immediate connect attempt; the outcome arrives on
    /// `outcomes`.
    pub(crate) fn grab_connection(&mut self, outcomes: mpsc::Sender<ConnectionOutcome>) {
        self.state = HandlerState::Connecting;
        self.spawn_attempt(Duration::ZERO, outcomes);
    }

    /// Schedule a connect attempt after the next backoff delay.
    pub(crate) fn reconnect_later(
        &mut self,
        error: &ClientError,
        outcomes: mpsc::Sender<ConnectionOutcome>,
    ) {
        self.state = HandlerState::Connecting;
        let delay = self.backoff.next_delay();
        warn!(%error, ?delay, "connection unusable, scheduling reconnect");
        self.spawn_attempt(delay, outcomes);
    }

    fn spawn_attempt(&self, delay: Duration, outcomes: mpsc::Sender<ConnectionOutcome>) {
        let connector = self.connector.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = match connector.connect().await {
                Ok(connection) => ConnectionOutcome::Opened(connection),
                Err(error) => ConnectionOutcome::Failed(error),
            };
            if outcomes.send(outcome).await.is_err() {
                debug!("consumer gone before connect attempt finished");
            }
        });
    }

    /// The transport dropped underneath us.
    pub(crate) fn connection_closed(&mut self) {
        self.state = HandlerState::Connecting;
    }

    /// A subscribe handshake completed on `connection`.
    pub(crate) fn connection_opened(&mut self, connection: Arc<dyn Connection>) {
        self.state = HandlerState::Ready(connection);
    }

    pub(crate) fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// The current connection, if the consumer is fully subscribed on it.
    pub(crate) fn ready_connection(&self) -> Option<Arc<dyn Connection>> {
        match &self.state {
            HandlerState::Ready(connection) | HandlerState::Terminated(connection)
                if connection.is_active() =>
            {
                Some(connection.clone())
            }
            _ => None,
        }
    }

    /// Fails with `AlreadyClosed` once the consumer has stopped for good.
    pub(crate) fn check_if_active(&self) -> Result<()> {
        match self.state {
            HandlerState::Closing | HandlerState::Closed | HandlerState::Failed => {
                Err(ClientError::AlreadyClosed)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn is_retriable_error(&self, error: &ClientError) -> bool {
        error.is_retriable()
    }
}
