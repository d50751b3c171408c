//! Partition consumer: public handle and engine actor.
//!
//! One [`Consumer`] is bound to one partition of a topic. The handle only
//! sends messages to the engine's inbox and awaits oneshot replies; every
//! mutation of consumer state (prefetch queue, waiting receiver, flow
//! permits, lifecycle) happens on the single engine task. Connection
//! events, reconnect outcomes and ack-timeout evictions arrive on their
//! own channels and are processed by the same loop, so the state never
//! needs a lock.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn, Instrument};

use crate::ack_grouping::AckGroupingTracker;
use crate::batch::{self, BatchAcker};
use crate::commands::{self, AckType, CommandResponse, MessageFrame};
use crate::compression;
use crate::config::{ConsumerConfiguration, SubscriptionType};
use crate::connection::{
    Connection, ConnectionHandler, ConnectionOutcome, Connector, ConsumerEvent, HandlerState,
    SharedConnection,
};
use crate::error::ClientError;
use crate::message::{Message, MessageId, MessageIdKind};
use crate::metrics::{global_metrics, ConsumerMetrics};
use crate::unacked::UnackedMessageTracker;
use crate::Result;

/// Upper bound on message ids carried by a single redeliver command.
const MAX_REDELIVER_UNACKNOWLEDGED: usize = 1000;

/// Consumer ids are unique within the client process; the broker scopes
/// them per connection.
static CONSUMER_IDS: AtomicU64 = AtomicU64::new(0);

/// Operations the public handle submits to the engine.
enum EngineMessage {
    Receive(oneshot::Sender<Result<Message>>),
    Acknowledge {
        message_id: MessageId,
        ack_type: AckType,
        reply: oneshot::Sender<Result<()>>,
    },
    RedeliverUnacknowledged {
        message_ids: Vec<MessageId>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    RedeliverAllUnacknowledged {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    SendFlowPermits {
        permits: u32,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Client-side consumer for one partition of a topic.
///
/// Created by [`Consumer::new`], which resolves only once the first
/// subscribe handshake has completed. Receiving is single-caller: at most
/// one `receive` may be outstanding at a time.
#[derive(Debug)]
pub struct Consumer {
    inbox: mpsc::Sender<EngineMessage>,
    topic: String,
    subscription: String,
    consumer_name: String,
    consumer_id: u64,
    end_of_topic: Arc<AtomicBool>,
}

impl Consumer {
    /// Subscribe to the configured topic partition and return a ready
    /// consumer. Retriable subscribe failures are retried with backoff
    /// until `operation_timeout` elapses.
    pub async fn new(connector: Arc<dyn Connector>, config: ConsumerConfiguration) -> Result<Self> {
        if config.topic.is_empty() {
            return Err(ClientError::invalid_config("topic must not be empty"));
        }
        if config.subscription_name.is_empty() {
            return Err(ClientError::invalid_config(
                "subscription name must not be empty",
            ));
        }

        let consumer_id = CONSUMER_IDS.fetch_add(1, Ordering::Relaxed) + 1;
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let (events_tx, events_rx) =
            mpsc::channel(std::cmp::max(config.receiver_queue_size as usize, 16));
        let (outcome_tx, outcome_rx) = mpsc::channel(4);
        let (timed_out_tx, timed_out_rx) = mpsc::channel(16);
        let (subscribe_tx, subscribe_rx) = oneshot::channel();

        let end_of_topic = Arc::new(AtomicBool::new(false));
        let cnx: SharedConnection = Arc::new(parking_lot::RwLock::new(None));
        let unacked =
            UnackedMessageTracker::new(config.ack_timeout, config.ack_timeout_tick, timed_out_tx);
        let acks = AckGroupingTracker::new(&config, consumer_id, cnx.clone());
        let handler = ConnectionHandler::new(connector, config.retry.clone());
        let flow_threshold = std::cmp::max(1, config.receiver_queue_size / 2);

        let span = tracing::info_span!(
            "consumer",
            id = consumer_id,
            name = %config.consumer_name,
            partition = config.partition_index
        );

        let handle = Consumer {
            inbox: inbox_tx,
            topic: config.topic.clone(),
            subscription: config.subscription_name.clone(),
            consumer_name: config.consumer_name.clone(),
            consumer_id,
            end_of_topic: end_of_topic.clone(),
        };

        let engine = ConsumerEngine {
            config,
            consumer_id,
            flow_threshold,
            inbox_rx,
            events_rx,
            events_tx,
            outcome_rx,
            outcome_tx,
            timed_out_rx,
            handler,
            cnx,
            incoming: VecDeque::new(),
            waiting_receiver: None,
            available_permits: 0,
            unacked,
            acks,
            subscribe_promise: Some(subscribe_tx),
            created_at: Instant::now(),
            first_connect: true,
            end_of_topic,
            request_ids: 0,
            metrics: global_metrics(),
        };
        tokio::spawn(engine.run().instrument(span));

        match subscribe_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ClientError::AlreadyClosed),
        }
    }

    async fn ask<T>(&self, message: EngineMessage, reply: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| ClientError::AlreadyClosed)?;
        reply.await.map_err(|_| ClientError::AlreadyClosed)?
    }

    /// Wait for the next message. Messages are delivered in broker order,
    /// each to exactly one `receive` call.
    pub async fn receive(&self) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.ask(EngineMessage::Receive(tx), rx).await
    }

    /// Acknowledge a single message.
    ///
    /// Success means the ack was accepted locally; grouping and delivery
    /// to the broker are asynchronous, and a lost ack is covered by the
    /// broker's redelivery.
    pub async fn acknowledge(&self, message_id: &MessageId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ask(
            EngineMessage::Acknowledge {
                message_id: message_id.clone(),
                ack_type: AckType::Individual,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Acknowledge every message up to and including `message_id`. Only
    /// valid for exclusive and failover subscriptions.
    pub async fn acknowledge_cumulative(&self, message_id: &MessageId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ask(
            EngineMessage::Acknowledge {
                message_id: message_id.clone(),
                ack_type: AckType::Cumulative,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Ask the broker to redeliver everything delivered but not yet
    /// acknowledged.
    pub async fn redeliver_unacknowledged_messages(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ask(
            EngineMessage::RedeliverAllUnacknowledged { reply: Some(tx) },
            rx,
        )
        .await
    }

    /// Grant the broker `permits` more pushes. A partitioned-consumer
    /// parent uses this to hand out the initial credits it withheld.
    pub async fn send_flow_permits(&self, permits: u32) -> Result<()> {
        self.inbox
            .send(EngineMessage::SendFlowPermits { permits })
            .await
            .map_err(|_| ClientError::AlreadyClosed)
    }

    /// Close the consumer. Idempotent; a parked `receive` fails with
    /// [`ClientError::AlreadyClosed`].
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        match self.inbox.send(EngineMessage::Close { reply: tx }).await {
            Ok(()) => rx.await.unwrap_or(Ok(())),
            // engine already stopped
            Err(_) => Ok(()),
        }
    }

    /// Drop the subscription on the broker and close the consumer.
    pub async fn unsubscribe(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ask(EngineMessage::Unsubscribe { reply: tx }, rx).await
    }

    /// Whether the broker has terminated the topic and delivered its last
    /// message.
    pub fn has_reached_end_of_topic(&self) -> bool {
        self.end_of_topic.load(Ordering::SeqCst)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    /// Adapt the consumer into a stream of messages. The stream ends when
    /// the consumer is closed.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<Message>> {
        futures::stream::unfold(self, |consumer| async move {
            match consumer.receive().await {
                Ok(message) => Some((Ok(message), consumer)),
                Err(ClientError::AlreadyClosed) => None,
                Err(error) => Some((Err(error), consumer)),
            }
        })
    }
}

enum LoopAction {
    Continue,
    Stop,
}

struct ConsumerEngine {
    config: ConsumerConfiguration,
    consumer_id: u64,
    flow_threshold: u32,
    inbox_rx: mpsc::Receiver<EngineMessage>,
    events_rx: mpsc::Receiver<ConsumerEvent>,
    events_tx: mpsc::Sender<ConsumerEvent>,
    outcome_rx: mpsc::Receiver<ConnectionOutcome>,
    outcome_tx: mpsc::Sender<ConnectionOutcome>,
    timed_out_rx: mpsc::Receiver<Vec<MessageId>>,
    handler: ConnectionHandler,
    /// Connection slot shared with the ack flusher.
    cnx: SharedConnection,
    incoming: VecDeque<Message>,
    waiting_receiver: Option<oneshot::Sender<Result<Message>>>,
    /// Credits consumed locally but not yet returned to the broker.
    available_permits: u32,
    unacked: UnackedMessageTracker,
    acks: AckGroupingTracker,
    subscribe_promise: Option<oneshot::Sender<Result<()>>>,
    created_at: Instant,
    first_connect: bool,
    end_of_topic: Arc<AtomicBool>,
    request_ids: u64,
    metrics: Arc<ConsumerMetrics>,
}

impl ConsumerEngine {
    async fn run(mut self) {
        debug!(topic = %self.config.topic, "starting consumer engine");
        self.handler.grab_connection(self.outcome_tx.clone());

        loop {
            let action = tokio::select! {
                inbox = self.inbox_rx.recv() => match inbox {
                    Some(message) => self.handle_inbox(message).await,
                    // handle dropped
                    None => LoopAction::Stop,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(outcome) = self.outcome_rx.recv() => self.handle_outcome(outcome).await,
                Some(message_ids) = self.timed_out_rx.recv() => {
                    self.handle_ack_timeout(message_ids).await;
                    LoopAction::Continue
                }
            };
            if matches!(action, LoopAction::Stop) {
                break;
            }
        }
        self.shutdown().await;
    }

    fn next_request_id(&mut self) -> u64 {
        self.request_ids += 1;
        self.request_ids
    }

    async fn handle_inbox(&mut self, message: EngineMessage) -> LoopAction {
        match message {
            EngineMessage::Receive(reply) => {
                self.handle_receive(reply).await;
                LoopAction::Continue
            }
            EngineMessage::Acknowledge {
                message_id,
                ack_type,
                reply,
            } => {
                self.handle_acknowledge(message_id, ack_type, reply).await;
                LoopAction::Continue
            }
            EngineMessage::RedeliverUnacknowledged { message_ids, reply } => {
                self.handle_redeliver(message_ids, reply).await;
                LoopAction::Continue
            }
            EngineMessage::RedeliverAllUnacknowledged { reply } => {
                self.handle_redeliver_all(reply).await;
                LoopAction::Continue
            }
            EngineMessage::SendFlowPermits { permits } => {
                self.send_flow(permits).await;
                LoopAction::Continue
            }
            EngineMessage::Close { reply } => self.handle_close(reply).await,
            EngineMessage::Unsubscribe { reply } => self.handle_unsubscribe(reply).await,
        }
    }

    async fn handle_event(&mut self, event: ConsumerEvent) -> LoopAction {
        match event {
            ConsumerEvent::MessageReceived(frame) => {
                self.handle_message(frame).await;
                LoopAction::Continue
            }
            ConsumerEvent::ReachedEndOfTopic => {
                info!("reached end of topic");
                self.end_of_topic.store(true, Ordering::SeqCst);
                if let HandlerState::Ready(connection) = self.handler.state.clone() {
                    self.handler.state = HandlerState::Terminated(connection);
                }
                LoopAction::Continue
            }
            ConsumerEvent::ConnectionClosed => {
                // ignore stale notifications from a connection we already left
                if matches!(
                    self.handler.state,
                    HandlerState::Ready(_) | HandlerState::Terminated(_)
                ) {
                    self.handle_connection_closed(ClientError::connection(
                        "connection closed by transport",
                    ))
                    .await
                } else {
                    LoopAction::Continue
                }
            }
        }
    }

    async fn handle_outcome(&mut self, outcome: ConnectionOutcome) -> LoopAction {
        match outcome {
            ConnectionOutcome::Opened(connection) => {
                self.handle_connection_opened(connection).await
            }
            ConnectionOutcome::Failed(error) => {
                self.metrics.record_connection_failure();
                if self.handler.check_if_active().is_err() {
                    return LoopAction::Continue;
                }
                if self.subscribe_deadline_elapsed() {
                    return self.fail(error);
                }
                if self.handler.is_retriable_error(&error) {
                    self.handler.reconnect_later(&error, self.outcome_tx.clone());
                    LoopAction::Continue
                } else {
                    self.fail(error)
                }
            }
        }
    }

    async fn handle_receive(&mut self, reply: oneshot::Sender<Result<Message>>) {
        if self.handler.check_if_active().is_err() {
            let _ = reply.send(Err(ClientError::AlreadyClosed));
            return;
        }
        if let Some(message) = self.incoming.pop_front() {
            let message = self.message_processed(message).await;
            let _ = reply.send(Ok(message));
        } else if self
            .waiting_receiver
            .as_ref()
            .is_some_and(|waiting| !waiting.is_closed())
        {
            let _ = reply.send(Err(ClientError::consumer(
                "a receive call is already pending on this consumer",
            )));
        } else {
            // an abandoned receive leaves a dead sender behind; replace it
            self.waiting_receiver = Some(reply);
        }
    }

    /// Accounting for a message leaving the prefetch queue towards the
    /// application: start its redelivery clock and return its credit.
    async fn message_processed(&mut self, message: Message) -> Message {
        if !self.config.has_parent_consumer {
            self.unacked.add(message.message_id.clone());
        }
        self.increase_available_permits(1).await;
        message
    }

    async fn increase_available_permits(&mut self, delta: u32) {
        if delta == 0 {
            return;
        }
        self.available_permits += delta;
        if self.available_permits >= self.flow_threshold {
            let permits = self.available_permits;
            self.available_permits = 0;
            self.send_flow(permits).await;
        }
    }

    async fn send_flow(&mut self, permits: u32) {
        if permits == 0 {
            return;
        }
        let Some(connection) = self.handler.ready_connection() else {
            debug!(permits, "no connection for flow permits, replenished on reconnect");
            return;
        };
        match connection
            .send(commands::flow(self.consumer_id, permits))
            .await
        {
            Ok(()) => self.metrics.record_permits(permits as u64),
            Err(error) => warn!(%error, permits, "failed to send flow permits"),
        }
    }

    async fn handle_acknowledge(
        &mut self,
        message_id: MessageId,
        ack_type: AckType,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.handler.ready_connection().is_none() {
            let _ = reply.send(Err(ClientError::NotConnected));
            return;
        }
        if ack_type == AckType::Cumulative
            && matches!(
                self.config.subscription_type,
                SubscriptionType::Shared | SubscriptionType::KeyShared
            )
        {
            let _ = reply.send(Err(ClientError::invalid_config(
                "cumulative acknowledgment requires an exclusive or failover subscription",
            )));
            return;
        }
        let result = self.apply_acknowledgment(message_id, ack_type).await;
        let _ = reply.send(result);
    }

    async fn apply_acknowledgment(
        &mut self,
        message_id: MessageId,
        ack_type: AckType,
    ) -> Result<()> {
        match ack_type {
            AckType::Individual => {
                self.unacked.remove(&message_id);
                match message_id.acker().cloned() {
                    None => {
                        self.acks.add_individual(message_id).await;
                        self.metrics.record_ack();
                    }
                    Some(acker) => {
                        let index = message_id.batch_index().unwrap_or(0) as usize;
                        if acker.ack_individual(index) {
                            self.acks
                                .add_individual(message_id.without_batch_index())
                                .await;
                            self.metrics.record_ack();
                        } else {
                            debug!(
                                id = %message_id,
                                outstanding = acker.outstanding_acks(),
                                "batch ack withheld until the group drains"
                            );
                        }
                    }
                }
            }
            AckType::Cumulative => {
                self.unacked.remove_until(&message_id);
                match message_id.acker().cloned() {
                    None => {
                        self.acks.add_cumulative(message_id).await;
                        self.metrics.record_ack();
                    }
                    Some(acker) => {
                        let index = message_id.batch_index().unwrap_or(0) as usize;
                        if acker.ack_group(index) {
                            self.acks
                                .add_cumulative(message_id.without_batch_index())
                                .await;
                            self.metrics.record_ack();
                        } else if !acker.prev_batch_acked() {
                            // move the cursor to the previous entry once;
                            // the batch itself is acked when it drains
                            acker.set_prev_batch_acked();
                            if message_id.entry_id > 0 {
                                let mut previous = message_id.without_batch_index();
                                previous.entry_id -= 1;
                                self.acks.add_cumulative(previous).await;
                                self.metrics.record_ack();
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, frame: MessageFrame) {
        let num_messages = frame.metadata.num_messages;
        if num_messages <= 0 {
            warn!(
                num_messages,
                ledger = frame.ledger_id,
                entry = frame.entry_id,
                "dropping entry with non-positive batch size"
            );
            return;
        }

        let mut entry_id =
            MessageId::new(frame.ledger_id, frame.entry_id, self.config.partition_index);
        entry_id.topic = self.config.topic.clone();

        if self.acks.is_duplicate(&entry_id) {
            debug!(id = %entry_id, "discarding already-acknowledged entry");
            self.metrics.record_duplicate();
            self.increase_available_permits(num_messages as u32).await;
            return;
        }

        let size_hint = frame.metadata.uncompressed_size as usize;
        let payload = match compression::decompress(
            &frame.payload,
            frame.metadata.compression,
            (size_hint > 0).then_some(size_hint),
        ) {
            Ok(payload) => payload,
            Err(error) => {
                error!(%error, id = %entry_id, "failed to decompress entry, discarding");
                self.increase_available_permits(num_messages as u32).await;
                return;
            }
        };

        self.metrics
            .record_received(num_messages as u64, frame.payload.len() as u64);

        if num_messages == 1 && !frame.metadata.has_num_messages_in_batch {
            let message = Message {
                message_id: entry_id,
                properties: frame.metadata.properties.iter().cloned().collect(),
                key: frame.metadata.partition_key.clone(),
                metadata: frame.metadata,
                payload,
                redelivery_count: frame.redelivery_count,
            };
            self.incoming.push_back(message);
            self.try_serve_waiting().await;
            return;
        }

        let entries = match batch::decode_batch(payload, num_messages) {
            Ok(entries) => entries,
            Err(error) => {
                error!(%error, id = %entry_id, "failed to split batch entry, discarding");
                self.increase_available_permits(num_messages as u32).await;
                return;
            }
        };

        let acker = Arc::new(BatchAcker::new(num_messages as usize));
        for (index, (meta, data)) in entries.into_iter().enumerate() {
            let message_id = MessageId {
                kind: MessageIdKind::Batched {
                    batch_index: index as i32,
                    acker: acker.clone(),
                },
                ..entry_id.clone()
            };
            self.incoming.push_back(Message {
                message_id,
                metadata: frame.metadata.clone(),
                payload: data,
                properties: meta.properties.into_iter().collect(),
                key: meta.partition_key,
                redelivery_count: frame.redelivery_count,
            });
        }
        self.try_serve_waiting().await;
    }

    async fn try_serve_waiting(&mut self) {
        if self.waiting_receiver.is_none() || self.incoming.is_empty() {
            return;
        }
        if let (Some(reply), Some(message)) =
            (self.waiting_receiver.take(), self.incoming.pop_front())
        {
            let message = self.message_processed(message).await;
            if let Err(Ok(message)) = reply.send(Ok(message)) {
                // receiver gave up; keep the message for the next call
                self.incoming.push_front(message);
            }
        }
    }

    async fn handle_redeliver(
        &mut self,
        message_ids: Vec<MessageId>,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        // only shared subscriptions can redeliver a subset
        if matches!(
            self.config.subscription_type,
            SubscriptionType::Exclusive | SubscriptionType::Failover
        ) {
            self.handle_redeliver_all(reply).await;
            return;
        }
        let Some(connection) = self.handler.ready_connection() else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(ClientError::NotConnected));
            }
            return;
        };

        // messages still queued locally will be re-pushed by the broker
        let targets: HashSet<MessageId> = message_ids.iter().cloned().collect();
        let before = self.incoming.len();
        self.incoming
            .retain(|message| !targets.contains(&message.message_id));
        let purged = (before - self.incoming.len()) as u32;
        if purged > 0 {
            debug!(purged, "purged queued messages pending redelivery");
            self.increase_available_permits(purged).await;
        }

        let mut seen = HashSet::new();
        let mut wire: Vec<MessageId> = Vec::new();
        for message_id in &message_ids {
            let entry = message_id.without_batch_index();
            if seen.insert(entry.clone()) {
                wire.push(entry);
            }
        }

        let mut result = Ok(());
        for chunk in wire.chunks(MAX_REDELIVER_UNACKNOWLEDGED) {
            if let Err(error) = connection
                .send(commands::redeliver(self.consumer_id, chunk.to_vec()))
                .await
            {
                warn!(%error, "failed to send redeliver request");
                result = Err(ClientError::ConnectionFailedOnSend { op: "redeliver" });
                break;
            }
            self.metrics.record_redeliver_request();
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    async fn handle_redeliver_all(&mut self, reply: Option<oneshot::Sender<Result<()>>>) {
        let Some(connection) = self.handler.ready_connection() else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(ClientError::NotConnected));
            }
            return;
        };
        match connection.send(commands::redeliver_all(self.consumer_id)).await {
            Ok(()) => {
                self.metrics.record_redeliver_request();
                let cleared = self.incoming.len() as u32;
                self.incoming.clear();
                self.unacked.clear();
                if cleared > 0 {
                    self.increase_available_permits(cleared).await;
                }
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(error) => {
                warn!(%error, "failed to send redeliver-all request");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(ClientError::ConnectionFailedOnSend {
                        op: "redeliver",
                    }));
                }
            }
        }
    }

    async fn handle_ack_timeout(&mut self, message_ids: Vec<MessageId>) {
        warn!(
            count = message_ids.len(),
            "acknowledgment timeout elapsed, requesting redelivery"
        );
        self.handle_redeliver(message_ids, None).await;
    }

    async fn handle_connection_opened(&mut self, connection: Arc<dyn Connection>) -> LoopAction {
        if self.handler.check_if_active().is_err() {
            return LoopAction::Continue;
        }
        connection
            .register_consumer(self.consumer_id, self.events_tx.clone())
            .await;
        let request_id = self.next_request_id();
        let subscribe = commands::subscribe(&self.config, self.consumer_id, request_id);
        match connection.send_request(request_id, subscribe).await {
            Ok(CommandResponse::Success { .. }) => {
                info!(
                    topic = %self.config.topic,
                    subscription = %self.config.subscription_name,
                    "subscribed"
                );
                self.handler.connection_opened(connection.clone());
                *self.cnx.write() = Some(connection);
                self.handler.reset_backoff();
                self.metrics.record_connection_opened();
                if let Some(promise) = self.subscribe_promise.take() {
                    let _ = promise.send(Ok(()));
                }
                // a parent-owned consumer on a durable subscription gets
                // its first credits from the parent
                let suppress_initial_flow = self.first_connect
                    && self.config.has_parent_consumer
                    && self.config.is_persistent_topic;
                self.first_connect = false;
                if !suppress_initial_flow && self.config.receiver_queue_size > 0 {
                    self.available_permits = 0;
                    self.send_flow(self.config.receiver_queue_size).await;
                }
                LoopAction::Continue
            }
            Ok(CommandResponse::Error { code, message, .. }) => {
                self.subscribe_failed(connection, ClientError::Server { code, message })
                    .await
            }
            Err(error) => self.subscribe_failed(connection, error).await,
        }
    }

    async fn subscribe_failed(
        &mut self,
        connection: Arc<dyn Connection>,
        error: ClientError,
    ) -> LoopAction {
        connection.remove_consumer(self.consumer_id).await;
        self.metrics.record_connection_failure();
        if self.subscribe_deadline_elapsed() {
            return self.fail(error);
        }
        if self.handler.is_retriable_error(&error) {
            self.handler.reconnect_later(&error, self.outcome_tx.clone());
            LoopAction::Continue
        } else {
            self.fail(error)
        }
    }

    async fn handle_connection_closed(&mut self, error: ClientError) -> LoopAction {
        *self.cnx.write() = None;
        self.handler.connection_closed();
        if self.subscribe_deadline_elapsed() {
            return self.fail(error);
        }
        self.handler.reconnect_later(&error, self.outcome_tx.clone());
        LoopAction::Continue
    }

    /// The initial subscribe has a deadline; reconnects after it succeeded
    /// retry indefinitely.
    fn subscribe_deadline_elapsed(&self) -> bool {
        self.subscribe_promise.is_some()
            && self.created_at.elapsed() >= self.config.operation_timeout
    }

    fn fail(&mut self, error: ClientError) -> LoopAction {
        error!(%error, "consumer failed");
        self.handler.state = HandlerState::Failed;
        if let Some(promise) = self.subscribe_promise.take() {
            let _ = promise.send(Err(error));
        }
        LoopAction::Stop
    }

    async fn handle_close(&mut self, reply: oneshot::Sender<Result<()>>) -> LoopAction {
        match self.handler.state.clone() {
            HandlerState::Closing | HandlerState::Closed => {
                let _ = reply.send(Ok(()));
                LoopAction::Stop
            }
            HandlerState::Ready(connection) | HandlerState::Terminated(connection) => {
                self.handler.state = HandlerState::Closing;
                self.acks.flush().await;
                let request_id = self.next_request_id();
                match connection
                    .send_request(request_id, commands::close_consumer(self.consumer_id, request_id))
                    .await
                {
                    Ok(CommandResponse::Success { .. }) => {}
                    Ok(CommandResponse::Error { code, message, .. }) => {
                        warn!(?code, %message, "broker rejected close-consumer")
                    }
                    Err(error) => warn!(%error, "close-consumer request failed"),
                }
                connection.remove_consumer(self.consumer_id).await;
                *self.cnx.write() = None;
                self.handler.state = HandlerState::Closed;
                info!("consumer closed");
                let _ = reply.send(Ok(()));
                LoopAction::Stop
            }
            _ => {
                self.handler.state = HandlerState::Closed;
                let _ = reply.send(Ok(()));
                LoopAction::Stop
            }
        }
    }

    async fn handle_unsubscribe(&mut self, reply: oneshot::Sender<Result<()>>) -> LoopAction {
        let Some(connection) = self.handler.ready_connection() else {
            let _ = reply.send(Err(ClientError::NotConnected));
            return LoopAction::Continue;
        };
        self.handler.state = HandlerState::Closing;
        let request_id = self.next_request_id();
        match connection
            .send_request(request_id, commands::unsubscribe(self.consumer_id, request_id))
            .await
        {
            Ok(CommandResponse::Success { .. }) => {
                connection.remove_consumer(self.consumer_id).await;
                *self.cnx.write() = None;
                self.handler.state = HandlerState::Closed;
                info!("unsubscribed");
                let _ = reply.send(Ok(()));
                LoopAction::Stop
            }
            Ok(CommandResponse::Error { code, message, .. }) => {
                self.handler.state = HandlerState::Ready(connection);
                let _ = reply.send(Err(ClientError::Server { code, message }));
                LoopAction::Continue
            }
            Err(error) => {
                self.handler.state = HandlerState::Ready(connection);
                let _ = reply.send(Err(error));
                LoopAction::Continue
            }
        }
    }

    async fn shutdown(&mut self) {
        self.acks.flush().await;
        self.acks.stop();
        self.unacked.stop();
        if let Some(reply) = self.waiting_receiver.take() {
            let _ = reply.send(Err(ClientError::AlreadyClosed));
        }
        if let Some(promise) = self.subscribe_promise.take() {
            let _ = promise.send(Err(ClientError::AlreadyClosed));
        }
        let connection = self.cnx.write().take();
        if let Some(connection) = connection {
            connection.remove_consumer(self.consumer_id).await;
        }
        if !matches!(
            self.handler.state,
            HandlerState::Closed | HandlerState::Failed
        ) {
            self.handler.state = HandlerState::Closed;
        }
        debug!("consumer engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SingleMessageMetadata;
    use crate::commands::Command;
    use crate::compression::CompressionType;
    use crate::config::RetryConfig;
    use crate::message::MessageMetadata;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[derive(Debug, Default)]
    struct MockConnection {
        sent: Mutex<Vec<Command>>,
        consumers: Mutex<HashMap<u64, mpsc::Sender<ConsumerEvent>>>,
        responses: Mutex<VecDeque<CommandResponse>>,
        broken: AtomicBool,
    }

    impl MockConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn registered_senders(&self) -> Vec<mpsc::Sender<ConsumerEvent>> {
            self.consumers.lock().values().cloned().collect()
        }

        async fn deliver(&self, frame: MessageFrame) {
            for sender in self.registered_senders() {
                let _ = sender
                    .send(ConsumerEvent::MessageReceived(frame.clone()))
                    .await;
            }
        }

        async fn reach_end_of_topic(&self) {
            for sender in self.registered_senders() {
                let _ = sender.send(ConsumerEvent::ReachedEndOfTopic).await;
            }
        }

        async fn drop_transport(&self) {
            self.broken.store(true, Ordering::SeqCst);
            for sender in self.registered_senders() {
                let _ = sender.send(ConsumerEvent::ConnectionClosed).await;
            }
        }

        fn script_response(&self, response: CommandResponse) {
            self.responses.lock().push_back(response);
        }

        fn sent(&self) -> Vec<Command> {
            self.sent.lock().clone()
        }

        fn flows(&self) -> Vec<u32> {
            self.sent()
                .into_iter()
                .filter_map(|command| match command {
                    Command::Flow { permits, .. } => Some(permits),
                    _ => None,
                })
                .collect()
        }

        fn acks(&self) -> Vec<(AckType, Vec<MessageId>)> {
            self.sent()
                .into_iter()
                .filter_map(|command| match command {
                    Command::Ack {
                        ack_type,
                        message_ids,
                        ..
                    } => Some((ack_type, message_ids)),
                    _ => None,
                })
                .collect()
        }

        fn redelivers(&self) -> Vec<Vec<MessageId>> {
            self.sent()
                .into_iter()
                .filter_map(|command| match command {
                    Command::RedeliverUnacknowledged { message_ids, .. } => Some(message_ids),
                    _ => None,
                })
                .collect()
        }

        fn subscribes(&self) -> usize {
            self.sent()
                .iter()
                .filter(|command| matches!(command, Command::Subscribe { .. }))
                .count()
        }
    }

    #[async_trait::async_trait]
    impl Connection for MockConnection {
        async fn send(&self, command: Command) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ClientError::connection("transport down"));
            }
            self.sent.lock().push(command);
            Ok(())
        }

        async fn send_request(&self, request_id: u64, command: Command) -> Result<CommandResponse> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ClientError::connection("transport down"));
            }
            self.sent.lock().push(command);
            Ok(self
                .responses
                .lock()
                .pop_front()
                .unwrap_or(CommandResponse::Success { request_id }))
        }

        async fn register_consumer(&self, consumer_id: u64, events: mpsc::Sender<ConsumerEvent>) {
            self.consumers.lock().insert(consumer_id, events);
        }

        async fn remove_consumer(&self, consumer_id: u64) {
            self.consumers.lock().remove(&consumer_id);
        }

        fn is_active(&self) -> bool {
            !self.broken.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug)]
    struct MockConnector {
        connections: Mutex<VecDeque<Arc<MockConnection>>>,
        attempts: AtomicU64,
    }

    impl MockConnector {
        fn with(connections: Vec<Arc<MockConnection>>) -> Arc<Self> {
            Arc::new(Self {
                connections: Mutex::new(connections.into()),
                attempts: AtomicU64::new(0),
            })
        }

        fn unreachable_broker() -> Arc<Self> {
            Self::with(Vec::new())
        }

        fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<Arc<dyn Connection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.connections.lock().pop_front() {
                Some(connection) => Ok(connection as Arc<dyn Connection>),
                None => Err(ClientError::connection("broker unavailable")),
            }
        }
    }

    fn test_retry() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn test_config(queue_size: u32) -> ConsumerConfiguration {
        ConsumerConfiguration::builder()
            .topic("orders")
            .subscription("billing")
            .consumer_name("test-consumer")
            .receiver_queue_size(queue_size)
            .ack_group_time(Duration::ZERO)
            .retry(test_retry())
            .build()
    }

    fn entry_frame(ledger_id: u64, entry_id: u64, payload: &str) -> MessageFrame {
        MessageFrame {
            consumer_id: 0,
            ledger_id,
            entry_id,
            metadata: MessageMetadata {
                uncompressed_size: payload.len() as u32,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            redelivery_count: 0,
        }
    }

    fn batch_frame(ledger_id: u64, entry_id: u64, payloads: &[&str]) -> MessageFrame {
        let entries: Vec<(SingleMessageMetadata, Bytes)> = payloads
            .iter()
            .map(|payload| {
                (
                    SingleMessageMetadata::default(),
                    Bytes::copy_from_slice(payload.as_bytes()),
                )
            })
            .collect();
        let payload = batch::encode_batch(&entries);
        MessageFrame {
            consumer_id: 0,
            ledger_id,
            entry_id,
            metadata: MessageMetadata {
                num_messages: payloads.len() as i32,
                has_num_messages_in_batch: true,
                uncompressed_size: payload.len() as u32,
                ..Default::default()
            },
            payload,
            redelivery_count: 0,
        }
    }

    async fn connect(
        config: ConsumerConfiguration,
    ) -> (Arc<MockConnection>, Arc<MockConnector>, Arc<Consumer>) {
        let cnx = MockConnection::new();
        let connector = MockConnector::with(vec![cnx.clone()]);
        let consumer = Consumer::new(connector.clone(), config)
            .await
            .expect("subscribe should succeed");
        // let the engine finish the post-subscribe flow command
        sleep(Duration::from_millis(20)).await;
        (cnx, connector, Arc::new(consumer))
    }

    #[tokio::test]
    async fn test_subscribe_then_initial_flow() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        let sent = cnx.sent();
        assert!(matches!(sent[0], Command::Subscribe { .. }));
        assert_eq!(cnx.flows(), vec![4]);

        consumer.close().await.unwrap();
        assert!(sent
            .iter()
            .all(|command| !matches!(command, Command::CloseConsumer { .. })));
        assert!(cnx
            .sent()
            .iter()
            .any(|command| matches!(command, Command::CloseConsumer { .. })));
    }

    #[tokio::test]
    async fn test_receive_ack_and_flow_replenish() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        for entry in 1..=4u64 {
            cnx.deliver(entry_frame(1, entry, &format!("m{entry}"))).await;
        }

        for entry in 1..=4u64 {
            let message = consumer.receive().await.unwrap();
            assert_eq!(message.message_id.entry_id, entry);
            consumer.acknowledge(&message.message_id).await.unwrap();
        }

        // initial 4, then one replenish of 2 after every 2 deliveries
        assert_eq!(cnx.flows(), vec![4, 2, 2]);

        let acks = cnx.acks();
        assert_eq!(acks.len(), 4);
        for (entry, (ack_type, message_ids)) in (1..=4u64).zip(acks) {
            assert_eq!(ack_type, AckType::Individual);
            assert_eq!(message_ids, vec![MessageId::new(1, entry, -1)]);
        }
    }

    #[tokio::test]
    async fn test_receive_parks_until_delivery() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        let parked = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.receive().await })
        };
        sleep(Duration::from_millis(30)).await;
        assert!(!parked.is_finished());

        cnx.deliver(entry_frame(1, 1, "hello")).await;
        let message = parked.await.unwrap().unwrap();
        assert_eq!(&message.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_second_concurrent_receive_is_rejected() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        let parked = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.receive().await })
        };
        sleep(Duration::from_millis(20)).await;

        let second = consumer.receive().await;
        assert!(matches!(second, Err(ClientError::Consumer { .. })));

        cnx.deliver(entry_frame(1, 1, "x")).await;
        parked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_batch_split_preserves_order_and_withholds_partial_acks() {
        let (cnx, _connector, consumer) = connect(test_config(8)).await;

        cnx.deliver(batch_frame(2, 7, &["a", "b", "c"])).await;

        let mut messages = Vec::new();
        for (index, payload) in ["a", "b", "c"].iter().enumerate() {
            let message = consumer.receive().await.unwrap();
            assert_eq!(message.message_id.batch_index(), Some(index as i32));
            assert_eq!(&message.payload[..], payload.as_bytes());
            messages.push(message);
        }

        // out-of-order individual acks; nothing goes out until the last one
        consumer.acknowledge(&messages[1].message_id).await.unwrap();
        consumer.acknowledge(&messages[2].message_id).await.unwrap();
        assert!(cnx.acks().is_empty());

        consumer.acknowledge(&messages[0].message_id).await.unwrap();
        let acks = cnx.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].0, AckType::Individual);
        assert_eq!(acks[0].1, vec![MessageId::new(2, 7, -1)]);
    }

    #[tokio::test]
    async fn test_batch_cumulative_ack_of_full_batch() {
        let (cnx, _connector, consumer) = connect(test_config(8)).await;

        cnx.deliver(batch_frame(2, 7, &["a", "b", "c"])).await;
        let mut last = None;
        for _ in 0..3 {
            last = Some(consumer.receive().await.unwrap());
        }

        consumer
            .acknowledge_cumulative(&last.unwrap().message_id)
            .await
            .unwrap();
        let acks = cnx.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].0, AckType::Cumulative);
        assert_eq!(acks[0].1, vec![MessageId::new(2, 7, -1)]);
    }

    #[tokio::test]
    async fn test_batch_cumulative_ack_mid_batch_acks_previous_entry_once() {
        let (cnx, _connector, consumer) = connect(test_config(8)).await;

        cnx.deliver(batch_frame(2, 7, &["a", "b", "c"])).await;
        let first = consumer.receive().await.unwrap();
        let second = consumer.receive().await.unwrap();

        consumer
            .acknowledge_cumulative(&second.message_id)
            .await
            .unwrap();
        let acks = cnx.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].0, AckType::Cumulative);
        assert_eq!(acks[0].1, vec![MessageId::new(2, 6, -1)]);

        // the boundary ack is only sent once
        consumer
            .acknowledge_cumulative(&first.message_id)
            .await
            .unwrap();
        assert_eq!(cnx.acks().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_entry_is_discarded_and_credits_returned() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        cnx.deliver(entry_frame(1, 5, "x")).await;
        let message = consumer.receive().await.unwrap();
        consumer.acknowledge(&message.message_id).await.unwrap();

        cnx.deliver(entry_frame(1, 5, "x")).await;
        sleep(Duration::from_millis(30)).await;

        // the duplicate returned its credit: 1 (receive) + 1 (discard)
        assert_eq!(cnx.flows(), vec![4, 2]);
        let parked = timeout(Duration::from_millis(50), consumer.receive()).await;
        assert!(parked.is_err(), "duplicate must not reach the application");
    }

    #[tokio::test]
    async fn test_ack_timeout_triggers_redelivery_request() {
        let mut config = test_config(4);
        config.subscription_type = SubscriptionType::Shared;
        config.ack_timeout = Duration::from_millis(200);
        config.ack_timeout_tick = Duration::from_millis(50);
        let (cnx, _connector, consumer) = connect(config).await;

        cnx.deliver(entry_frame(1, 9, "slow")).await;
        let message = consumer.receive().await.unwrap();
        assert_eq!(message.message_id.entry_id, 9);

        sleep(Duration::from_millis(600)).await;
        let redelivers = cnx.redelivers();
        assert_eq!(redelivers.len(), 1, "exactly one redelivery request");
        assert_eq!(redelivers[0], vec![MessageId::new(1, 9, -1)]);
    }

    #[tokio::test]
    async fn test_ack_timeout_with_default_tick_fires_within_the_timeout() {
        let mut config = test_config(4);
        config.subscription_type = SubscriptionType::Shared;
        config.ack_timeout = Duration::from_millis(500);
        // ack_timeout_tick left at its default of one tick per ack timeout
        let (cnx, _connector, consumer) = connect(config).await;

        cnx.deliver(entry_frame(1, 9, "slow")).await;
        consumer.receive().await.unwrap();
        let received_at = Instant::now();

        let bound = Duration::from_millis(600);
        while cnx.redelivers().is_empty() && received_at.elapsed() < bound {
            sleep(Duration::from_millis(25)).await;
        }
        let elapsed = received_at.elapsed();
        let redelivers = cnx.redelivers();
        assert_eq!(redelivers.len(), 1, "redelivery request must fire");
        assert!(
            elapsed <= bound,
            "redelivery fired {elapsed:?} after receive, ack timeout is 500ms"
        );
        assert_eq!(redelivers[0], vec![MessageId::new(1, 9, -1)]);
    }

    #[tokio::test]
    async fn test_redeliver_requests_are_chunked() {
        let mut config = test_config(4);
        config.subscription_type = SubscriptionType::Shared;
        let (cnx, _connector, consumer) = connect(config).await;

        let message_ids: Vec<MessageId> =
            (0..2500u64).map(|entry| MessageId::new(1, entry, -1)).collect();
        let (tx, rx) = oneshot::channel();
        consumer
            .inbox
            .send(EngineMessage::RedeliverUnacknowledged {
                message_ids,
                reply: Some(tx),
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        let redelivers = cnx.redelivers();
        assert_eq!(
            redelivers.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![1000, 1000, 500]
        );
    }

    #[tokio::test]
    async fn test_redeliver_subset_promoted_to_all_for_exclusive() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        cnx.deliver(entry_frame(1, 1, "a")).await;
        cnx.deliver(entry_frame(1, 2, "b")).await;
        sleep(Duration::from_millis(20)).await;

        let (tx, rx) = oneshot::channel();
        consumer
            .inbox
            .send(EngineMessage::RedeliverUnacknowledged {
                message_ids: vec![MessageId::new(1, 1, -1)],
                reply: Some(tx),
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        // promoted to redeliver-all: empty id list on the wire
        assert_eq!(cnx.redelivers(), vec![Vec::new()]);
        // the queue was cleared, so both credits came back
        assert_eq!(cnx.flows(), vec![4, 2]);
        let parked = timeout(Duration::from_millis(50), consumer.receive()).await;
        assert!(parked.is_err());
    }

    #[tokio::test]
    async fn test_redeliver_all_clears_queue_and_tracker() {
        let mut config = test_config(8);
        config.ack_timeout = Duration::from_millis(400);
        config.ack_timeout_tick = Duration::from_millis(100);
        let (cnx, _connector, consumer) = connect(config).await;

        cnx.deliver(entry_frame(1, 1, "a")).await;
        cnx.deliver(entry_frame(1, 2, "b")).await;
        cnx.deliver(entry_frame(1, 3, "c")).await;
        let received = consumer.receive().await.unwrap();
        assert_eq!(received.message_id.entry_id, 1);

        consumer.redeliver_unacknowledged_messages().await.unwrap();
        assert_eq!(cnx.redelivers(), vec![Vec::new()]);

        // neither the queued ids nor the received-but-unacked one may time
        // out after the tracker was cleared
        sleep(Duration::from_millis(700)).await;
        assert_eq!(cnx.redelivers().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_and_serves_parked_receive() {
        let first_cnx = MockConnection::new();
        let second_cnx = MockConnection::new();
        let connector = MockConnector::with(vec![first_cnx.clone(), second_cnx.clone()]);
        let consumer = Arc::new(
            Consumer::new(connector, test_config(4))
                .await
                .expect("subscribe should succeed"),
        );
        sleep(Duration::from_millis(20)).await;

        let parked = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.receive().await })
        };
        sleep(Duration::from_millis(20)).await;

        first_cnx.drop_transport().await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(second_cnx.subscribes(), 1, "resubscribed after reconnect");
        assert_eq!(second_cnx.flows(), vec![4], "credits restored on reconnect");

        second_cnx.deliver(entry_frame(3, 1, "after-reconnect")).await;
        let message = parked.await.unwrap().unwrap();
        assert_eq!(&message.payload[..], b"after-reconnect");
    }

    #[tokio::test]
    async fn test_subscribe_gives_up_after_operation_timeout() {
        let connector = MockConnector::unreachable_broker();
        let mut config = test_config(4);
        config.operation_timeout = Duration::from_millis(120);

        let started = Instant::now();
        let result = Consumer::new(connector.clone(), config).await;
        assert!(matches!(result, Err(ClientError::Connection { .. })));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(connector.attempts() > 1, "retried before giving up");
    }

    #[tokio::test]
    async fn test_subscribe_fails_fast_on_non_retriable_error() {
        let cnx = MockConnection::new();
        cnx.script_response(CommandResponse::Error {
            request_id: 1,
            code: crate::commands::ServerError::NotAllowed,
            message: "subscription forbidden".into(),
        });
        let connector = MockConnector::with(vec![cnx]);

        let result = Consumer::new(connector.clone(), test_config(4)).await;
        match result {
            Err(ClientError::Server { code, .. }) => {
                assert_eq!(code, crate::commands::ServerError::NotAllowed)
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fails_parked_receive() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        let parked = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.receive().await })
        };
        sleep(Duration::from_millis(20)).await;

        consumer.close().await.unwrap();
        assert!(matches!(
            parked.await.unwrap(),
            Err(ClientError::AlreadyClosed)
        ));
        assert!(cnx
            .sent()
            .iter()
            .any(|command| matches!(command, Command::CloseConsumer { .. })));

        consumer.close().await.unwrap();
        assert!(matches!(
            consumer.receive().await,
            Err(ClientError::AlreadyClosed)
        ));
        assert!(matches!(
            consumer.acknowledge(&MessageId::new(1, 1, -1)).await,
            Err(ClientError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_sends_command_and_stops() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        consumer.unsubscribe().await.unwrap();
        assert!(cnx
            .sent()
            .iter()
            .any(|command| matches!(command, Command::Unsubscribe { .. })));
        assert!(matches!(
            consumer.receive().await,
            Err(ClientError::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn test_end_of_topic_sets_flag_without_stopping() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;
        assert!(!consumer.has_reached_end_of_topic());

        cnx.reach_end_of_topic().await;
        sleep(Duration::from_millis(20)).await;
        assert!(consumer.has_reached_end_of_topic());

        // the flag is informational; delivery still works
        cnx.deliver(entry_frame(1, 1, "tail")).await;
        let message = consumer.receive().await.unwrap();
        assert_eq!(&message.payload[..], b"tail");
    }

    #[tokio::test]
    async fn test_compressed_entry_is_decompressed() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        let raw = b"compressed payload contents, long enough to shrink shrink shrink";
        let compressed = compression::compress(raw, CompressionType::Lz4).unwrap();
        let frame = MessageFrame {
            consumer_id: 0,
            ledger_id: 1,
            entry_id: 1,
            metadata: MessageMetadata {
                compression: CompressionType::Lz4,
                uncompressed_size: raw.len() as u32,
                ..Default::default()
            },
            payload: compressed,
            redelivery_count: 0,
        };
        cnx.deliver(frame).await;

        let message = consumer.receive().await.unwrap();
        assert_eq!(&message.payload[..], raw);
    }

    #[tokio::test]
    async fn test_parent_owned_consumer_suppresses_initial_flow() {
        let mut config = test_config(4);
        config.has_parent_consumer = true;
        let (cnx, _connector, consumer) = connect(config).await;

        assert!(cnx.flows().is_empty(), "parent grants the initial credits");

        consumer.send_flow_permits(4).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(cnx.flows(), vec![4]);
    }

    #[tokio::test]
    async fn test_acknowledge_requires_connection() {
        let (cnx, _connector, consumer) = connect(test_config(4)).await;

        cnx.deliver(entry_frame(1, 1, "x")).await;
        let message = consumer.receive().await.unwrap();

        cnx.drop_transport().await;
        sleep(Duration::from_millis(20)).await;

        let result = consumer.acknowledge(&message.message_id).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_cumulative_ack_rejected_on_shared_subscription() {
        let mut config = test_config(4);
        config.subscription_type = SubscriptionType::Shared;
        let (cnx, _connector, consumer) = connect(config).await;

        cnx.deliver(entry_frame(1, 1, "x")).await;
        let message = consumer.receive().await.unwrap();
        let result = consumer.acknowledge_cumulative(&message.message_id).await;
        assert!(matches!(result, Err(ClientError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_into_stream_yields_messages_in_order() {
        use futures::StreamExt;

        let (cnx, _connector, consumer) = connect(test_config(4)).await;
        cnx.deliver(entry_frame(1, 1, "first")).await;
        cnx.deliver(entry_frame(1, 2, "second")).await;

        let consumer = Arc::into_inner(consumer).expect("sole handle");
        let mut stream = Box::pin(consumer.into_stream());
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"first");
        assert_eq!(&second.payload[..], b"second");
    }
}
