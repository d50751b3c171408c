//! Acknowledgment grouping.
//!
//! Persistent topics batch acknowledgments over a small time window so a
//! busy consumer sends one coalesced ack frame instead of one per message.
//! Non-persistent topics have no cursor to move, so their variant swallows
//! every ack. The tracker also remembers what was recently acked to catch
//! broker re-pushes that race an in-flight ack.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::commands::{self, AckType};
use crate::config::ConsumerConfiguration;
use crate::connection::SharedConnection;
use crate::message::MessageId;

/// Upper bound on remembered acknowledgments for duplicate detection.
const RECENTLY_ACKED_CAP: usize = 1000;

pub(crate) enum AckGroupingTracker {
    /// Acks on non-persistent topics are not sent at all.
    NonPersistent,
    Persistent {
        state: Arc<AckState>,
        /// Zero grouping window: every ack flushes inline.
        immediate: bool,
        flusher: Option<JoinHandle<()>>,
    },
}

pub(crate) struct AckState {
    consumer_id: u64,
    cnx: SharedConnection,
    pending: Mutex<PendingAcks>,
    recently_acked: Mutex<RecentlyAcked>,
    /// Highest cumulatively acked position ever submitted.
    watermark: Mutex<Option<MessageId>>,
}

#[derive(Default)]
struct PendingAcks {
    individual: Vec<MessageId>,
    cumulative: Option<MessageId>,
}

struct RecentlyAcked {
    set: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl AckGroupingTracker {
    pub(crate) fn new(
        config: &ConsumerConfiguration,
        consumer_id: u64,
        cnx: SharedConnection,
    ) -> Self {
        if !config.is_persistent_topic {
            return AckGroupingTracker::NonPersistent;
        }

        let state = Arc::new(AckState {
            consumer_id,
            cnx,
            pending: Mutex::new(PendingAcks::default()),
            recently_acked: Mutex::new(RecentlyAcked {
                set: HashSet::new(),
                order: VecDeque::new(),
            }),
            watermark: Mutex::new(None),
        });

        let window = config.ack_group_time;
        let immediate = window.is_zero();
        let flusher = if immediate {
            None
        } else {
            let state = state.clone();
            Some(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + window;
                let mut ticker = tokio::time::interval_at(start, window);
                loop {
                    ticker.tick().await;
                    state.flush().await;
                }
            }))
        };

        AckGroupingTracker::Persistent {
            state,
            immediate,
            flusher,
        }
    }

    /// Record an individual acknowledgment for an entry-level id.
    pub(crate) async fn add_individual(&self, message_id: MessageId) {
        if let AckGroupingTracker::Persistent {
            state, immediate, ..
        } = self
        {
            state.remember(message_id.clone());
            state.pending.lock().individual.push(message_id);
            if *immediate {
                state.flush().await;
            }
        }
    }

    /// Record a cumulative acknowledgment; only the highest position of a
    /// window is submitted.
    pub(crate) async fn add_cumulative(&self, message_id: MessageId) {
        if let AckGroupingTracker::Persistent {
            state, immediate, ..
        } = self
        {
            {
                let mut watermark = state.watermark.lock();
                let stale = watermark
                    .as_ref()
                    .is_some_and(|w| w.sort_key() >= message_id.sort_key());
                if !stale {
                    *watermark = Some(message_id.clone());
                }
            }
            {
                let mut pending = state.pending.lock();
                let stale = pending
                    .cumulative
                    .as_ref()
                    .is_some_and(|c| c.sort_key() >= message_id.sort_key());
                if !stale {
                    pending.cumulative = Some(message_id);
                }
            }
            if *immediate {
                state.flush().await;
            }
        }
    }

    /// True iff `message_id` was already acknowledged recently, either
    /// individually or through a cumulative position at or above it.
    pub(crate) fn is_duplicate(&self, message_id: &MessageId) -> bool {
        match self {
            AckGroupingTracker::NonPersistent => false,
            AckGroupingTracker::Persistent { state, .. } => {
                if state.recently_acked.lock().set.contains(message_id) {
                    return true;
                }
                state
                    .watermark
                    .lock()
                    .as_ref()
                    .is_some_and(|w| message_id.sort_key() <= w.sort_key())
            }
        }
    }

    /// Push whatever is buffered to the broker now.
    pub(crate) async fn flush(&self) {
        if let AckGroupingTracker::Persistent { state, .. } = self {
            state.flush().await;
        }
    }

    pub(crate) fn stop(&self) {
        if let AckGroupingTracker::Persistent {
            flusher: Some(handle),
            ..
        } = self
        {
            handle.abort();
        }
    }
}

impl AckState {
    fn remember(&self, message_id: MessageId) {
        let mut recent = self.recently_acked.lock();
        if recent.set.insert(message_id.clone()) {
            recent.order.push_back(message_id);
            while recent.order.len() > RECENTLY_ACKED_CAP {
                if let Some(evicted) = recent.order.pop_front() {
                    recent.set.remove(&evicted);
                }
            }
        }
    }

    async fn flush(&self) {
        let connection = match self.cnx.read().clone() {
            Some(connection) => connection,
            // acks stay buffered for the next flush after reconnect
            None => return,
        };

        let (individual, cumulative) = {
            let mut pending = self.pending.lock();
            (
                std::mem::take(&mut pending.individual),
                pending.cumulative.take(),
            )
        };

        if !individual.is_empty() {
            let count = individual.len();
            let frame = commands::ack(self.consumer_id, AckType::Individual, individual.clone());
            if let Err(error) = connection.send(frame).await {
                warn!(%error, count, "failed to flush individual acks, rebuffering");
                self.pending.lock().individual.extend(individual);
            } else {
                debug!(count, "flushed individual acks");
            }
        }

        if let Some(cumulative) = cumulative {
            let frame = commands::ack(
                self.consumer_id,
                AckType::Cumulative,
                vec![cumulative.clone()],
            );
            if let Err(error) = connection.send(frame).await {
                warn!(%error, position = %cumulative, "failed to flush cumulative ack, rebuffering");
                let mut pending = self.pending.lock();
                let newer = pending
                    .cumulative
                    .as_ref()
                    .is_some_and(|c| c.sort_key() >= cumulative.sort_key());
                if !newer {
                    pending.cumulative = Some(cumulative);
                }
            }
        }
    }
}

impl Drop for AckGroupingTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
