//! Timeout tracking for in-flight messages.
//!
//! Delivered-but-unacknowledged ids sit in a ring of time buckets. A
//! ticker advances the ring every `ack_timeout_tick`; fresh ids are parked
//! `ceil(ack_timeout / tick)` slots ahead of the head, so the ring reaches
//! them no later than `ack_timeout` after insertion and flushes them to
//! the consumer actor for redelivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::message::MessageId;

pub(crate) enum UnackedMessageTracker {
    /// Used when `ack_timeout` is zero; every operation is a no-op.
    Disabled,
    Enabled(TimeWheel),
}

pub(crate) struct TimeWheel {
    wheel: Arc<Mutex<Wheel>>,
    ticker: JoinHandle<()>,
}

struct Wheel {
    buckets: Vec<HashSet<MessageId>>,
    head: usize,
    /// How many slots ahead of the head fresh ids are parked; the ring
    /// reaches an id's bucket after `steps` ticks.
    steps: usize,
}

impl UnackedMessageTracker {
    pub(crate) fn new(
        ack_timeout: Duration,
        ack_timeout_tick: Duration,
        timed_out: mpsc::Sender<Vec<MessageId>>,
    ) -> Self {
        if ack_timeout.is_zero() {
            return UnackedMessageTracker::Disabled;
        }
        let tick = if ack_timeout_tick.is_zero() {
            ack_timeout
        } else {
            ack_timeout_tick
        };
        let steps =
            (ack_timeout.as_millis().div_ceil(tick.as_millis().max(1)) as usize).max(1);
        let buckets = steps + 1;

        let wheel = Arc::new(Mutex::new(Wheel {
            buckets: (0..buckets).map(|_| HashSet::new()).collect(),
            head: 0,
            steps,
        }));

        let ticker_wheel = wheel.clone();
        let ticker = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + tick;
            let mut ticker = tokio::time::interval_at(start, tick);
            loop {
                ticker.tick().await;
                let evicted = {
                    let mut wheel = ticker_wheel.lock();
                    let next = (wheel.head + 1) % wheel.buckets.len();
                    wheel.head = next;
                    std::mem::take(&mut wheel.buckets[next])
                };
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "unacked messages timed out");
                    if timed_out
                        .send(evicted.into_iter().collect())
                        .await
                        .is_err()
                    {
                        // consumer gone
                        return;
                    }
                }
            }
        });

        UnackedMessageTracker::Enabled(TimeWheel { wheel, ticker })
    }

    /// Start the redelivery clock for `message_id`.
    pub(crate) fn add(&self, message_id: MessageId) {
        if let UnackedMessageTracker::Enabled(tracker) = self {
            let mut wheel = tracker.wheel.lock();
            let slot = (wheel.head + wheel.steps) % wheel.buckets.len();
            wheel.buckets[slot].insert(message_id);
        }
    }

    /// Stop tracking `message_id` after an acknowledgment.
    pub(crate) fn remove(&self, message_id: &MessageId) {
        if let UnackedMessageTracker::Enabled(tracker) = self {
            let mut wheel = tracker.wheel.lock();
            for bucket in &mut wheel.buckets {
                if bucket.remove(message_id) {
                    break;
                }
            }
        }
    }

    /// Stop tracking every id at or below `message_id` (cumulative acks).
    pub(crate) fn remove_until(&self, message_id: &MessageId) {
        if let UnackedMessageTracker::Enabled(tracker) = self {
            let limit = message_id.sort_key();
            let mut wheel = tracker.wheel.lock();
            for bucket in &mut wheel.buckets {
                bucket.retain(|id| id.sort_key() > limit);
            }
        }
    }

    pub(crate) fn clear(&self) {
        if let UnackedMessageTracker::Enabled(tracker) = self {
            let mut wheel = tracker.wheel.lock();
            for bucket in &mut wheel.buckets {
                bucket.clear();
            }
        }
    }

    pub(crate) fn stop(&self) {
        if let UnackedMessageTracker::Enabled(tracker) = self {
            tracker.ticker.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, message_id: &MessageId) -> bool {
        match self {
            UnackedMessageTracker::Disabled => false,
            UnackedMessageTracker::Enabled(tracker) => tracker
                .wheel
                .lock()
                .buckets
                .iter()
                .any(|bucket| bucket.contains(message_id)),
        }
    }
}

impl Drop for UnackedMessageTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
