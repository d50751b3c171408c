//! Message and message-id types delivered to the application.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;

use crate::batch::BatchAcker;
use crate::compression::CompressionType;

/// Position of a message inside a topic partition.
///
/// Two ids compare equal iff their (ledger, entry, partition, batch index)
/// tuple is equal; the topic name and the batch acker handle take no part
/// in identity.
#[derive(Debug, Clone)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition_index: i32,
    pub topic: String,
    pub kind: MessageIdKind,
}

/// Batch membership of a [`MessageId`].
#[derive(Debug, Clone)]
pub enum MessageIdKind {
    /// The id addresses a whole broker entry.
    Individual,
    /// The id addresses one message inside a batched entry; the acker is
    /// shared by every sibling of the batch.
    Batched {
        batch_index: i32,
        acker: Arc<BatchAcker>,
    },
}

impl MessageId {
    /// Entry-level id without batch membership.
    pub fn new(ledger_id: u64, entry_id: u64, partition_index: i32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition_index,
            topic: String::new(),
            kind: MessageIdKind::Individual,
        }
    }

    /// Batch index of this id, if it addresses a batch member.
    pub fn batch_index(&self) -> Option<i32> {
        match &self.kind {
            MessageIdKind::Individual => None,
            MessageIdKind::Batched { batch_index, .. } => Some(*batch_index),
        }
    }

    pub(crate) fn acker(&self) -> Option<&Arc<BatchAcker>> {
        match &self.kind {
            MessageIdKind::Individual => None,
            MessageIdKind::Batched { acker, .. } => Some(acker),
        }
    }

    /// The entry-level id referenced on the wire for this message: same
    /// position, batch membership stripped.
    pub fn without_batch_index(&self) -> MessageId {
        MessageId {
            ledger_id: self.ledger_id,
            entry_id: self.entry_id,
            partition_index: self.partition_index,
            topic: self.topic.clone(),
            kind: MessageIdKind::Individual,
        }
    }

    /// Total order used for cumulative-ack coverage. An entry-level id
    /// sorts after every member of the batch at the same entry.
    pub(crate) fn sort_key(&self) -> (u64, u64, i64) {
        let batch = match self.batch_index() {
            Some(i) => i as i64,
            None => i64::MAX,
        };
        (self.ledger_id, self.entry_id, batch)
    }
}

impl PartialEq for MessageId {
    fn eq(&self, other: &Self) -> bool {
        self.ledger_id == other.ledger_id
            && self.entry_id == other.entry_id
            && self.partition_index == other.partition_index
            && self.batch_index() == other.batch_index()
    }
}

impl Eq for MessageId {}

impl Hash for MessageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ledger_id.hash(state);
        self.entry_id.hash(state);
        self.partition_index.hash(state);
        self.batch_index().hash(state);
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.ledger_id, self.entry_id, self.partition_index
        )?;
        if let Some(batch_index) = self.batch_index() {
            write!(f, ":{batch_index}")?;
        }
        Ok(())
    }
}

/// Entry metadata attached by the producing side.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Number of logical messages in the entry; 1 for a plain message
    pub num_messages: i32,
    /// Codec the payload is compressed with
    pub compression: CompressionType,
    /// Payload size before compression
    pub uncompressed_size: u32,
    /// Set when the entry is a batch even if `num_messages` is 1
    pub has_num_messages_in_batch: bool,
    /// Application properties of a non-batched entry
    pub properties: Vec<(String, String)>,
    /// Routing key of a non-batched entry
    pub partition_key: Option<String>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            num_messages: 1,
            compression: CompressionType::None,
            uncompressed_size: 0,
            has_num_messages_in_batch: false,
            properties: Vec::new(),
            partition_key: None,
        }
    }
}

/// A message handed to the application by [`Consumer::receive`].
///
/// [`Consumer::receive`]: crate::consumer::Consumer::receive
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: MessageId,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
    pub properties: HashMap<String, String>,
    pub key: Option<String>,
    /// How many times the broker has already redelivered this message
    pub redelivery_count: u32,
}

impl Message {
    /// Look up an application property by name.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}
