//! Batched entry payloads and per-batch acknowledgment state.
//!
//! A batched entry's payload (after decompression) is a concatenation of
//! `num_messages` length-prefixed (metadata, payload) tuples. The decoder
//! splits them back into logical messages; the [`BatchAcker`] tracks which
//! of those messages the application has acknowledged so the entry-level
//! ack is only sent once the whole group is done.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::error::ClientError;
use crate::Result;

/// Per-message metadata inside a batch payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingleMessageMetadata {
    pub properties: Vec<(String, String)>,
    pub partition_key: Option<String>,
    pub payload_size: u32,
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(ClientError::protocol("truncated string length in batch"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(ClientError::protocol("truncated string in batch"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ClientError::protocol("invalid UTF-8 in batch"))
}

fn encode_single_metadata(meta: &SingleMessageMetadata, buf: &mut BytesMut) {
    buf.put_u32(meta.properties.len() as u32);
    for (key, value) in &meta.properties {
        put_str(buf, key);
        put_str(buf, value);
    }
    match &meta.partition_key {
        Some(key) => {
            buf.put_u8(1);
            put_str(buf, key);
        }
        None => buf.put_u8(0),
    }
    buf.put_u32(meta.payload_size);
}

fn decode_single_metadata(buf: &mut Bytes) -> Result<SingleMessageMetadata> {
    if buf.remaining() < 4 {
        return Err(ClientError::protocol("truncated batch metadata"));
    }
    let num_properties = buf.get_u32() as usize;
    let mut properties = Vec::with_capacity(num_properties);
    for _ in 0..num_properties {
        let key = get_str(buf)?;
        let value = get_str(buf)?;
        properties.push((key, value));
    }
    if buf.remaining() < 1 {
        return Err(ClientError::protocol("truncated batch metadata"));
    }
    let partition_key = if buf.get_u8() == 1 {
        Some(get_str(buf)?)
    } else {
        None
    };
    if buf.remaining() < 4 {
        return Err(ClientError::protocol("truncated batch metadata"));
    }
    let payload_size = buf.get_u32();
    Ok(SingleMessageMetadata {
        properties,
        partition_key,
        payload_size,
    })
}

/// Serialize a batch payload from (metadata, payload) tuples.
///
/// `payload_size` is filled in from the payload itself.
pub fn encode_batch(entries: &[(SingleMessageMetadata, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    for (meta, payload) in entries {
        let mut sized = meta.clone();
        sized.payload_size = payload.len() as u32;
        let mut meta_buf = BytesMut::new();
        encode_single_metadata(&sized, &mut meta_buf);
        buf.put_u32(meta_buf.len() as u32);
        buf.put_slice(&meta_buf);
        buf.put_slice(payload);
    }
    buf.freeze()
}

/// Split a decompressed batch payload into `num_messages` logical
/// (metadata, payload) tuples, in batch order.
pub fn decode_batch(
    mut payload: Bytes,
    num_messages: i32,
) -> Result<Vec<(SingleMessageMetadata, Bytes)>> {
    let mut entries = Vec::with_capacity(num_messages.max(0) as usize);
    for _ in 0..num_messages {
        if payload.remaining() < 4 {
            return Err(ClientError::protocol("truncated batch entry"));
        }
        let meta_len = payload.get_u32() as usize;
        if payload.remaining() < meta_len {
            return Err(ClientError::protocol("truncated batch entry metadata"));
        }
        let mut meta_buf = payload.split_to(meta_len);
        let meta = decode_single_metadata(&mut meta_buf)?;
        let size = meta.payload_size as usize;
        if payload.remaining() < size {
            return Err(ClientError::protocol("truncated batch entry payload"));
        }
        let data = payload.split_to(size);
        entries.push((meta, data));
    }
    Ok(entries)
}

/// Acknowledgment bitset for one batched entry.
///
/// Bit `i` is set while message `i` of the batch is outstanding. The acker
/// is shared through an `Arc` by every sibling id of the batch and dropped
/// once the group is fully acked or redelivered.
#[derive(Debug)]
pub struct BatchAcker {
    bits: Mutex<BatchBits>,
    batch_size: usize,
    prev_batch_cumulatively_acked: AtomicBool,
}

#[derive(Debug)]
struct BatchBits {
    words: Vec<u64>,
    outstanding: usize,
}

impl BatchAcker {
    pub fn new(batch_size: usize) -> Self {
        let mut words = vec![u64::MAX; batch_size.div_ceil(64)];
        // mask off bits past the batch size in the last word
        let tail = batch_size % 64;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last = (1u64 << tail) - 1;
            }
        }
        Self {
            bits: Mutex::new(BatchBits {
                words,
                outstanding: batch_size,
            }),
            batch_size,
            prev_batch_cumulatively_acked: AtomicBool::new(false),
        }
    }

    /// Clear bit `index`; returns true iff every message of the batch has
    /// now been acknowledged.
    pub fn ack_individual(&self, index: usize) -> bool {
        let mut bits = self.bits.lock();
        if index < self.batch_size {
            let (word, mask) = (index / 64, 1u64 << (index % 64));
            if bits.words[word] & mask != 0 {
                bits.words[word] &= !mask;
                bits.outstanding -= 1;
            }
        }
        bits.outstanding == 0
    }

    /// Clear bits `0..=index`; returns true iff every message of the batch
    /// has now been acknowledged.
    pub fn ack_group(&self, index: usize) -> bool {
        let mut bits = self.bits.lock();
        let upto = index.min(self.batch_size.saturating_sub(1));
        for i in 0..=upto {
            let (word, mask) = (i / 64, 1u64 << (i % 64));
            if bits.words[word] & mask != 0 {
                bits.words[word] &= !mask;
                bits.outstanding -= 1;
            }
        }
        bits.outstanding == 0
    }

    /// Messages of the batch still waiting for an acknowledgment.
    pub fn outstanding_acks(&self) -> usize {
        self.bits.lock().outstanding
    }

    /// Cardinality of the batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether the cumulative boundary ack for the preceding entry has
    /// already been sent.
    pub fn prev_batch_acked(&self) -> bool {
        self.prev_batch_cumulatively_acked.load(Ordering::Acquire)
    }

    pub fn set_prev_batch_acked(&self) {
        self.prev_batch_cumulatively_acked
            .store(true, Ordering::Release);
    }
}
