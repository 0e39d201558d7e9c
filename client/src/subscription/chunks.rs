//! Reassembly of chunked topic messages.
//!
//! Chunks of one message share an initial transaction id. They are held
//! until the declared total has arrived, joined in chunk order, and the
//! entry is dropped the moment it is emitted. The buffer outlives a single
//! stream: a reconnect resumes right after the last item received, so a
//! message split across the break still completes.

use std::collections::HashMap;

use tracing::trace;

use super::message::{TopicMessage, TopicResponse};

#[derive(Debug, Default)]
pub struct ChunkBuffer {
    pending: HashMap<String, Vec<TopicResponse>>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one stream item. Returns a message when one is complete.
    pub fn accept(&mut self, response: TopicResponse) -> Option<TopicMessage> {
        if response.is_single() {
            return Some(TopicMessage::single(response));
        }
        let (key, total) = response
            .chunk
            .as_ref()
            .map(|chunk| (chunk.initial_transaction_id.clone(), chunk.total as usize))?;

        let parts = self.pending.entry(key.clone()).or_default();
        parts.push(response);
        trace!(initial_transaction_id = %key, received = parts.len(), total, "chunk buffered");
        if parts.len() < total {
            return None;
        }
        let parts = self.pending.remove(&key)?;
        TopicMessage::assemble(parts)
    }

    /// Messages with at least one chunk still missing.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::message::{ChunkInfo, Timestamp};
    use bytes::Bytes;

    fn chunk(tx: &str, number: u32, total: u32, body: &'static str) -> TopicResponse {
        TopicResponse {
            consensus_timestamp: Timestamp::new(i64::from(number), 0),
            sequence_number: u64::from(number),
            running_hash: Bytes::new(),
            contents: Bytes::from_static(body.as_bytes()),
            chunk: Some(ChunkInfo {
                initial_transaction_id: tx.into(),
                number,
                total,
            }),
        }
    }

    #[test]
    fn unchunked_and_one_of_one_pass_straight_through() {
        let mut buffer = ChunkBuffer::new();
        let mut plain = chunk("x", 1, 1, "solo");
        assert_eq!(&buffer.accept(plain.clone()).unwrap().contents[..], b"solo");
        plain.chunk = None;
        let message = buffer.accept(plain).unwrap();
        assert_eq!(message.initial_transaction_id, None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn out_of_order_chunks_reassemble_in_index_order() {
        let mut buffer = ChunkBuffer::new();
        assert!(buffer.accept(chunk("x", 2, 3, "two-")).is_none());
        assert!(buffer.accept(chunk("x", 1, 3, "one-")).is_none());
        assert_eq!(buffer.pending(), 1);
        let message = buffer.accept(chunk("x", 3, 3, "three")).unwrap();
        assert_eq!(&message.contents[..], b"one-two-three");
        assert!(buffer.is_empty());
    }

    #[test]
    fn interleaved_messages_stay_separate() {
        let mut buffer = ChunkBuffer::new();
        assert!(buffer.accept(chunk("a", 1, 2, "a1")).is_none());
        assert!(buffer.accept(chunk("b", 1, 2, "b1")).is_none());
        let b = buffer.accept(chunk("b", 2, 2, "b2")).unwrap();
        assert_eq!(&b.contents[..], b"b1b2");
        assert_eq!(buffer.pending(), 1);
        let a = buffer.accept(chunk("a", 2, 2, "a2")).unwrap();
        assert_eq!(&a.contents[..], b"a1a2");
    }
}
