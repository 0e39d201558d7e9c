//! Mirror stream items and the messages assembled from them.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Consensus time: seconds since the epoch plus nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    /// Nanoseconds past a full second carry into `seconds`.
    pub fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos: 0 }.plus_nanos(u64::from(nanos))
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        Self {
            seconds: time.timestamp(),
            nanos: time.timestamp_subsec_nanos(),
        }
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.seconds, self.nanos)
    }

    /// The timestamp `n` nanoseconds later.
    pub fn plus_nanos(self, n: u64) -> Self {
        let total = u64::from(self.nanos) + n;
        Self {
            seconds: self.seconds + (total / NANOS_PER_SECOND) as i64,
            nanos: (total % NANOS_PER_SECOND) as u32,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(time) => f.write_str(&time.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            None => write!(f, "{}.{:09}", self.seconds, self.nanos),
        }
    }
}

/// Position of one chunk within a message that was split on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Id of the transaction that carried chunk 1. Shared by every chunk.
    pub initial_transaction_id: String,
    /// 1-based.
    pub number: u32,
    pub total: u32,
}

/// One item of a topic stream, as the mirror sends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicResponse {
    pub consensus_timestamp: Timestamp,
    pub sequence_number: u64,
    pub running_hash: Bytes,
    pub contents: Bytes,
    pub chunk: Option<ChunkInfo>,
}

impl TopicResponse {
    /// Whether this item is a complete message on its own.
    pub fn is_single(&self) -> bool {
        self.chunk.as_ref().map_or(true, |chunk| chunk.total <= 1)
    }
}

/// A message delivered to the subscriber.
///
/// For a chunked message, timestamp, sequence number and running hash come
/// from the last chunk; `contents` is every chunk's payload in chunk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub consensus_timestamp: Timestamp,
    pub sequence_number: u64,
    pub running_hash: Bytes,
    pub contents: Bytes,
    /// Number of stream items this message was assembled from.
    pub chunks: u32,
    pub initial_transaction_id: Option<String>,
}

impl TopicMessage {
    pub fn single(response: TopicResponse) -> Self {
        Self {
            consensus_timestamp: response.consensus_timestamp,
            sequence_number: response.sequence_number,
            running_hash: response.running_hash,
            contents: response.contents,
            chunks: 1,
            initial_transaction_id: response.chunk.map(|chunk| chunk.initial_transaction_id),
        }
    }

    /// Assembles a chunked message. `responses` must be non-empty.
    pub fn assemble(mut responses: Vec<TopicResponse>) -> Option<Self> {
        responses.sort_by_key(|r| r.chunk.as_ref().map_or(0, |c| c.number));
        let total = responses.iter().map(|r| r.contents.len()).sum();
        let mut contents = Vec::with_capacity(total);
        for response in &responses {
            contents.extend_from_slice(&response.contents);
        }
        let chunks = responses.len() as u32;
        let last = responses.pop()?;
        Some(Self {
            consensus_timestamp: last.consensus_timestamp,
            sequence_number: last.sequence_number,
            running_hash: last.running_hash,
            contents: Bytes::from(contents),
            chunks,
            initial_transaction_id: last.chunk.map(|chunk| chunk.initial_transaction_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_one_nano_carries_into_seconds() {
        let ts = Timestamp::new(10, 999_999_999);
        assert_eq!(ts.plus_nanos(1), Timestamp::new(11, 0));
        assert!(ts.plus_nanos(1) > ts);
    }

    #[test]
    fn new_normalizes_nanos() {
        assert_eq!(Timestamp::new(1, 2_000_000_001), Timestamp { seconds: 3, nanos: 1 });
    }

    #[test]
    fn display_is_rfc3339_with_nanos() {
        let ts = Timestamp::new(0, 5);
        assert_eq!(ts.to_string(), "1970-01-01T00:00:00.000000005Z");
    }

    #[test]
    fn assembly_uses_chunk_order_and_last_chunk_metadata() {
        let part = |number: u32, body: &'static str| TopicResponse {
            consensus_timestamp: Timestamp::new(100 + i64::from(number), 0),
            sequence_number: u64::from(number),
            running_hash: Bytes::from(vec![number as u8]),
            contents: Bytes::from_static(body.as_bytes()),
            chunk: Some(ChunkInfo {
                initial_transaction_id: "tx-1".into(),
                number,
                total: 3,
            }),
        };
        let message =
            TopicMessage::assemble(vec![part(2, "b"), part(3, "c"), part(1, "a")]).unwrap();
        assert_eq!(&message.contents[..], b"abc");
        assert_eq!(message.sequence_number, 3);
        assert_eq!(message.consensus_timestamp, Timestamp::new(103, 0));
        assert_eq!(message.chunks, 3);
        assert_eq!(message.initial_transaction_id.as_deref(), Some("tx-1"));
    }
}
