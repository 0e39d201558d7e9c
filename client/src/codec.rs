//! # Reference Wire Codec
//!
//! The engine treats payloads as opaque bytes. This module is the one place
//! that knows what is inside them, for the in-process transport and the
//! simulator. It speaks JSON with hex-encoded binary fields. A production
//! deployment swaps in its own [`MirrorCodec`] and request types.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::execution::LedgerStatus;
use crate::id::{AccountId, TopicId};
use crate::subscription::{ChunkInfo, Timestamp, TopicQuery, TopicResponse};

// ---------------------------------------------------------------------------
// Consensus Envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignaturePair {
    pub public_key: String,
    pub signature: String,
}

/// A signed transaction addressed to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    pub node_account_id: AccountId,
    /// Hex of the signed bytes: node account framing followed by the body.
    pub body: String,
    pub signatures: Vec<SignaturePair>,
}

/// A node's immediate answer to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub status: LedgerStatus,
}

// ---------------------------------------------------------------------------
// Mirror Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTopicQuery {
    pub topic_id: TopicId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    #[serde(default)]
    pub limit: u64,
}

impl From<&TopicQuery> for WireTopicQuery {
    fn from(query: &TopicQuery) -> Self {
        Self {
            topic_id: query.topic_id,
            start_time: query.start_time,
            end_time: query.end_time,
            limit: query.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTopicResponse {
    pub consensus_timestamp: Timestamp,
    pub sequence_number: u64,
    pub running_hash: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_info: Option<ChunkInfo>,
}

impl From<&TopicResponse> for WireTopicResponse {
    fn from(response: &TopicResponse) -> Self {
        Self {
            consensus_timestamp: response.consensus_timestamp,
            sequence_number: response.sequence_number,
            running_hash: hex::encode(&response.running_hash),
            message: hex::encode(&response.contents),
            chunk_info: response.chunk.clone(),
        }
    }
}

impl TryFrom<WireTopicResponse> for TopicResponse {
    type Error = ClientError;

    fn try_from(wire: WireTopicResponse) -> Result<Self> {
        Ok(Self {
            consensus_timestamp: wire.consensus_timestamp,
            sequence_number: wire.sequence_number,
            running_hash: Bytes::from(decode_hex("running_hash", &wire.running_hash)?),
            contents: Bytes::from(decode_hex("message", &wire.message)?),
            chunk: wire.chunk_info,
        })
    }
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| ClientError::Codec(format!("{field}: {e}")))
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Encodes subscription queries and decodes stream items.
pub trait MirrorCodec: Send + Sync {
    fn encode_query(&self, query: &TopicQuery) -> Result<Bytes>;

    fn decode_response(&self, payload: &Bytes) -> Result<TopicResponse>;
}

/// JSON on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| ClientError::Codec(e.to_string()))
    }

    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(|e| ClientError::Codec(e.to_string()))
    }

    /// Server side of [`MirrorCodec::encode_query`].
    pub fn decode_query(&self, payload: &[u8]) -> Result<WireTopicQuery> {
        self.decode(payload)
    }

    /// Server side of [`MirrorCodec::decode_response`].
    pub fn encode_response(&self, response: &TopicResponse) -> Result<Bytes> {
        self.encode(&WireTopicResponse::from(response))
    }
}

impl MirrorCodec for JsonCodec {
    fn encode_query(&self, query: &TopicQuery) -> Result<Bytes> {
        self.encode(&WireTopicQuery::from(query))
    }

    fn decode_response(&self, payload: &Bytes) -> Result<TopicResponse> {
        let wire: WireTopicResponse = self.decode(payload)?;
        TopicResponse::try_from(wire)
    }
}
