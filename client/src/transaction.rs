//! # Transaction Submission
//!
//! [`SubmitTransaction`] is the one concrete [`Request`] the crate ships.
//! The body is opaque. What the request adds is per-node framing: the
//! signed bytes are the target node's account followed by the body, so a
//! signature for node A is useless at node B and every failover re-signs.

use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha384};

use crate::codec::{JsonCodec, SignaturePair, TransactionEnvelope, TransactionResponse};
use crate::config::SUBMIT_TRANSACTION_METHOD;
use crate::error::{ClientError, Result};
use crate::execution::{LedgerStatus, Request};
use crate::id::AccountId;
use crate::signing::Signer;

/// What a successful submission returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    /// The node that accepted the transaction.
    pub node: AccountId,
    /// Hex SHA-384 of the envelope the node accepted.
    pub transaction_hash: String,
}

/// A signed, opaque transaction body.
#[derive(Clone)]
pub struct SubmitTransaction {
    body: Bytes,
    signers: Vec<Arc<dyn Signer>>,
    node_ids: Option<Vec<AccountId>>,
    codec: JsonCodec,
}

impl SubmitTransaction {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            signers: Vec::new(),
            node_ids: None,
            codec: JsonCodec,
        }
    }

    pub fn sign_with(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signers.push(signer);
        self
    }

    /// Restricts submission to these nodes, tried in order.
    pub fn with_node_ids(mut self, node_ids: Vec<AccountId>) -> Self {
        self.node_ids = Some(node_ids);
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The exact bytes signed for `node`.
    pub fn signed_bytes(&self, node: &AccountId) -> Vec<u8> {
        let mut framed = Vec::with_capacity(24 + self.body.len());
        framed.extend_from_slice(&node.to_bytes());
        framed.extend_from_slice(&self.body);
        framed
    }

    pub fn envelope(&self, node: &AccountId) -> TransactionEnvelope {
        let signed = self.signed_bytes(node);
        TransactionEnvelope {
            node_account_id: *node,
            signatures: self
                .signers
                .iter()
                .map(|signer| SignaturePair {
                    public_key: hex::encode(signer.public_key()),
                    signature: hex::encode(signer.sign(&signed)),
                })
                .collect(),
            body: hex::encode(signed),
        }
    }
}

impl Request for SubmitTransaction {
    type Output = Submitted;

    fn method(&self) -> &str {
        SUBMIT_TRANSACTION_METHOD
    }

    fn node_ids(&self) -> Option<&[AccountId]> {
        self.node_ids.as_deref()
    }

    fn encode(&self, node: &AccountId) -> Result<Bytes> {
        if self.signers.is_empty() {
            return Err(ClientError::Signing("transaction has no signatures".into()));
        }
        self.codec.encode(&self.envelope(node))
    }

    fn response_status(&self, response: &Bytes) -> Result<LedgerStatus> {
        let decoded: TransactionResponse = self.codec.decode(response)?;
        Ok(decoded.status)
    }

    fn map_response(&self, _response: Bytes, node: &AccountId) -> Result<Submitted> {
        let envelope = self.codec.encode(&self.envelope(node))?;
        Ok(Submitted {
            node: *node,
            transaction_hash: hex::encode(Sha384::digest(&envelope)),
        })
    }
}

impl std::fmt::Debug for SubmitTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitTransaction")
            .field("body_len", &self.body.len())
            .field("signers", &self.signers.len())
            .field("node_ids", &self.node_ids)
            .finish()
    }
}
