//! Attempt classification.
//!
//! Turning "what came back" into "what to do next" is a pure function of
//! the status. Nothing here touches the network, the topology, or a clock,
//! which is what lets the retry state machine be tested on its own.
//!
//! ```text
//!   ledger OK                                  -> Success
//!   ledger BUSY                                -> TransientRejection (same node, back off)
//!   ledger PLATFORM_NOT_ACTIVE / _NOT_CREATED  -> TransientRejection (next node)
//!   ledger INVALID_NODE_ACCOUNT                -> StaleNodeIdentity
//!   ledger anything else                       -> TerminalRejection
//!   transport UNAVAILABLE / RESOURCE_EXHAUSTED
//!             DEADLINE_EXCEEDED / INTERNAL+RST -> TransportFailure (retryable)
//!   transport anything else                    -> TransportFailure (terminal)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transport::{Status, StatusCode};

/// Status codes the ledger puts in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerStatus {
    Ok,
    Busy,
    PlatformTransactionNotCreated,
    PlatformNotActive,
    InvalidNodeAccount,
    InvalidTransaction,
    InvalidSignature,
    InsufficientPayerBalance,
    InsufficientTxFee,
    DuplicateTransaction,
    TransactionExpired,
    InvalidTopicId,
    Unknown,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Ok => "OK",
            LedgerStatus::Busy => "BUSY",
            LedgerStatus::PlatformTransactionNotCreated => "PLATFORM_TRANSACTION_NOT_CREATED",
            LedgerStatus::PlatformNotActive => "PLATFORM_NOT_ACTIVE",
            LedgerStatus::InvalidNodeAccount => "INVALID_NODE_ACCOUNT",
            LedgerStatus::InvalidTransaction => "INVALID_TRANSACTION",
            LedgerStatus::InvalidSignature => "INVALID_SIGNATURE",
            LedgerStatus::InsufficientPayerBalance => "INSUFFICIENT_PAYER_BALANCE",
            LedgerStatus::InsufficientTxFee => "INSUFFICIENT_TX_FEE",
            LedgerStatus::DuplicateTransaction => "DUPLICATE_TRANSACTION",
            LedgerStatus::TransactionExpired => "TRANSACTION_EXPIRED",
            LedgerStatus::InvalidTopicId => "INVALID_TOPIC_ID",
            LedgerStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one attempt amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The call never produced a ledger answer.
    TransportFailure { status: Status, retryable: bool },
    /// The ledger said "not now".
    TransientRejection {
        status: LedgerStatus,
        retry_same_node: bool,
    },
    /// The node is no longer the account we addressed.
    StaleNodeIdentity { status: LedgerStatus },
    /// The ledger said "no".
    TerminalRejection { status: LedgerStatus },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Outcome::Success | Outcome::TerminalRejection { .. } => false,
            Outcome::TransportFailure { retryable, .. } => *retryable,
            Outcome::TransientRejection { .. } | Outcome::StaleNodeIdentity { .. } => true,
        }
    }
}

/// Default mapping from a ledger status to an outcome.
pub fn classify_status(status: LedgerStatus) -> Outcome {
    match status {
        LedgerStatus::Ok => Outcome::Success,
        LedgerStatus::Busy => Outcome::TransientRejection {
            status,
            retry_same_node: true,
        },
        LedgerStatus::PlatformTransactionNotCreated | LedgerStatus::PlatformNotActive => {
            Outcome::TransientRejection {
                status,
                retry_same_node: false,
            }
        }
        LedgerStatus::InvalidNodeAccount => Outcome::StaleNodeIdentity { status },
        _ => Outcome::TerminalRejection { status },
    }
}

/// Mapping from a failed call to an outcome.
pub fn classify_transport(status: Status) -> Outcome {
    let retryable = matches!(
        status.code,
        StatusCode::Unavailable | StatusCode::ResourceExhausted | StatusCode::DeadlineExceeded
    ) || status.is_stream_reset();
    Outcome::TransportFailure { status, retryable }
}
