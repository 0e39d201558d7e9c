//! Error types for the ledger client.
//!
//! Every fallible public operation returns [`ClientError`]. Failures that
//! reach the caller carry enough context to diagnose them: the ledger or
//! transport status, the node that produced it, and the attempt number.
//! Subscription failures arrive through the error callback as
//! [`SubscriptionError`].

use thiserror::Error;

use crate::execution::LedgerStatus;
use crate::transport::Status;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Coarse classification of a [`ClientError`].
///
/// Callers that only care about "should I try again later" match on this
/// instead of the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportFailure,
    TransientLedgerRejection,
    StaleNodeIdentity,
    TerminalLedgerRejection,
    ExhaustedRetries,
    Timeout,
    InvalidInput,
    Codec,
    Closed,
}

/// Errors returned by the client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The string is neither `host:port` nor `in-process:name`.
    #[error("invalid endpoint `{input}`: {reason}")]
    InvalidEndpoint { input: String, reason: &'static str },

    #[error("invalid entity id `{0}`, expected shard.realm.num")]
    InvalidEntityId(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Nothing to send to. Raised before any attempt is made.
    #[error("topology is empty")]
    EmptyTopology,

    /// The transport refused or the channel failed.
    #[error("transport failure on node {node} (attempt {attempt}): {status}")]
    Transport {
        node: String,
        attempt: u32,
        status: Status,
    },

    /// The node said "not now". Only ever seen as the last error of
    /// [`ClientError::ExhaustedRetries`].
    #[error("transient rejection {status} from node {node} (attempt {attempt})")]
    TransientRejection {
        status: LedgerStatus,
        node: String,
        attempt: u32,
    },

    /// The node's on-ledger identity no longer matches our address book.
    #[error("node {node} reported {status}; its account mapping is stale (attempt {attempt})")]
    StaleNodeIdentity {
        status: LedgerStatus,
        node: String,
        attempt: u32,
    },

    /// The ledger rejected the request for good.
    #[error("request rejected with {status} by node {node} (attempt {attempt})")]
    Rejected {
        status: LedgerStatus,
        node: String,
        attempt: u32,
    },

    /// Attempt or node-visit budget ran out.
    #[error("retries exhausted after {attempts} attempts across {nodes_visited} nodes")]
    ExhaustedRetries {
        attempts: u32,
        nodes_visited: usize,
        last_error: Option<Box<ClientError>>,
    },

    #[error("request timed out after {elapsed_ms}ms ({attempts} attempts)")]
    RequestTimeout { attempts: u32, elapsed_ms: u64 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("address book error: {0}")]
    AddressBook(String),

    #[error("client is closed")]
    Closed,

    /// A blocking call was made on a current-thread runtime, which would
    /// stall the very runtime it waits on.
    #[error("cannot block on a current-thread runtime; use the async call")]
    BlockingOnRuntime,
}

impl ClientError {
    /// Projects the error onto the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::InvalidEndpoint { .. }
            | ClientError::InvalidEntityId(_)
            | ClientError::Config(_)
            | ClientError::EmptyTopology
            | ClientError::AddressBook(_)
            | ClientError::BlockingOnRuntime => ErrorKind::InvalidInput,
            ClientError::Transport { .. } => ErrorKind::TransportFailure,
            ClientError::TransientRejection { .. } => ErrorKind::TransientLedgerRejection,
            ClientError::StaleNodeIdentity { .. } => ErrorKind::StaleNodeIdentity,
            ClientError::Rejected { .. } => ErrorKind::TerminalLedgerRejection,
            ClientError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            ClientError::RequestTimeout { .. } => ErrorKind::Timeout,
            ClientError::Codec(_) | ClientError::Signing(_) => ErrorKind::Codec,
            ClientError::Closed => ErrorKind::Closed,
        }
    }

    /// The ledger status behind this error, if the ledger produced one.
    pub fn ledger_status(&self) -> Option<LedgerStatus> {
        match self {
            ClientError::TransientRejection { status, .. }
            | ClientError::StaleNodeIdentity { status, .. }
            | ClientError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors delivered to a subscription's error callback.
#[derive(Debug, Clone, Error)]
pub enum SubscriptionError {
    #[error("no mirror nodes configured")]
    NoMirrorNodes,

    /// A retryable stream error kept recurring until the attempt budget ran out.
    #[error("stream failed after {attempts} attempts: {status}")]
    RetriesExhausted { status: Status, attempts: u32 },

    /// The stream failed with an error outside the retry allow-list.
    #[error("stream failed: {status}")]
    Terminal { status: Status },

    #[error("failed to decode stream item: {0}")]
    Codec(String),
}

impl SubscriptionError {
    /// Whether the underlying failure was one the engine would have retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubscriptionError::RetriesExhausted { .. })
    }
}
