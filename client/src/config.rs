//! # Client Configuration & Constants
//!
//! Every default the execution engine relies on lives here. The numbers are
//! the ones production deployments have settled on; change them and you are
//! changing how hard the client leans on a struggling network.
//!
//! [`ClientConfig`] is the serde-loadable view of the same knobs. Durations
//! are stored as milliseconds so the JSON stays readable.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::{ClientError, Result};
use crate::id::AccountId;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Plaintext gRPC port every consensus node listens on.
pub const CONSENSUS_PLAINTEXT_PORT: u16 = 50211;

/// TLS port for consensus nodes.
pub const CONSENSUS_TLS_PORT: u16 = 50212;

/// Mirror nodes only have a canonical TLS port. Plaintext mirrors run on
/// whatever port the operator picked, so we never rewrite towards one.
pub const MIRROR_TLS_PORT: u16 = 443;

/// Scheme prefix for in-process endpoints.
pub const IN_PROCESS_SCHEME: &str = "in-process";

// ---------------------------------------------------------------------------
// Request Retry
// ---------------------------------------------------------------------------

/// Total tries for one logical request, across all nodes.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// First delay after a transient rejection.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(250);

/// Request backoff never grows past this.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Deadline for a single attempt against a single node.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the whole logical request, retries included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Node Health
// ---------------------------------------------------------------------------

/// A node that just failed sits out at least this long (times the growth factor).
pub const DEFAULT_MIN_NODE_BACKOFF: Duration = Duration::from_secs(8);

/// Upper bound on how long a node can be benched.
pub const DEFAULT_MAX_NODE_BACKOFF: Duration = Duration::from_secs(3600);

/// Node backoff multiplier per consecutive failure.
pub const NODE_BACKOFF_GROWTH: u32 = 2;

/// How long we wait for a removed node's channel to close before giving up on it.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Mirror Streaming
// ---------------------------------------------------------------------------

/// Base delay between stream reconnects. Doubles per attempt.
pub const STREAM_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Stream reconnect delay ceiling.
pub const DEFAULT_STREAM_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Reconnects before a subscription gives up.
pub const DEFAULT_STREAM_MAX_ATTEMPTS: u32 = 10;

// ---------------------------------------------------------------------------
// RPC Methods
// ---------------------------------------------------------------------------

pub const SUBMIT_TRANSACTION_METHOD: &str = "/ledger.Consensus/submitTransaction";

pub const SUBSCRIBE_TOPIC_METHOD: &str = "/ledger.Mirror/subscribeTopic";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// How many nodes a request should be offered, given `topology_size`
/// distinct remote identities.
///
/// A third of the network, at least one. An explicit override is honored but
/// never exceeds what the topology actually has.
pub fn nodes_per_request(topology_size: usize, override_count: Option<usize>) -> usize {
    match override_count {
        Some(count) => count.min(topology_size),
        None => topology_size.div_ceil(3).max(1).min(topology_size),
    }
}

/// Request backoff before attempt `attempt + 1`: `min(floor × 2^(attempt−1), ceiling)`.
pub fn request_backoff(attempt: u32, floor: Duration, ceiling: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    floor.saturating_mul(1u32 << exponent).min(ceiling)
}

/// Stream reconnect delay: `min(500ms × 2^attempt, ceiling)`.
pub fn stream_backoff(attempt: u32, ceiling: Duration) -> Duration {
    STREAM_BASE_BACKOFF
        .saturating_mul(1u32 << attempt.min(31))
        .min(ceiling)
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Loadable client settings.
///
/// Missing fields fall back to the constants above, so a config file only
/// needs to name what it changes:
///
/// ```json
/// {
///   "network": { "127.0.0.1:50211": "0.0.3" },
///   "mirror_network": ["127.0.0.1:5600"],
///   "max_attempts": 5
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Consensus endpoints and the account each one belongs to.
    pub network: BTreeMap<Endpoint, AccountId>,

    /// Mirror endpoints, `host:port` or `in-process:name`.
    pub mirror_network: Vec<String>,

    /// Route consensus traffic over TLS ports.
    pub transport_security: bool,

    /// Check a node's certificate against the address-book hash.
    pub verify_certificates: bool,

    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub min_node_backoff_ms: u64,
    pub max_node_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub close_timeout_ms: u64,

    /// Fixed candidate-list size instead of "a third of the network".
    pub max_nodes_per_request: Option<usize>,

    /// Ceiling on distinct nodes one request may visit. Unlimited when absent.
    pub max_node_visits: Option<usize>,

    /// Drop a node from the topology after this many consecutive failures.
    /// Unlimited when absent.
    pub max_node_failures: Option<u32>,

    pub stream_max_attempts: u32,
    pub stream_max_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: BTreeMap::new(),
            mirror_network: Vec::new(),
            transport_security: false,
            verify_certificates: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_backoff_ms: DEFAULT_MIN_BACKOFF.as_millis() as u64,
            max_backoff_ms: DEFAULT_MAX_BACKOFF.as_millis() as u64,
            min_node_backoff_ms: DEFAULT_MIN_NODE_BACKOFF.as_millis() as u64,
            max_node_backoff_ms: DEFAULT_MAX_NODE_BACKOFF.as_millis() as u64,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT.as_millis() as u64,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT.as_millis() as u64,
            max_nodes_per_request: None,
            max_node_visits: None,
            max_node_failures: None,
            stream_max_attempts: DEFAULT_STREAM_MAX_ATTEMPTS,
            stream_max_backoff_ms: DEFAULT_STREAM_MAX_BACKOFF.as_millis() as u64,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    /// Rejects settings the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ClientError::Config("max_attempts must be at least 1".into()));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(ClientError::Config(format!(
                "min_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.min_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.min_node_backoff_ms > self.max_node_backoff_ms {
            return Err(ClientError::Config(format!(
                "min_node_backoff_ms ({}) exceeds max_node_backoff_ms ({})",
                self.min_node_backoff_ms, self.max_node_backoff_ms
            )));
        }
        if self.stream_max_backoff_ms < STREAM_BASE_BACKOFF.as_millis() as u64 {
            return Err(ClientError::Config(format!(
                "stream_max_backoff_ms must be at least {}",
                STREAM_BASE_BACKOFF.as_millis()
            )));
        }
        if self.attempt_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ClientError::Config("timeouts must be non-zero".into()));
        }
        if self.max_nodes_per_request == Some(0) || self.max_node_visits == Some(0) {
            return Err(ClientError::Config(
                "node limits must be at least 1 when set".into(),
            ));
        }
        for mirror in &self.mirror_network {
            mirror.parse::<Endpoint>()?;
        }
        Ok(())
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn min_node_backoff(&self) -> Duration {
        Duration::from_millis(self.min_node_backoff_ms)
    }

    pub fn max_node_backoff(&self) -> Duration {
        Duration::from_millis(self.max_node_backoff_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn stream_max_backoff(&self) -> Duration {
        Duration::from_millis(self.stream_max_backoff_ms)
    }
}
