//! # Endpoints
//!
//! A node address is one of two things: a network `host:port`, or the name
//! of a service living in this process (`in-process:name`). The string is
//! parsed exactly once into an [`Endpoint`] and never inspected again.
//!
//! ## Port Canonicalization
//!
//! ```text
//!   consensus   50211 (plaintext)  <──>  50212 (TLS)
//!   mirror      (none)             <──>  443   (TLS)
//!   anything else stays where it is
//! ```
//!
//! Switching transport security rewrites only the recognized ports. An
//! operator who runs a node on 8443 meant 8443.
//!
//! ## Text Forms
//!
//! `Display` renders the address alone, which is what channels and the
//! mirror set key on. The serde form also keeps an explicit TLS request,
//! written `tls://host:port`, so a config file round-trips exactly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{
    CONSENSUS_PLAINTEXT_PORT, CONSENSUS_TLS_PORT, IN_PROCESS_SCHEME, MIRROR_TLS_PORT,
};
use crate::error::{ClientError, Result};

/// Serde prefix for a network endpoint with TLS forced on.
const SECURED_PREFIX: &str = "tls://";

/// A parsed node address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    /// A network address. `secure` forces TLS even on an unrecognized port.
    Remote { host: String, port: u16, secure: bool },
    /// A service registered in the same process.
    InProcess { name: String },
}

impl Endpoint {
    /// Parses `host:port` or `in-process:name`.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason| ClientError::InvalidEndpoint {
            input: input.to_string(),
            reason,
        };

        let (left, right) = input
            .split_once(':')
            .ok_or_else(|| invalid("expected host:port or in-process:name"))?;

        if left == IN_PROCESS_SCHEME {
            if right.is_empty() {
                return Err(invalid("in-process name is empty"));
            }
            return Ok(Endpoint::InProcess {
                name: right.to_string(),
            });
        }

        if left.is_empty() {
            return Err(invalid("host is empty"));
        }
        if right.is_empty() {
            return Err(invalid("port is empty"));
        }
        if right.contains(':') {
            return Err(invalid("too many `:` separators"));
        }
        let port = right
            .parse::<u16>()
            .map_err(|_| invalid("port is not a number in 0..=65535"))?;

        Ok(Endpoint::Remote {
            host: left.to_string(),
            port,
            secure: false,
        })
    }

    /// A plain network endpoint. Security follows from the port.
    pub fn remote(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Remote {
            host: host.into(),
            port,
            secure: false,
        }
    }

    pub fn in_process(name: impl Into<String>) -> Self {
        Endpoint::InProcess { name: name.into() }
    }

    /// Marks the endpoint as TLS regardless of its port.
    pub fn secured(self) -> Self {
        match self {
            Endpoint::Remote { host, port, .. } => Endpoint::Remote {
                host,
                port,
                secure: true,
            },
            other => other,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Remote { host, .. } => Some(host),
            Endpoint::InProcess { .. } => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Remote { port, .. } => Some(*port),
            Endpoint::InProcess { .. } => None,
        }
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self, Endpoint::InProcess { .. })
    }

    /// True on a known TLS port or when TLS was requested explicitly.
    /// In-process endpoints never use TLS.
    pub fn is_transport_secure(&self) -> bool {
        match self {
            Endpoint::Remote { port, secure, .. } => {
                *secure || *port == CONSENSUS_TLS_PORT || *port == MIRROR_TLS_PORT
            }
            Endpoint::InProcess { .. } => false,
        }
    }

    /// Moves a plaintext consensus port to its TLS twin. Other ports are
    /// returned untouched.
    pub fn to_secure(&self) -> Self {
        match self {
            Endpoint::Remote {
                host,
                port: CONSENSUS_PLAINTEXT_PORT,
                secure,
            } => Endpoint::Remote {
                host: host.clone(),
                port: CONSENSUS_TLS_PORT,
                secure: *secure,
            },
            other => other.clone(),
        }
    }

    /// Moves a TLS consensus port back to plaintext. Mirror TLS has no
    /// plaintext twin, and custom ports are returned untouched.
    pub fn to_insecure(&self) -> Self {
        match self {
            Endpoint::Remote {
                host,
                port: CONSENSUS_TLS_PORT,
                ..
            } => Endpoint::Remote {
                host: host.clone(),
                port: CONSENSUS_PLAINTEXT_PORT,
                secure: false,
            },
            other => other.clone(),
        }
    }

    pub fn with_security(&self, secure: bool) -> Self {
        if secure {
            self.to_secure()
        } else {
            self.to_insecure()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Remote { host, port, .. } => write!(f, "{host}:{port}"),
            Endpoint::InProcess { name } => write!(f, "{IN_PROCESS_SCHEME}:{name}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Endpoint::Remote { secure: true, .. } => {
                serializer.collect_str(&format_args!("{SECURED_PREFIX}{self}"))
            }
            _ => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let endpoint = match s.strip_prefix(SECURED_PREFIX) {
            Some(address) => Endpoint::parse(address).map(Endpoint::secured),
            None => Endpoint::parse(&s),
        };
        endpoint.map_err(serde::de::Error::custom)
    }
}
