//! # Transport Seam
//!
//! The execution engine never talks to sockets. It asks a [`Transport`] for
//! a [`Channel`] to an [`Endpoint`] and makes unary or server-streaming
//! calls on it with opaque byte payloads. Production plugs in gRPC; tests
//! and the simulator plug in [`local::LocalTransport`].
//!
//! ## Design Decisions
//!
//! - `open_channel` is synchronous. Channels connect lazily on first call,
//!   the way gRPC channels do, so opening one under the topology lock is
//!   cheap and never blocks.
//! - Failures are reported as a [`Status`] with a gRPC-style code. The
//!   engine classifies codes, not error types, so any transport that can
//!   name its failures fits.

pub mod local;

use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::network::certificate_hash;

pub use local::{LocalService, LocalTransport};

/// Items of a server-streaming call.
pub type ResponseStream = BoxStream<'static, Result<Bytes, Status>>;

/// gRPC-compatible status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call: code plus whatever the transport said about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    /// An `INTERNAL` status that is really an HTTP/2 stream reset.
    pub fn is_stream_reset(&self) -> bool {
        self.code == StatusCode::Internal && mentions_stream_reset(&self.message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

/// Proxies report a reset as `RST_STREAM`, `rst stream`, `Rst-Stream` and so
/// on. The separator can be any single non-alphanumeric character.
const STREAM_RESET_PATTERN: &str = r"(?i)\brst[^0-9a-zA-Z]stream\b";

/// Whether a status message describes an HTTP/2 stream reset.
pub fn mentions_stream_reset(message: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(STREAM_RESET_PATTERN).expect("static pattern is valid"))
        .is_match(message)
}

/// How a channel should be secured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub tls: bool,
    pub verify_certificates: bool,
    /// Hex SHA-384 of the node's certificate, when the address book knows it.
    pub certificate_hash: Option<String>,
}

impl ChannelOptions {
    /// Whether a TLS peer presenting `certificate` should be trusted. With
    /// verification off, or no hash on record, there is nothing to check.
    pub fn accepts_certificate(&self, certificate: &[u8]) -> bool {
        if !self.verify_certificates {
            return true;
        }
        match self.certificate_hash.as_deref() {
            Some(expected) if !expected.is_empty() => {
                certificate_hash(certificate).eq_ignore_ascii_case(expected)
            }
            _ => true,
        }
    }
}

/// Opens channels to endpoints.
pub trait Transport: Send + Sync {
    fn open_channel(
        &self,
        endpoint: &Endpoint,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn Channel>, Status>;
}

/// A connection to a single endpoint.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn unary(&self, method: &str, payload: Bytes) -> Result<Bytes, Status>;

    async fn server_streaming(&self, method: &str, payload: Bytes)
        -> Result<ResponseStream, Status>;

    /// Graceful shutdown. Callers bound this with their own timeout.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_reset_spellings() {
        for msg in [
            "RST_STREAM closed stream. HTTP/2 error code: PROTOCOL_ERROR",
            "Received Rst Stream",
            "rst-stream",
            "upstream said: rSt.StReAm",
        ] {
            assert!(mentions_stream_reset(msg), "missed {msg:?}");
        }
    }

    #[test]
    fn stream_reset_requires_word_boundaries() {
        for msg in [
            "",
            "first_stream",
            "burst stream",
            "rst stream2",
            "rst__stream",
            "rststream",
            "rst1stream",
        ] {
            assert!(!mentions_stream_reset(msg), "matched {msg:?}");
        }
    }

    #[test]
    fn certificate_must_match_the_recorded_hash() {
        let cert = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let pinned = ChannelOptions {
            tls: true,
            verify_certificates: true,
            certificate_hash: Some(certificate_hash(cert).to_uppercase()),
        };
        assert!(pinned.accepts_certificate(cert));
        assert!(!pinned.accepts_certificate(b"something else"));

        let unverified = ChannelOptions {
            verify_certificates: false,
            ..pinned.clone()
        };
        assert!(unverified.accepts_certificate(b"something else"));

        let unknown = ChannelOptions {
            certificate_hash: Some(String::new()),
            ..pinned
        };
        assert!(unknown.accepts_certificate(b"anything"));
    }

    #[test]
    fn only_internal_resets_count() {
        assert!(Status::internal("RST_STREAM").is_stream_reset());
        assert!(!Status::unavailable("RST_STREAM").is_stream_reset());
        assert!(!Status::internal("boom").is_stream_reset());
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::unavailable("").to_string(), "UNAVAILABLE");
        assert_eq!(
            Status::deadline_exceeded("too slow").to_string(),
            "DEADLINE_EXCEEDED: too slow"
        );
    }
}
