// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Ledger Client: Resilient Execution Core
//!
//! The part of a ledger client that has to keep working when the network
//! doesn't. Consensus nodes are run by independent operators, some of them
//! are down at any given moment, some are overloaded, and some have quietly
//! been reassigned to a different account since we last looked. Mirror nodes
//! drop streams whenever a load balancer feels like it. This crate hides all
//! of that behind `execute` and `subscribe`.
//!
//! ## Architecture
//!
//! - **endpoint**: Parsed node addresses (`host:port` or `in-process:name`).
//! - **network**: Node health, the address book, and the topology registry
//!   that picks which nodes a request goes to.
//! - **execution**: The retry/failover state machine for one logical request.
//! - **subscription**: Mirror topic streams with chunk reassembly and resume.
//! - **transport**: The channel seam. Bring your own gRPC; a local in-process
//!   transport ships for tests and the simulator.
//! - **codec**: JSON reference codec for the envelopes the local transport speaks.
//! - **signing**: Signer capability and an Ed25519 implementation.
//! - **transaction**: A signed submit request built on the execution engine.
//! - **client**: The façade that wires everything together.
//! - **config**: Defaults and the serde-loadable `ClientConfig`.
//!
//! ## Ground Rules
//!
//! 1. Every request resolves exactly once. Success, terminal rejection,
//!    exhausted retries, or timeout. Never silence.
//! 2. Retryable failures are absorbed. The caller sees them only when the
//!    budget runs out, and then with full context.
//! 3. No lock is held across an await point that sleeps.

pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod execution;
pub mod id;
pub mod network;
pub mod signing;
pub mod subscription;
pub mod transaction;
pub mod transport;

pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use endpoint::Endpoint;
pub use error::{ClientError, ErrorKind, Result, SubscriptionError};
pub use execution::{Executed, Request, RequestExecutor};
pub use id::{AccountId, EntityId, TopicId};
pub use subscription::{SubscriptionHandle, SubscriptionHandlers, TopicMessage, TopicQuery};
