//! # Network Module
//!
//! Everything the client knows about the nodes it talks to: where they are,
//! who they claim to be, and how much we currently trust them.
//!
//! ## Architecture
//!
//! ```text
//! node.rs          One endpoint plus its health (backoff, eligibility)
//! address_book.rs  Node identities, endpoints, and certificate hashes
//! topology.rs      Registry, ranking, selection, and bulk mutation
//! refresh.rs       Background address-book refresh on stale identities
//! ```
//!
//! ## Design Decisions
//!
//! - Health is explicit state. `mark_success` and `mark_failure` are the only
//!   transitions and both return a snapshot, so the executor can log exactly
//!   what it did to a node.
//! - The topology lock is a `parking_lot::Mutex`, not a tokio one. Nothing
//!   inside it awaits, and channel teardown is done after it is released.
//! - The topology is generic over the remote-id type. Consensus nodes are
//!   keyed by account, mirror nodes by endpoint text, and both get the same
//!   diffing and teardown for free.

pub mod address_book;
pub mod node;
pub mod refresh;
pub mod topology;

pub use address_book::{
    certificate_hash, AddressBook, AddressBookEntry, AddressBookSource, LedgerId,
    StaticAddressBook,
};
pub use node::{BackoffPolicy, HealthSnapshot, Node, NodeHealth};
pub use refresh::AddressBookRefresher;
pub use topology::{NetworkChange, NodeLease, RemoteId, Topology, TopologyOptions};
