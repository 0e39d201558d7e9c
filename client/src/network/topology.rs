//! # Topology
//!
//! The client's registry of known nodes for one ledger. Maps each remote
//! identity to one or more [`Node`]s, ranks them by health, and applies bulk
//! changes (new node set, security switch, address-book refresh) without
//! disturbing nodes the change does not touch.
//!
//! ## Locking
//!
//! One `parking_lot::Mutex` guards the index structures and nothing else.
//! It is never held across an await. Channel teardown happens after the
//! lock is released, each close bounded by `close_timeout`.
//!
//! ## Selection
//!
//! ```text
//!   rank(node) = (next_eligible_at, backoff, insertion order)
//!   rank(id)   = best rank among its nodes
//!   select     = top k ids, k = override.min(N) or max(1, ceil(N / 3))
//! ```
//!
//! A third of the network keeps per-node load bounded while still leaving
//! room to route around a minority of dead nodes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{nodes_per_request, DEFAULT_CLOSE_TIMEOUT};
use crate::endpoint::Endpoint;
use crate::id::AccountId;
use crate::network::address_book::{AddressBook, AddressBookEntry, LedgerId};
use crate::network::node::{BackoffPolicy, HealthSnapshot, Node};
use crate::transport::{Channel, Status, Transport};

/// Anything that can identify the owner of a node.
///
/// Consensus nodes are keyed by [`AccountId`]; mirror nodes by their
/// endpoint text.
pub trait RemoteId: Clone + Eq + Hash + Ord + fmt::Display + fmt::Debug + Send + Sync + 'static {}

impl<T> RemoteId for T where
    T: Clone + Eq + Hash + Ord + fmt::Display + fmt::Debug + Send + Sync + 'static
{
}

// ---------------------------------------------------------------------------
// Options & Results
// ---------------------------------------------------------------------------

/// Settings a topology starts with. Security and certificate checking can
/// change later; the rest is fixed.
#[derive(Debug, Clone)]
pub struct TopologyOptions {
    pub node_backoff: BackoffPolicy,
    pub transport_security: bool,
    pub verify_certificates: bool,
    pub max_nodes_per_request: Option<usize>,
    /// Remove a node after this many consecutive failures.
    pub max_node_failures: Option<u32>,
    pub close_timeout: Duration,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            node_backoff: BackoffPolicy::default(),
            transport_security: false,
            verify_certificates: true,
            max_nodes_per_request: None,
            max_node_failures: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// What a `set_network` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkChange {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl NetworkChange {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Everything needed to make one attempt against one node.
pub struct NodeLease<K> {
    pub remote_id: K,
    pub endpoint: Endpoint,
    pub health: HealthSnapshot,
    /// Opening can fail; the caller treats that as a transport failure.
    pub channel: Result<Arc<dyn Channel>, Status>,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

struct TopologyState<K> {
    ledger_id: Option<LedgerId>,
    nodes: Vec<Node<K>>,
    address_book: HashMap<K, AddressBookEntry>,
    transport_security: bool,
    verify_certificates: bool,
    max_nodes_per_request: Option<usize>,
    next_seq: u64,
    round_robin: usize,
}

impl<K: RemoteId> TopologyState<K> {
    fn position(&self, endpoint: &Endpoint) -> Option<usize> {
        self.nodes.iter().position(|n| n.endpoint() == endpoint)
    }

    /// Distinct remote ids, best first.
    fn ranked_remote_ids(&self) -> Vec<K> {
        let mut best: HashMap<&K, &Node<K>> = HashMap::new();
        for node in &self.nodes {
            best.entry(node.remote_id())
                .and_modify(|current| {
                    if node.rank_cmp(current).is_lt() {
                        *current = node;
                    }
                })
                .or_insert(node);
        }
        let mut ranked: Vec<&Node<K>> = best.into_values().collect();
        ranked.sort_by(|a, b| a.rank_cmp(b));
        ranked.into_iter().map(|n| n.remote_id().clone()).collect()
    }

    fn distinct_ids(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.remote_id())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Registry of nodes for one ledger.
pub struct Topology<K> {
    transport: Arc<dyn Transport>,
    node_backoff: BackoffPolicy,
    max_node_failures: Option<u32>,
    close_timeout: Duration,
    state: Mutex<TopologyState<K>>,
}

impl<K: RemoteId> Topology<K> {
    pub fn new(transport: Arc<dyn Transport>, options: TopologyOptions) -> Self {
        Self {
            transport,
            node_backoff: options.node_backoff,
            max_node_failures: options.max_node_failures,
            close_timeout: options.close_timeout,
            state: Mutex::new(TopologyState {
                ledger_id: None,
                nodes: Vec::new(),
                address_book: HashMap::new(),
                transport_security: options.transport_security,
                verify_certificates: options.verify_certificates,
                max_nodes_per_request: options.max_nodes_per_request,
                next_seq: 0,
                round_robin: 0,
            }),
        }
    }

    // -- Accessors ----------------------------------------------------------

    pub fn ledger_id(&self) -> Option<LedgerId> {
        self.state.lock().ledger_id
    }

    pub fn set_ledger_id(&self, ledger_id: Option<LedgerId>) {
        self.state.lock().ledger_id = ledger_id;
    }

    pub fn transport_security(&self) -> bool {
        self.state.lock().transport_security
    }

    pub fn verify_certificates(&self) -> bool {
        self.state.lock().verify_certificates
    }

    pub fn max_nodes_per_request(&self) -> Option<usize> {
        self.state.lock().max_nodes_per_request
    }

    pub fn set_max_nodes_per_request(&self, count: Option<usize>) {
        self.state.lock().max_nodes_per_request = count;
    }

    /// Number of distinct remote ids.
    pub fn len(&self) -> usize {
        self.state.lock().distinct_ids()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// The current `{endpoint → remote id}` view.
    pub fn network(&self) -> HashMap<Endpoint, K> {
        self.state
            .lock()
            .nodes
            .iter()
            .map(|n| (n.endpoint().clone(), n.remote_id().clone()))
            .collect()
    }

    pub fn contains(&self, remote_id: &K) -> bool {
        self.state
            .lock()
            .nodes
            .iter()
            .any(|n| n.remote_id() == remote_id)
    }

    pub fn health(&self, endpoint: &Endpoint) -> Option<HealthSnapshot> {
        let state = self.state.lock();
        state.position(endpoint).map(|i| state.nodes[i].health())
    }

    /// Best health among the nodes of `remote_id`.
    pub fn best_health(&self, remote_id: &K) -> Option<HealthSnapshot> {
        self.state
            .lock()
            .nodes
            .iter()
            .filter(|n| n.remote_id() == remote_id)
            .min_by(|a, b| a.rank_cmp(b))
            .map(|n| n.health())
    }

    pub fn address_book_entry(&self, remote_id: &K) -> Option<AddressBookEntry> {
        self.state.lock().address_book.get(remote_id).cloned()
    }

    // -- Selection ----------------------------------------------------------

    /// The remote ids a new request should be offered, best first.
    pub fn select_nodes(&self) -> Vec<K> {
        let state = self.state.lock();
        let ranked = state.ranked_remote_ids();
        let k = nodes_per_request(ranked.len(), state.max_nodes_per_request);
        ranked.into_iter().take(k).collect()
    }

    /// The best-ranked node of `remote_id`, with its channel opened.
    pub fn lease(&self, remote_id: &K) -> Option<NodeLease<K>> {
        let mut guard = self.state.lock();
        let node = guard
            .nodes
            .iter_mut()
            .filter(|n| n.remote_id() == remote_id)
            .min_by(|a, b| a.rank_cmp(b))?;
        Some(NodeLease {
            remote_id: node.remote_id().clone(),
            endpoint: node.endpoint().clone(),
            health: node.health(),
            channel: node.channel(&*self.transport),
        })
    }

    /// Round-robin over the nodes that are eligible now. If every node is
    /// benched, the one that recovers first. Mirror subscriptions use this.
    pub fn next_node(&self) -> Option<NodeLease<K>> {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let len = state.nodes.len();
        let start = state.round_robin % len.max(1);
        let index = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| state.nodes[i].health().is_eligible_at(now))
            .or_else(|| (0..len).min_by_key(|&i| state.nodes[i].health().next_eligible_at))?;
        state.round_robin = (index + 1) % len;
        let node = &mut state.nodes[index];
        Some(NodeLease {
            remote_id: node.remote_id().clone(),
            endpoint: node.endpoint().clone(),
            health: node.health(),
            channel: node.channel(&*self.transport),
        })
    }

    // -- Health -------------------------------------------------------------

    pub fn mark_success(&self, endpoint: &Endpoint) -> Option<HealthSnapshot> {
        let mut state = self.state.lock();
        let index = state.position(endpoint)?;
        Some(state.nodes[index].mark_success(Instant::now()))
    }

    /// Benches the node. A node that keeps failing past
    /// `max_node_failures` is removed outright.
    pub async fn mark_failure(&self, endpoint: &Endpoint) -> Option<HealthSnapshot> {
        let (snapshot, retired) = {
            let mut state = self.state.lock();
            let index = state.position(endpoint)?;
            let snapshot = state.nodes[index].mark_failure(Instant::now());
            let prune = self
                .max_node_failures
                .is_some_and(|max| snapshot.consecutive_failures >= max);
            let retired = if prune {
                let mut node = state.nodes.remove(index);
                warn!(
                    node = %node.remote_id(),
                    endpoint = %endpoint,
                    failures = snapshot.consecutive_failures,
                    "removing node after repeated failures"
                );
                node.take_channel()
            } else {
                None
            };
            (snapshot, retired)
        };
        if let Some(channel) = retired {
            close_channels(vec![channel], self.close_timeout).await;
        }
        debug!(
            endpoint = %endpoint,
            backoff_ms = snapshot.backoff.as_millis() as u64,
            failures = snapshot.consecutive_failures,
            "node marked unhealthy"
        );
        Some(snapshot)
    }

    // -- Mutation -----------------------------------------------------------

    /// Replaces the node set with `network`.
    ///
    /// Nodes whose endpoint and id are unchanged keep their health and
    /// channel. Nodes that disappeared are closed. New nodes inherit the
    /// current security settings and any address-book entry for their id.
    pub async fn set_network<I>(&self, network: I) -> NetworkChange
    where
        I: IntoIterator<Item = (Endpoint, K)>,
    {
        let (change, retired) = self.replace_network(network);
        close_channels(retired, self.close_timeout).await;
        if !change.is_noop() {
            info!(
                added = change.added,
                removed = change.removed,
                unchanged = change.unchanged,
                "network updated"
            );
        }
        change
    }

    /// The synchronous half of [`Topology::set_network`]. Returns the
    /// channels of removed nodes; the caller owns closing them.
    pub fn replace_network<I>(&self, network: I) -> (NetworkChange, Vec<Arc<dyn Channel>>)
    where
        I: IntoIterator<Item = (Endpoint, K)>,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let secure = state.transport_security;
        let desired: HashMap<Endpoint, K> = network
            .into_iter()
            .map(|(endpoint, id)| (endpoint.with_security(secure), id))
            .collect();

        let mut retired = Vec::new();
        let before = state.nodes.len();
        state.nodes.retain_mut(|node| {
            let keep = desired.get(node.endpoint()) == Some(node.remote_id());
            if !keep {
                retired.extend(node.take_channel());
            }
            keep
        });
        let removed = before - state.nodes.len();
        let unchanged = state.nodes.len();

        let existing: HashSet<&Endpoint> = state.nodes.iter().map(|n| n.endpoint()).collect();
        let mut added: Vec<(Endpoint, K)> = desired
            .iter()
            .filter(|(endpoint, _)| !existing.contains(endpoint))
            .map(|(endpoint, id)| (endpoint.clone(), id.clone()))
            .collect();
        added.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let now = Instant::now();
        let count = added.len();
        for (endpoint, id) in added {
            let mut node = Node::new(
                id.clone(),
                endpoint,
                state.verify_certificates,
                self.node_backoff,
                state.next_seq,
                now,
            );
            state.next_seq += 1;
            node.set_address_book_entry(state.address_book.get(&id).cloned());
            state.nodes.push(node);
        }

        let change = NetworkChange {
            added: count,
            removed,
            unchanged,
        };
        (change, retired)
    }

    /// Switches every node between plaintext and TLS ports. Returns `false`
    /// when the setting was already `secure`.
    pub async fn set_transport_security(&self, secure: bool) -> bool {
        let retired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.transport_security == secure {
                return false;
            }
            state.transport_security = secure;
            let now = Instant::now();
            state
                .nodes
                .iter_mut()
                .filter_map(|node| {
                    let endpoint = node.endpoint().with_security(secure);
                    let verify = node.verify_certificates();
                    node.rebuild(endpoint, verify, now)
                })
                .collect::<Vec<_>>()
        };
        close_channels(retired, self.close_timeout).await;
        info!(secure, "transport security changed; all nodes eligible");
        true
    }

    /// Turns certificate checking on or off. Open channels are dropped so
    /// the next attempt reconnects under the new rule.
    pub async fn set_verify_certificates(&self, verify: bool) -> bool {
        let retired = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.verify_certificates == verify {
                return false;
            }
            state.verify_certificates = verify;
            let now = Instant::now();
            state
                .nodes
                .iter_mut()
                .filter_map(|node| {
                    let endpoint = node.endpoint().clone();
                    node.rebuild(endpoint, verify, now)
                })
                .collect::<Vec<_>>()
        };
        close_channels(retired, self.close_timeout).await;
        true
    }

    /// Closes every channel and forgets every node.
    pub async fn close(&self) {
        let retired: Vec<Arc<dyn Channel>> = {
            let mut state = self.state.lock();
            state
                .nodes
                .drain(..)
                .filter_map(|mut node| node.take_channel())
                .collect()
        };
        let count = retired.len();
        close_channels(retired, self.close_timeout).await;
        debug!(channels = count, "topology closed");
    }
}

impl Topology<AccountId> {
    /// Applies a new address book to node metadata.
    ///
    /// An entry that arrives without a certificate hash keeps the hash we
    /// already had for that node.
    pub fn set_address_book(&self, book: &AddressBook) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for entry in &book.nodes {
            let mut merged = entry.clone();
            if let Some(previous) = state.address_book.get(&entry.remote_id) {
                merged.inherit_certificate_hash(previous);
            }
            state.address_book.insert(entry.remote_id, merged);
        }
        for node in state.nodes.iter_mut() {
            if let Some(entry) = state.address_book.get(node.remote_id()) {
                node.set_address_book_entry(Some(entry.clone()));
            }
        }
        debug!(entries = book.len(), "address book applied");
    }
}

/// Closes channels concurrently, giving each at most `timeout`.
async fn close_channels(channels: Vec<Arc<dyn Channel>>, timeout: Duration) {
    if channels.is_empty() {
        return;
    }
    let closes = channels.into_iter().map(|channel| async move {
        if tokio::time::timeout(timeout, channel.close()).await.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "channel close timed out");
        }
    });
    futures::future::join_all(closes).await;
}
