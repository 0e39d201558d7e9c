//! # Request Execution
//!
//! Drives one logical request across the network until it succeeds, is
//! rejected, or runs out of budget.
//!
//! ```text
//!   select candidates ──> pick eligible node ──> send ──> classify
//!          ^                      ^                          │
//!          │ (wrapped)            │ (retry)                  v
//!          └──────────────────────┴───── next_step ──> Complete | Fail
//! ```
//!
//! ## Design Decisions
//!
//! - **Sequential attempts.** One request never races two nodes. Racing
//!   doubles load on a network that is usually failing because of load.
//! - **Pure transitions.** `classify_*` and `PendingRequest::next_step` do
//!   not touch I/O. This module is the only place where the decision meets
//!   the topology, the clock, and the channel.
//! - **Two timeouts.** Each attempt gets `min(attempt_timeout, remaining)`.
//!   An attempt that times out is a transport failure; only the whole
//!   request running out of time is fatal.
//! - **No lock across a sleep.** Every topology call is synchronous and
//!   returns before the executor waits on anything.

pub mod outcome;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{ClientError, Result};
use crate::id::AccountId;
use crate::network::{AddressBookRefresher, Topology};
use crate::transport::Status;

pub use outcome::{classify_status, classify_transport, LedgerStatus, Outcome};
pub use state::{PendingRequest, RetryPlan, RetryPolicy, Step};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request the executor can drive.
///
/// Encoding is per node: transactions name the node they are submitted to
/// inside the signed body, so a retry against a different node re-encodes.
pub trait Request: Send + Sync {
    type Output: Send;

    /// RPC method to call.
    fn method(&self) -> &str;

    /// Nodes the caller insists on. `None` lets the topology choose.
    fn node_ids(&self) -> Option<&[AccountId]> {
        None
    }

    fn encode(&self, node: &AccountId) -> Result<Bytes>;

    /// Reads the ledger status out of a raw response.
    fn response_status(&self, response: &Bytes) -> Result<LedgerStatus>;

    /// Builds the caller-facing value from a successful response.
    fn map_response(&self, response: Bytes, node: &AccountId) -> Result<Self::Output>;

    /// Override to treat some statuses differently (a receipt query, say,
    /// where "not yet" is not a failure).
    fn classify(&self, status: LedgerStatus) -> Outcome {
        classify_status(status)
    }
}

/// A successful execution.
#[derive(Debug, Clone)]
pub struct Executed<T> {
    pub value: T,
    /// The node that answered.
    pub node: AccountId,
    /// Attempts made, the successful one included.
    pub attempts: u32,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// RequestExecutor
// ---------------------------------------------------------------------------

struct Attempt<T> {
    endpoint: Option<Endpoint>,
    outcome: Outcome,
    value: Option<T>,
}

enum Focus {
    Ready,
    Wait(Duration),
}

/// Runs requests against a consensus topology.
#[derive(Clone)]
pub struct RequestExecutor {
    topology: Arc<Topology<AccountId>>,
    policy: RetryPolicy,
    refresher: Option<Arc<AddressBookRefresher>>,
}

impl RequestExecutor {
    pub fn new(topology: Arc<Topology<AccountId>>, policy: RetryPolicy) -> Self {
        Self {
            topology,
            policy,
            refresher: None,
        }
    }

    /// Enables address-book refresh on stale node identities.
    pub fn with_refresher(mut self, refresher: Arc<AddressBookRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn topology(&self) -> &Arc<Topology<AccountId>> {
        &self.topology
    }

    /// Executes `request` to completion.
    pub async fn execute<R: Request>(&self, request: &R) -> Result<Executed<R::Output>> {
        let started = Instant::now();
        let mut state = PendingRequest::new(self.initial_candidates(request)?);
        let pinned = request.node_ids().is_some_and(|ids| !ids.is_empty());

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.policy.request_timeout {
                warn!(
                    attempts = state.attempt(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request timed out"
                );
                return Err(ClientError::RequestTimeout {
                    attempts: state.attempt(),
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            let remaining = self.policy.request_timeout - elapsed;

            if let Focus::Wait(wait) = self.focus_eligible(&mut state, pinned)? {
                debug!(wait_ms = wait.as_millis() as u64, "no eligible node; waiting");
                tokio::time::sleep(wait.min(remaining)).await;
                continue;
            }

            let node = state.begin_attempt(self.policy.max_attempts, self.policy.max_node_visits)?;
            let attempt = self.attempt(request, &node, state.attempt(), remaining).await?;

            match state.next_step(&attempt.outcome, &self.policy) {
                Step::Complete => {
                    if let Some(endpoint) = &attempt.endpoint {
                        self.topology.mark_success(endpoint);
                    }
                    let value = attempt.value.ok_or_else(|| {
                        ClientError::Codec("successful response produced no value".into())
                    })?;
                    debug!(node = %node, attempts = state.attempt(), "request succeeded");
                    return Ok(Executed {
                        value,
                        node,
                        attempts: state.attempt(),
                        elapsed: started.elapsed(),
                    });
                }
                Step::Fail(error) => {
                    warn!(
                        node = %node,
                        attempt = state.attempt(),
                        error = %error,
                        "request failed"
                    );
                    return Err(error);
                }
                Step::Retry(plan, error) => {
                    debug!(
                        node = %node,
                        attempt = state.attempt(),
                        error = %error,
                        delay_ms = plan.delay.as_millis() as u64,
                        advance = plan.advance,
                        "retrying request"
                    );
                    if plan.penalize {
                        if let Some(endpoint) = &attempt.endpoint {
                            self.topology.mark_failure(endpoint).await;
                        }
                    }
                    if plan.refresh_address_book {
                        if let Some(refresher) = &self.refresher {
                            refresher.trigger();
                        }
                    }
                    let wrapped = state.apply(&plan, error);
                    if wrapped && !pinned {
                        let fresh = self.topology.select_nodes();
                        if !fresh.is_empty() {
                            state.replace_candidates(fresh);
                        }
                    }
                    if !plan.delay.is_zero() {
                        let left = self
                            .policy
                            .request_timeout
                            .saturating_sub(started.elapsed());
                        tokio::time::sleep(plan.delay.min(left)).await;
                    }
                }
            }
        }
    }

    fn initial_candidates<R: Request>(&self, request: &R) -> Result<Vec<AccountId>> {
        let candidates = match request.node_ids() {
            Some(ids) if !ids.is_empty() => ids.to_vec(),
            _ => self.topology.select_nodes(),
        };
        if candidates.is_empty() {
            return Err(ClientError::EmptyTopology);
        }
        Ok(candidates)
    }

    /// Moves the cursor to the first eligible candidate at or after it.
    /// If every candidate is benched, points at the one that recovers
    /// soonest and says how long to wait.
    fn focus_eligible(&self, state: &mut PendingRequest<AccountId>, pinned: bool) -> Result<Focus> {
        if let Some(focus) = self.scan(state) {
            return Ok(focus);
        }
        // Every candidate left the topology, most likely through an
        // address-book refresh. Pinned requests have nowhere else to go.
        if !pinned {
            let fresh = self.topology.select_nodes();
            if !fresh.is_empty() && state.candidates() != fresh.as_slice() {
                state.replace_candidates(fresh);
                if let Some(focus) = self.scan(state) {
                    return Ok(focus);
                }
            }
        }
        Err(ClientError::EmptyTopology)
    }

    fn scan(&self, state: &mut PendingRequest<AccountId>) -> Option<Focus> {
        let now = Instant::now();
        let count = state.candidates().len();
        let mut soonest: Option<(usize, Duration)> = None;

        for offset in 0..count {
            let index = (state.cursor() + offset) % count;
            let Some(health) = self.topology.best_health(&state.candidates()[index]) else {
                continue;
            };
            if health.is_eligible_at(now) {
                state.focus(index);
                return Some(Focus::Ready);
            }
            let wait = health.remaining(now);
            if soonest.map_or(true, |(_, best)| wait < best) {
                soonest = Some((index, wait));
            }
        }

        let (index, wait) = soonest?;
        state.focus(index);
        Some(Focus::Wait(wait))
    }

    async fn attempt<R: Request>(
        &self,
        request: &R,
        node: &AccountId,
        attempt: u32,
        remaining: Duration,
    ) -> Result<Attempt<R::Output>> {
        let Some(lease) = self.topology.lease(node) else {
            return Ok(Attempt {
                endpoint: None,
                outcome: classify_transport(Status::unavailable(format!(
                    "node {node} left the topology"
                ))),
                value: None,
            });
        };
        let endpoint = Some(lease.endpoint.clone());
        let channel = match lease.channel {
            Ok(channel) => channel,
            Err(status) => {
                return Ok(Attempt {
                    endpoint,
                    outcome: classify_transport(status),
                    value: None,
                })
            }
        };

        let payload = request.encode(node)?;
        debug!(
            node = %node,
            endpoint = %lease.endpoint,
            attempt,
            method = request.method(),
            "sending request"
        );
        trace!(node = %node, payload = %hex::encode(&payload), "request payload");

        let budget = self.policy.attempt_timeout.min(remaining);
        let call = channel.unary(request.method(), payload);
        let response = match tokio::time::timeout(budget, call).await {
            Err(_) => {
                return Ok(Attempt {
                    endpoint,
                    outcome: classify_transport(Status::deadline_exceeded(format!(
                        "no response within {}ms",
                        budget.as_millis()
                    ))),
                    value: None,
                })
            }
            Ok(Err(status)) => {
                return Ok(Attempt {
                    endpoint,
                    outcome: classify_transport(status),
                    value: None,
                })
            }
            Ok(Ok(response)) => response,
        };
        trace!(node = %node, response = %hex::encode(&response), "response payload");

        let status = request.response_status(&response)?;
        let outcome = request.classify(status);
        let value = if outcome.is_success() {
            Some(request.map_response(response, node)?)
        } else {
            None
        };
        Ok(Attempt {
            endpoint,
            outcome,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::network::{
        AddressBook, AddressBookEntry, BackoffPolicy, StaticAddressBook, TopologyOptions,
    };
    use crate::transport::{LocalService, LocalTransport, StatusCode};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replies from a script, then `OK` forever.
    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<LedgerStatus, Status>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<LedgerStatus, Status>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LocalService for Scripted {
        async fn unary(
            &self,
            _method: &str,
            _payload: Bytes,
        ) -> std::result::Result<Bytes, Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().pop_front().unwrap_or(Ok(LedgerStatus::Ok));
            reply.map(|status| Bytes::from(status.as_str().to_string()))
        }
    }

    /// Sleeps far past any attempt timeout.
    struct Hang;

    #[async_trait]
    impl LocalService for Hang {
        async fn unary(
            &self,
            _method: &str,
            _payload: Bytes,
        ) -> std::result::Result<Bytes, Status> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Bytes::from_static(b"OK"))
        }
    }

    /// The response body is the status name; the output is the node id.
    struct Ping;

    impl Request for Ping {
        type Output = String;

        fn method(&self) -> &str {
            "ping"
        }

        fn encode(&self, node: &AccountId) -> Result<Bytes> {
            Ok(Bytes::from(node.to_string()))
        }

        fn response_status(&self, response: &Bytes) -> Result<LedgerStatus> {
            let text =
                std::str::from_utf8(response).map_err(|e| ClientError::Codec(e.to_string()))?;
            serde_json::from_str(&format!("\"{text}\""))
                .map_err(|e| ClientError::Codec(e.to_string()))
        }

        fn map_response(&self, _response: Bytes, node: &AccountId) -> Result<String> {
            Ok(node.to_string())
        }
    }

    struct Pinned(Vec<AccountId>);

    impl Request for Pinned {
        type Output = String;

        fn method(&self) -> &str {
            "ping"
        }

        fn node_ids(&self) -> Option<&[AccountId]> {
            Some(&self.0)
        }

        fn encode(&self, node: &AccountId) -> Result<Bytes> {
            Ping.encode(node)
        }

        fn response_status(&self, response: &Bytes) -> Result<LedgerStatus> {
            Ping.response_status(response)
        }

        fn map_response(&self, response: Bytes, node: &AccountId) -> Result<String> {
            Ping.map_response(response, node)
        }
    }

    fn options() -> TopologyOptions {
        TopologyOptions {
            node_backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
            ..TopologyOptions::default()
        }
    }

    async fn setup(
        services: Vec<Arc<dyn LocalService>>,
        policy: RetryPolicy,
    ) -> (Arc<LocalTransport>, RequestExecutor) {
        let transport = Arc::new(LocalTransport::new());
        let topology = Arc::new(Topology::new(transport.clone(), options()));
        let mut network = Vec::new();
        for (i, service) in services.into_iter().enumerate() {
            let endpoint = Endpoint::in_process(format!("node-{i}"));
            transport.register(&endpoint, service);
            network.push((endpoint, AccountId::from_num(3 + i as u64)));
        }
        topology.set_network(network).await;
        topology.set_max_nodes_per_request(Some(3));
        (transport, RequestExecutor::new(topology, policy))
    }

    fn unavailable() -> std::result::Result<LedgerStatus, Status> {
        Err(Status::unavailable("connection refused"))
    }

    // -- 1. Happy path ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success() {
        let node = Scripted::new(vec![]);
        let (_, executor) = setup(vec![node.clone()], RetryPolicy::default()).await;
        let done = executor.execute(&Ping).await.unwrap();
        assert_eq!(done.attempts, 1);
        assert_eq!(done.value, "0.0.3");
        assert_eq!(node.calls(), 1);
    }

    // -- 2. Failover ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn k_failures_then_success_reports_k_plus_one() {
        let a = Scripted::new(vec![unavailable()]);
        let b = Scripted::new(vec![unavailable()]);
        let c = Scripted::new(vec![]);
        let (_, executor) =
            setup(vec![a.clone(), b.clone(), c.clone()], RetryPolicy::default()).await;

        let done = executor.execute(&Ping).await.unwrap();
        assert_eq!(done.attempts, 3);
        assert_eq!(done.node, AccountId::from_num(5));

        // The two failing nodes were benched.
        let topology = executor.topology();
        let benched = topology
            .health(&Endpoint::in_process("node-0"))
            .unwrap();
        assert_eq!(benched.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_retries_the_same_node() {
        let a = Scripted::new(vec![Ok(LedgerStatus::Busy), Ok(LedgerStatus::Busy)]);
        let b = Scripted::new(vec![]);
        let (_, executor) = setup(vec![a.clone(), b.clone()], RetryPolicy::default()).await;

        let started = Instant::now();
        let done = executor.execute(&Ping).await.unwrap();
        assert_eq!(done.attempts, 3);
        assert_eq!(done.node, AccountId::from_num(3));
        assert_eq!(b.calls(), 0);
        // 250ms then 500ms.
        assert!(started.elapsed() >= Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_a_transport_failure() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        let ok = Scripted::new(vec![]);
        let (_, executor) = setup(vec![Arc::new(Hang), ok.clone()], policy).await;

        let done = executor.execute(&Ping).await.unwrap();
        assert_eq!(done.attempts, 2);
        assert_eq!(done.node, AccountId::from_num(4));
    }

    // -- 3. Terminal outcomes ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn terminal_rejection_returns_immediately() {
        let a = Scripted::new(vec![Ok(LedgerStatus::InvalidSignature)]);
        let b = Scripted::new(vec![]);
        let (_, executor) = setup(vec![a.clone(), b.clone()], RetryPolicy::default()).await;

        let err = executor.execute(&Ping).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TerminalLedgerRejection);
        assert_eq!(err.ledger_status(), Some(LedgerStatus::InvalidSignature));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_transport_error_surfaces() {
        let a = Scripted::new(vec![Err(Status::new(StatusCode::PermissionDenied, "nope"))]);
        let (_, executor) = setup(vec![a.clone()], RetryPolicy::default()).await;
        let err = executor.execute(&Ping).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_max_attempts_is_exhausted_retries() {
        let policy = RetryPolicy {
            max_attempts: 4,
            ..RetryPolicy::default()
        };
        let busy = || Ok(LedgerStatus::Busy);
        let a = Scripted::new((0..10).map(|_| busy()).collect());
        let (_, executor) = setup(vec![a.clone()], policy).await;

        let err = executor.execute(&Ping).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExhaustedRetries);
        assert_eq!(err.ledger_status(), None);
        assert_eq!(a.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn node_visit_ceiling_is_exhausted_retries() {
        let policy = RetryPolicy {
            max_node_visits: Some(2),
            ..RetryPolicy::default()
        };
        let services: Vec<Arc<dyn LocalService>> =
            (0..3).map(|_| Scripted::new(vec![unavailable()]) as Arc<dyn LocalService>).collect();
        let (_, executor) = setup(services, policy).await;

        let err = executor.execute(&Ping).await.unwrap_err();
        let nodes_visited = match err {
            ClientError::ExhaustedRetries { nodes_visited, .. } => nodes_visited,
            other => panic!("expected exhausted retries, got {other}"),
        };
        assert_eq!(nodes_visited, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_bounds_the_whole_call() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(25),
            max_attempts: 100,
            ..RetryPolicy::default()
        };
        let (_, executor) = setup(vec![Arc::new(Hang)], policy).await;
        let err = executor.execute(&Ping).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn empty_topology_fails_fast() {
        let (_, executor) = setup(vec![], RetryPolicy::default()).await;
        let err = executor.execute(&Ping).await.unwrap_err();
        assert!(matches!(err, ClientError::EmptyTopology));
    }

    // -- 4. Stale identities ----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn stale_identity_refreshes_and_fails_over() {
        let a = Scripted::new(vec![Ok(LedgerStatus::InvalidNodeAccount)]);
        let b = Scripted::new(vec![]);
        let (_, executor) = setup(vec![a.clone(), b.clone()], RetryPolicy::default()).await;

        // The refreshed book keeps both nodes but attaches metadata.
        let book = AddressBook::new(vec![
            AddressBookEntry::new(AccountId::from_num(3), vec![Endpoint::in_process("node-0")])
                .with_certificate_hash("aa"),
            AddressBookEntry::new(AccountId::from_num(4), vec![Endpoint::in_process("node-1")]),
        ]);
        let refresher = Arc::new(AddressBookRefresher::new(
            Arc::new(StaticAddressBook(book)),
            Arc::clone(executor.topology()),
        ));
        let executor = executor.with_refresher(Arc::clone(&refresher));

        let done = executor.execute(&Ping).await.unwrap();
        assert_eq!(done.attempts, 2);
        assert_eq!(done.node, AccountId::from_num(4));

        while refresher.is_refreshing() {
            tokio::task::yield_now().await;
        }
        assert!(executor
            .topology()
            .address_book_entry(&AccountId::from_num(3))
            .is_some());
    }

    // -- 5. Pinned nodes --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn pinned_nodes_are_used_in_order() {
        let a = Scripted::new(vec![]);
        let b = Scripted::new(vec![]);
        let (_, executor) = setup(vec![a.clone(), b.clone()], RetryPolicy::default()).await;

        let done = executor
            .execute(&Pinned(vec![AccountId::from_num(4)]))
            .await
            .unwrap();
        assert_eq!(done.node, AccountId::from_num(4));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_pinned_node_waits_out_its_backoff() {
        let a = Scripted::new(vec![unavailable()]);
        let (_, executor) = setup(vec![a.clone()], RetryPolicy::default()).await;
        let started = Instant::now();
        let done = executor
            .execute(&Pinned(vec![AccountId::from_num(3)]))
            .await
            .unwrap();
        assert_eq!(done.attempts, 2);
        // The wrap delay covers the node's 200ms bench.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_node_outside_topology_fails() {
        let (_, executor) = setup(vec![Scripted::new(vec![])], RetryPolicy::default()).await;
        let err = executor
            .execute(&Pinned(vec![AccountId::from_num(99)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EmptyTopology));
    }
}
