//! # Nodes & Health
//!
//! A [`Node`] is one endpoint of one remote identity, plus what we have
//! learned about it: how long it should sit out after failing, when it is
//! next worth trying, and how many times in a row it has let us down.
//!
//! Health only ever changes as the direct result of a finished attempt.
//! There is no passive decay. A benched node becomes eligible again because
//! the clock passes `next_eligible_at`, not because anything was mutated.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::{DEFAULT_MAX_NODE_BACKOFF, DEFAULT_MIN_NODE_BACKOFF, NODE_BACKOFF_GROWTH};
use crate::endpoint::Endpoint;
use crate::network::address_book::AddressBookEntry;
use crate::transport::{Channel, ChannelOptions, Status, Transport};

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// How node backoff grows on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
    pub growth_factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: DEFAULT_MIN_NODE_BACKOFF,
            ceiling: DEFAULT_MAX_NODE_BACKOFF,
            growth_factor: NODE_BACKOFF_GROWTH,
        }
    }
}

impl BackoffPolicy {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            ..Self::default()
        }
    }

    fn grow(&self, current: Duration) -> Duration {
        current.saturating_mul(self.growth_factor).min(self.ceiling)
    }
}

// ---------------------------------------------------------------------------
// NodeHealth
// ---------------------------------------------------------------------------

/// A copy of a node's health at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub next_eligible_at: Instant,
    pub backoff: Duration,
    pub consecutive_failures: u32,
}

impl HealthSnapshot {
    pub fn is_eligible_at(&self, now: Instant) -> bool {
        self.next_eligible_at <= now
    }

    /// Time left until the node may be tried again.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_eligible_at.saturating_duration_since(now)
    }
}

/// Mutable health state. Transitions are explicit and return the new
/// snapshot so callers can log or assert on it.
#[derive(Debug, Clone)]
pub struct NodeHealth {
    policy: BackoffPolicy,
    next_eligible_at: Instant,
    backoff: Duration,
    consecutive_failures: u32,
}

impl NodeHealth {
    /// A fresh node: eligible now, backoff at the floor.
    pub fn new(policy: BackoffPolicy, now: Instant) -> Self {
        Self {
            policy,
            next_eligible_at: now,
            backoff: policy.floor,
            consecutive_failures: 0,
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            next_eligible_at: self.next_eligible_at,
            backoff: self.backoff,
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// Grows the backoff and benches the node for that long.
    pub fn mark_failure(&mut self, now: Instant) -> HealthSnapshot {
        self.backoff = self.policy.grow(self.backoff);
        let candidate = now + self.backoff;
        // Two failures on the same clock tick at the ceiling would otherwise
        // leave the deadline where it was.
        self.next_eligible_at = if candidate > self.next_eligible_at {
            candidate
        } else {
            self.next_eligible_at + Duration::from_nanos(1)
        };
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.snapshot()
    }

    /// Back to the floor, eligible immediately.
    pub fn mark_success(&mut self, now: Instant) -> HealthSnapshot {
        self.backoff = self.policy.floor;
        self.consecutive_failures = 0;
        self.next_eligible_at = now;
        self.snapshot()
    }

    /// Optimistic reset after a security switch. Failure count survives so
    /// a genuinely dead node is still pruned.
    pub fn reset(&mut self, now: Instant) -> HealthSnapshot {
        self.backoff = self.policy.floor;
        self.next_eligible_at = now;
        self.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One endpoint of one remote identity.
pub struct Node<K> {
    remote_id: K,
    endpoint: Endpoint,
    verify_certificates: bool,
    address_book_entry: Option<AddressBookEntry>,
    health: NodeHealth,
    channel: Option<Arc<dyn Channel>>,
    /// Insertion order within the topology; the last ranking tie-break.
    seq: u64,
}

impl<K> Node<K> {
    pub fn new(
        remote_id: K,
        endpoint: Endpoint,
        verify_certificates: bool,
        policy: BackoffPolicy,
        seq: u64,
        now: Instant,
    ) -> Self {
        Self {
            remote_id,
            endpoint,
            verify_certificates,
            address_book_entry: None,
            health: NodeHealth::new(policy, now),
            channel: None,
            seq,
        }
    }

    pub fn remote_id(&self) -> &K {
        &self.remote_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn verify_certificates(&self) -> bool {
        self.verify_certificates
    }

    pub fn address_book_entry(&self) -> Option<&AddressBookEntry> {
        self.address_book_entry.as_ref()
    }

    pub fn set_address_book_entry(&mut self, entry: Option<AddressBookEntry>) {
        self.address_book_entry = entry;
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn mark_failure(&mut self, now: Instant) -> HealthSnapshot {
        self.health.mark_failure(now)
    }

    pub fn mark_success(&mut self, now: Instant) -> HealthSnapshot {
        self.health.mark_success(now)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// The node's channel, opened on first use.
    pub fn channel(&mut self, transport: &dyn Transport) -> Result<Arc<dyn Channel>, Status> {
        if let Some(channel) = &self.channel {
            return Ok(Arc::clone(channel));
        }
        let options = ChannelOptions {
            tls: self.endpoint.is_transport_secure(),
            verify_certificates: self.verify_certificates,
            certificate_hash: self
                .address_book_entry
                .as_ref()
                .and_then(|entry| entry.certificate_hash.clone()),
        };
        let channel = transport.open_channel(&self.endpoint, &options)?;
        debug!(endpoint = %self.endpoint, tls = options.tls, "channel opened");
        self.channel = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Detaches the channel so it can be closed outside the topology lock.
    pub fn take_channel(&mut self) -> Option<Arc<dyn Channel>> {
        self.channel.take()
    }

    /// Re-targets the node at a different endpoint. The old channel is
    /// handed back for closing and health is reset.
    pub fn rebuild(
        &mut self,
        endpoint: Endpoint,
        verify_certificates: bool,
        now: Instant,
    ) -> Option<Arc<dyn Channel>> {
        self.endpoint = endpoint;
        self.verify_certificates = verify_certificates;
        self.health.reset(now);
        self.channel.take()
    }

    /// Ranking: soonest eligible first, then smallest backoff, then oldest.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.health(), other.health());
        a.next_eligible_at
            .cmp(&b.next_eligible_at)
            .then_with(|| a.backoff.cmp(&b.backoff))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for Node<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("remote_id", &self.remote_id)
            .field("endpoint", &self.endpoint)
            .field("health", &self.health.snapshot())
            .field("connected", &self.channel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(8), Duration::from_secs(60))
    }

    #[test]
    fn failure_grows_backoff_and_pushes_eligibility() {
        let now = Instant::now();
        let mut health = NodeHealth::new(policy(), now);
        let before = health.snapshot();

        let after = health.mark_failure(now);
        assert_eq!(after.backoff, Duration::from_secs(16));
        assert_eq!(after.consecutive_failures, 1);
        assert!(after.next_eligible_at > before.next_eligible_at);
        assert!(!after.is_eligible_at(now));
        assert_eq!(after.remaining(now), Duration::from_secs(16));
    }

    #[test]
    fn backoff_is_capped_and_eligibility_still_increases() {
        let now = Instant::now();
        let mut health = NodeHealth::new(policy(), now);
        let mut last = health.snapshot();
        for _ in 0..10 {
            let next = health.mark_failure(now);
            assert!(next.next_eligible_at > last.next_eligible_at);
            assert!(next.backoff <= Duration::from_secs(60));
            last = next;
        }
        assert_eq!(last.backoff, Duration::from_secs(60));
        assert_eq!(last.consecutive_failures, 10);
    }

    #[test]
    fn success_resets_to_floor() {
        let now = Instant::now();
        let mut health = NodeHealth::new(policy(), now);
        health.mark_failure(now);
        health.mark_failure(now);

        let later = now + Duration::from_secs(5);
        let snap = health.mark_success(later);
        assert_eq!(snap.backoff, Duration::from_secs(8));
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.next_eligible_at, later);
        assert!(snap.is_eligible_at(later));
    }

    #[test]
    fn ranking_prefers_eligible_then_small_backoff_then_insertion() {
        let now = Instant::now();
        let mk = |seq| {
            Node::new(
                seq,
                Endpoint::in_process(format!("n{seq}")),
                false,
                policy(),
                seq,
                now,
            )
        };
        let mut a = mk(0);
        let b = mk(1);
        assert_eq!(a.rank_cmp(&b), Ordering::Less);

        a.mark_failure(now);
        assert_eq!(a.rank_cmp(&b), Ordering::Greater);
    }

    #[test]
    fn rebuild_resets_health_and_detaches_channel() {
        let now = Instant::now();
        let mut node = Node::new(3u64, Endpoint::remote("h", 50211), false, policy(), 0, now);
        node.mark_failure(now);

        let old = node.rebuild(Endpoint::remote("h", 50212), true, now);
        assert!(old.is_none());
        assert_eq!(node.endpoint().port(), Some(50212));
        assert!(node.verify_certificates());
        assert!(node.health().is_eligible_at(now));
        assert_eq!(node.health().backoff, Duration::from_secs(8));
    }
}
