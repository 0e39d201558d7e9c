//! The retry state machine for one logical request.
//!
//! [`PendingRequest`] holds the per-request state: the candidate list fixed
//! at request start, a cursor into it, the attempt count, and which nodes
//! have been visited. [`PendingRequest::next_step`] is the transition
//! function. It looks at an [`Outcome`] and decides, without side effects,
//! whether the request is done, failed, or should be retried and how.
//! The executor carries out the decision.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::{
    request_backoff, ClientConfig, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF, DEFAULT_REQUEST_TIMEOUT,
};
use crate::error::ClientError;
use crate::execution::outcome::Outcome;
use crate::network::RemoteId;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Budgets and delays for request execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts across all nodes.
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Distinct nodes one request may visit. `None` means no limit.
    pub max_node_visits: Option<usize>,
    pub attempt_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_node_visits: None,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            min_backoff: config.min_backoff(),
            max_backoff: config.max_backoff(),
            max_node_visits: config.max_node_visits,
            attempt_timeout: config.attempt_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Delay after attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        request_backoff(attempt, self.min_backoff, self.max_backoff)
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// How to carry out a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPlan {
    pub delay: Duration,
    /// Move to the next candidate.
    pub advance: bool,
    /// Bench the node that just failed.
    pub penalize: bool,
    pub refresh_address_book: bool,
}

/// The transition chosen for an outcome.
#[derive(Debug)]
pub enum Step {
    Complete,
    Retry(RetryPlan, ClientError),
    Fail(ClientError),
}

// ---------------------------------------------------------------------------
// PendingRequest
// ---------------------------------------------------------------------------

/// Per-request execution state.
#[derive(Debug)]
pub struct PendingRequest<K> {
    candidates: Vec<K>,
    cursor: usize,
    attempt: u32,
    visited: HashSet<K>,
    last_error: Option<ClientError>,
}

impl<K: RemoteId> PendingRequest<K> {
    pub fn new(candidates: Vec<K>) -> Self {
        Self {
            candidates,
            cursor: 0,
            attempt: 0,
            visited: HashSet::new(),
            last_error: None,
        }
    }

    pub fn candidates(&self) -> &[K] {
        &self.candidates
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn nodes_visited(&self) -> usize {
        self.visited.len()
    }

    pub fn current(&self) -> Option<&K> {
        self.candidates.get(self.cursor)
    }

    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    /// Points the cursor at `index`, e.g. to skip a benched candidate.
    pub fn focus(&mut self, index: usize) {
        if index < self.candidates.len() {
            self.cursor = index;
        }
    }

    /// Swaps in a freshly ranked candidate list after a wrap.
    pub fn replace_candidates(&mut self, candidates: Vec<K>) {
        self.candidates = candidates;
        self.cursor = 0;
    }

    /// Starts an attempt against the current candidate. Fails with
    /// `ExhaustedRetries` if either budget is already spent.
    pub fn begin_attempt(
        &mut self,
        max_attempts: u32,
        max_node_visits: Option<usize>,
    ) -> Result<K, ClientError> {
        let node = self.current().cloned().ok_or(ClientError::EmptyTopology)?;
        let fresh_node = !self.visited.contains(&node);
        let visits_spent = max_node_visits.is_some_and(|max| self.visited.len() >= max);
        if self.attempt >= max_attempts || (fresh_node && visits_spent) {
            return Err(self.exhausted(self.last_error.clone()));
        }
        self.attempt += 1;
        self.visited.insert(node.clone());
        Ok(node)
    }

    /// Decides what `outcome` means for this request. Pure.
    pub fn next_step(&self, outcome: &Outcome, policy: &RetryPolicy) -> Step {
        let node = self
            .current()
            .map(ToString::to_string)
            .unwrap_or_default();
        let attempt = self.attempt;

        let error = match outcome {
            Outcome::Success => return Step::Complete,
            Outcome::TerminalRejection { status } => {
                return Step::Fail(ClientError::Rejected {
                    status: *status,
                    node,
                    attempt,
                })
            }
            Outcome::TransportFailure { status, retryable } => {
                let error = ClientError::Transport {
                    status: status.clone(),
                    node,
                    attempt,
                };
                if !retryable {
                    return Step::Fail(error);
                }
                error
            }
            Outcome::TransientRejection { status, .. } => ClientError::TransientRejection {
                status: *status,
                node,
                attempt,
            },
            Outcome::StaleNodeIdentity { status } => ClientError::StaleNodeIdentity {
                status: *status,
                node,
                attempt,
            },
        };

        if attempt >= policy.max_attempts {
            return Step::Fail(self.exhausted(Some(error)));
        }

        let mut plan = match outcome {
            Outcome::TransientRejection {
                retry_same_node: true,
                ..
            } => RetryPlan {
                delay: policy.backoff(attempt),
                advance: false,
                penalize: false,
                refresh_address_book: false,
            },
            Outcome::TransientRejection { .. } => RetryPlan {
                delay: Duration::ZERO,
                advance: true,
                penalize: false,
                refresh_address_book: false,
            },
            Outcome::StaleNodeIdentity { .. } => RetryPlan {
                delay: Duration::ZERO,
                advance: true,
                penalize: true,
                refresh_address_book: true,
            },
            _ => RetryPlan {
                delay: Duration::ZERO,
                advance: true,
                penalize: true,
                refresh_address_book: false,
            },
        };

        // Every candidate has had its turn: pause before going round again.
        if plan.advance && self.cursor + 1 >= self.candidates.len() {
            plan.delay = plan.delay.max(policy.backoff(attempt));
        }
        Step::Retry(plan, error)
    }

    /// Records a retry. Returns `true` if the cursor wrapped.
    pub fn apply(&mut self, plan: &RetryPlan, error: ClientError) -> bool {
        self.last_error = Some(error);
        if !plan.advance {
            return false;
        }
        self.cursor += 1;
        if self.cursor >= self.candidates.len() {
            self.cursor = 0;
            return true;
        }
        false
    }

    fn exhausted(&self, last_error: Option<ClientError>) -> ClientError {
        ClientError::ExhaustedRetries {
            attempts: self.attempt,
            nodes_visited: self.visited.len(),
            last_error: last_error.map(Box::new),
        }
    }
}
