//! # Mirror Subscriptions
//!
//! Streams a topic from the mirror network, reassembles chunked messages,
//! and reconnects through transient failures without delivering a message
//! twice or skipping one.
//!
//! ```text
//!   open stream ──> item ──> ChunkBuffer ──> on_next
//!        ^            │
//!        │            └─ error ─ retryable? ─ no ──> on_error
//!        │                           │
//!        └──── backoff <──── yes ────┘
//!
//!   end of stream ──> on_complete
//! ```
//!
//! ## Resume
//!
//! Each stream item counts towards the query's limit, chunk or not. A
//! reconnect asks for `limit - received` items starting one nanosecond
//! after the last consensus timestamp seen. Chunks buffered before the
//! break stay buffered.
//!
//! The reconnect budget covers the whole subscription: the n-th reconnect
//! waits `min(500ms × 2^n, max_backoff)` however much arrived in between.
//! Each reconnect goes to the next eligible mirror, and a mirror whose
//! stream fails is benched like a failed consensus node.
//!
//! ## Cancellation
//!
//! Every callback runs under a per-subscription gate. `unsubscribe` closes
//! the gate, so once it returns no callback will start. Unsubscribing from
//! inside a callback is fine; the gate is re-entrant. The drive task sees
//! the cancel signal at its next suspension point and drops the stream or
//! the pending backoff timer.

pub mod chunks;
pub mod message;
pub mod query;

use std::cell::Cell;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::ReentrantMutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::MirrorCodec;
use crate::config::{stream_backoff, SUBSCRIBE_TOPIC_METHOD};
use crate::error::SubscriptionError;
use crate::network::{NodeLease, Topology};
use crate::transport::{Status, StatusCode};

pub use chunks::ChunkBuffer;
pub use message::{ChunkInfo, Timestamp, TopicMessage, TopicResponse};
pub use query::TopicQuery;

/// The default reconnect allow-list.
///
/// `NOT_FOUND` covers a topic subscribed to before the mirror has caught up
/// with its creation. `UNAVAILABLE` and `RESOURCE_EXHAUSTED` are a struggling
/// mirror. An `INTERNAL` stream reset is usually a proxy dropping us.
pub fn is_retryable_stream_error(status: &Status) -> bool {
    matches!(
        status.code,
        StatusCode::NotFound | StatusCode::Unavailable | StatusCode::ResourceExhausted
    ) || status.is_stream_reset()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type OnNext = Box<dyn FnMut(TopicMessage) + Send>;
type OnError = Box<dyn FnOnce(SubscriptionError) + Send>;
type OnComplete = Box<dyn FnOnce() + Send>;
type RetryWhen = Arc<dyn Fn(&Status) -> bool + Send + Sync>;

/// Callbacks for one subscription.
pub struct SubscriptionHandlers {
    on_next: OnNext,
    on_error: Option<OnError>,
    on_complete: Option<OnComplete>,
    retry_when: Option<RetryWhen>,
}

impl SubscriptionHandlers {
    pub fn new(on_next: impl FnMut(TopicMessage) + Send + 'static) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error: None,
            on_complete: None,
            retry_when: None,
        }
    }

    /// Called at most once, when the subscription fails for good. Without
    /// it, failures are logged.
    pub fn on_error(mut self, f: impl FnOnce(SubscriptionError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called at most once, when the mirror ends the stream cleanly or the
    /// limit is reached.
    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Replaces [`is_retryable_stream_error`].
    pub fn retry_when(mut self, f: impl Fn(&Status) -> bool + Send + Sync + 'static) -> Self {
        self.retry_when = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for SubscriptionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandlers")
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("retry_when", &self.retry_when.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// `true` once no further callback may run.
type Gate = ReentrantMutex<Cell<bool>>;

/// Cancels a subscription. Clones share the subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: Uuid,
    cancel: Arc<watch::Sender<bool>>,
    gate: Arc<Gate>,
}

impl SubscriptionHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                id: Uuid::new_v4(),
                cancel: Arc::new(tx),
                gate: Arc::new(ReentrantMutex::new(Cell::new(false))),
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stops the subscription. Idempotent. When this returns, no callback
    /// is running on another thread and none will start.
    pub fn unsubscribe(&self) {
        {
            let closed = self.gate.lock();
            closed.set(true);
        }
        self.cancel.send_replace(true);
    }

    /// Whether the subscription was cancelled or has finished.
    pub fn is_closed(&self) -> bool {
        self.gate.lock().get()
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolves once `unsubscribe` has been called. Never resolves if every
/// handle is gone, since then nobody can cancel.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// The drive task's side of the callbacks.
struct Sink {
    handlers: SubscriptionHandlers,
    gate: Arc<Gate>,
}

impl Sink {
    /// `false` if the subscription was closed and nothing was delivered.
    fn next(&mut self, message: TopicMessage) -> bool {
        let closed = self.gate.lock();
        if closed.get() {
            return false;
        }
        (self.handlers.on_next)(message);
        true
    }

    fn error(&mut self, topic: &str, err: SubscriptionError) {
        let closed = self.gate.lock();
        if closed.replace(true) {
            return;
        }
        match self.handlers.on_error.take() {
            Some(on_error) => on_error(err),
            None => error!(topic, error = %err, "subscription failed"),
        }
    }

    fn complete(&mut self, topic: &str) {
        let closed = self.gate.lock();
        if closed.replace(true) {
            return;
        }
        debug!(topic, "subscription complete");
        if let Some(on_complete) = self.handlers.on_complete.take() {
            on_complete();
        }
    }

    fn should_retry(&self, status: &Status) -> bool {
        match &self.handlers.retry_when {
            Some(retry_when) => retry_when(status),
            None => is_retryable_stream_error(status),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs topic subscriptions against a mirror topology.
pub struct SubscriptionEngine {
    mirror: Arc<Topology<String>>,
    codec: Arc<dyn MirrorCodec>,
    runtime: Handle,
    live: Arc<DashMap<Uuid, SubscriptionHandle>>,
}

enum StreamEnd {
    Cancelled,
    Completed,
    Failed(Status),
    Fatal(SubscriptionError),
}

impl SubscriptionEngine {
    pub fn new(
        mirror: Arc<Topology<String>>,
        codec: Arc<dyn MirrorCodec>,
        runtime: Handle,
    ) -> Self {
        Self {
            mirror,
            codec,
            runtime,
            live: Arc::new(DashMap::new()),
        }
    }

    /// Starts streaming `query`. Returns immediately; delivery happens on
    /// the runtime.
    pub fn subscribe(
        &self,
        query: TopicQuery,
        handlers: SubscriptionHandlers,
    ) -> SubscriptionHandle {
        let (handle, cancel) = SubscriptionHandle::new();
        self.live.insert(handle.id, handle.clone());

        let drive = Drive {
            mirror: Arc::clone(&self.mirror),
            codec: Arc::clone(&self.codec),
            topic: query.topic_id.to_string(),
            query,
            sink: Sink {
                handlers,
                gate: Arc::clone(&handle.gate),
            },
            cancel,
        };
        let live = Arc::clone(&self.live);
        let id = handle.id;
        self.runtime.spawn(async move {
            drive.run().await;
            live.remove(&id);
        });
        handle
    }

    /// Subscriptions that have not finished or been cancelled.
    pub fn active(&self) -> usize {
        self.live.len()
    }

    /// Cancels every live subscription.
    pub fn unsubscribe_all(&self) {
        let handles: Vec<SubscriptionHandle> =
            self.live.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle.unsubscribe();
        }
        self.live.clear();
    }
}

/// State of one subscription's drive task.
struct Drive {
    mirror: Arc<Topology<String>>,
    codec: Arc<dyn MirrorCodec>,
    topic: String,
    query: TopicQuery,
    sink: Sink,
    cancel: watch::Receiver<bool>,
}

impl Drive {
    async fn run(mut self) {
        let mut chunks = ChunkBuffer::new();
        let mut received: u64 = 0;
        let mut last: Option<Timestamp> = None;
        let mut attempt: u32 = 0;

        loop {
            let Some(query) = self.query.resume(last, received) else {
                self.sink.complete(&self.topic);
                return;
            };

            let end = self.stream(&query, &mut chunks, &mut received, &mut last).await;
            let status = match end {
                StreamEnd::Cancelled => {
                    debug!(topic = %self.topic, "subscription cancelled");
                    return;
                }
                StreamEnd::Completed => {
                    self.sink.complete(&self.topic);
                    return;
                }
                StreamEnd::Fatal(err) => {
                    self.sink.error(&self.topic, err);
                    return;
                }
                StreamEnd::Failed(status) => status,
            };

            if !self.sink.should_retry(&status) {
                self.sink.error(&self.topic, SubscriptionError::Terminal { status });
                return;
            }
            if attempt >= self.query.attempt_budget() {
                self.sink.error(
                    &self.topic,
                    SubscriptionError::RetriesExhausted {
                        status,
                        attempts: attempt,
                    },
                );
                return;
            }

            let delay = stream_backoff(attempt, self.query.backoff_ceiling());
            warn!(
                topic = %self.topic,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %status,
                "subscription stream failed; reconnecting"
            );
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => {
                    debug!(topic = %self.topic, "subscription cancelled during backoff");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// One stream lifetime against the next eligible mirror. A mirror that
    /// delivers is marked healthy; one that fails is benched.
    async fn stream(
        &mut self,
        query: &TopicQuery,
        chunks: &mut ChunkBuffer,
        received: &mut u64,
        last: &mut Option<Timestamp>,
    ) -> StreamEnd {
        let Some(lease) = self.mirror.next_node() else {
            return StreamEnd::Fatal(SubscriptionError::NoMirrorNodes);
        };
        let endpoint = lease.endpoint.clone();
        let before = *received;
        let end = self.stream_from(lease, query, chunks, received, last).await;
        if *received > before {
            self.mirror.mark_success(&endpoint);
        }
        if let StreamEnd::Failed(_) = &end {
            self.mirror.mark_failure(&endpoint).await;
        }
        end
    }

    async fn stream_from(
        &mut self,
        lease: NodeLease<String>,
        query: &TopicQuery,
        chunks: &mut ChunkBuffer,
        received: &mut u64,
        last: &mut Option<Timestamp>,
    ) -> StreamEnd {
        let channel = match lease.channel {
            Ok(channel) => channel,
            Err(status) => return StreamEnd::Failed(status),
        };
        let payload = match self.codec.encode_query(query) {
            Ok(payload) => payload,
            Err(e) => return StreamEnd::Fatal(SubscriptionError::Codec(e.to_string())),
        };
        debug!(
            topic = %self.topic,
            mirror = %lease.endpoint,
            limit = query.limit,
            start = ?query.start_time.map(|t| t.to_string()),
            "opening subscription stream"
        );

        let opened = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => return StreamEnd::Cancelled,
            opened = channel.server_streaming(SUBSCRIBE_TOPIC_METHOD, payload) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(status) => return StreamEnd::Failed(status),
        };

        loop {
            let item = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return StreamEnd::Cancelled,
                item = stream.next() => item,
            };
            let bytes = match item {
                None => return StreamEnd::Completed,
                Some(Err(status)) => return StreamEnd::Failed(status),
                Some(Ok(bytes)) => bytes,
            };
            let response = match self.codec.decode_response(&bytes) {
                Ok(response) => response,
                Err(e) => return StreamEnd::Fatal(SubscriptionError::Codec(e.to_string())),
            };

            *received += 1;
            *last = Some(response.consensus_timestamp);

            if let Some(message) = chunks.accept(response) {
                if !self.sink.next(message) {
                    return StreamEnd::Cancelled;
                }
            }
            if self.query.limit > 0 && *received >= self.query.limit {
                return StreamEnd::Completed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allow_list() {
        assert!(is_retryable_stream_error(&Status::new(StatusCode::NotFound, "")));
        assert!(is_retryable_stream_error(&Status::unavailable("")));
        assert!(is_retryable_stream_error(&Status::new(StatusCode::ResourceExhausted, "")));
        assert!(is_retryable_stream_error(&Status::internal("RST_STREAM")));
        assert!(!is_retryable_stream_error(&Status::internal("boom")));
        assert!(!is_retryable_stream_error(&Status::new(StatusCode::InvalidArgument, "")));
        assert!(!is_retryable_stream_error(&Status::deadline_exceeded("")));
    }

    #[test]
    fn unsubscribe_is_idempotent_and_closes_the_gate() {
        let (handle, mut rx) = SubscriptionHandle::new();
        assert!(!handle.is_closed());
        handle.unsubscribe();
        handle.unsubscribe();
        assert!(handle.is_closed());
        assert!(*rx.borrow_and_update());
    }

    #[test]
    fn closed_sink_drops_messages_and_reports_nothing() {
        let (handle, _rx) = SubscriptionHandle::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let errors = Arc::new(parking_lot::Mutex::new(0));
        let mut sink = Sink {
            handlers: {
                let seen = Arc::clone(&seen);
                let errors = Arc::clone(&errors);
                SubscriptionHandlers::new(move |m| seen.lock().push(m.sequence_number))
                    .on_error(move |_| *errors.lock() += 1)
            },
            gate: Arc::clone(&handle.gate),
        };
        let message = TopicMessage::single(TopicResponse {
            consensus_timestamp: Timestamp::new(1, 0),
            sequence_number: 1,
            running_hash: bytes::Bytes::new(),
            contents: bytes::Bytes::new(),
            chunk: None,
        });
        assert!(sink.next(message.clone()));
        handle.unsubscribe();
        assert!(!sink.next(message));
        sink.error("0.0.1", SubscriptionError::NoMirrorNodes);
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(*errors.lock(), 0);
    }

    #[test]
    fn terminal_callbacks_fire_once() {
        let (handle, _rx) = SubscriptionHandle::new();
        let completions = Arc::new(parking_lot::Mutex::new(0));
        let mut sink = Sink {
            handlers: {
                let completions = Arc::clone(&completions);
                SubscriptionHandlers::new(|_| {}).on_complete(move || *completions.lock() += 1)
            },
            gate: Arc::clone(&handle.gate),
        };
        sink.complete("0.0.1");
        sink.complete("0.0.1");
        sink.error("0.0.1", SubscriptionError::NoMirrorNodes);
        assert_eq!(*completions.lock(), 1);
        assert!(handle.is_closed());
    }
}
