//! # Client Façade
//!
//! [`Client`] owns one consensus topology, one mirror topology, the request
//! executor, and the subscription engine, and exposes the handful of calls
//! an application actually makes. It is cheap to clone; clones share
//! everything.
//!
//! ```text
//!   Client ──┬── RequestExecutor ──> Topology<AccountId> ──> Transport
//!            │        └── AddressBookRefresher (optional)
//!            └── SubscriptionEngine ──> Topology<String> ──> Transport
//! ```
//!
//! ## Runtime
//!
//! Built inside a tokio runtime, the client spawns onto that runtime.
//! Built outside one, it starts and owns a multi-threaded runtime, which is
//! what `execute_blocking` and the subscription tasks run on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tracing::{debug, info};

use crate::codec::{JsonCodec, MirrorCodec};
use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, Result};
use crate::execution::{Executed, Request, RequestExecutor, RetryPolicy};
use crate::id::AccountId;
use crate::network::{
    AddressBook, AddressBookRefresher, AddressBookSource, BackoffPolicy, LedgerId, NetworkChange,
    Topology, TopologyOptions,
};
use crate::subscription::{SubscriptionEngine, SubscriptionHandle, SubscriptionHandlers, TopicQuery};
use crate::transport::{LocalTransport, Transport};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    ledger: Option<LedgerId>,
    transport: Option<Arc<dyn Transport>>,
    address_book_source: Option<Arc<dyn AddressBookSource>>,
    mirror_codec: Option<Arc<dyn MirrorCodec>>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            ledger: None,
            transport: None,
            address_book_source: None,
            mirror_codec: None,
        }
    }

    /// Names the ledger. If the config has no network, the bundled address
    /// book for this ledger seeds it.
    pub fn ledger(mut self, ledger: LedgerId) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Defaults to an empty [`LocalTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Enables refresh on stale node identities.
    pub fn address_book_source(mut self, source: Arc<dyn AddressBookSource>) -> Self {
        self.address_book_source = Some(source);
        self
    }

    /// Defaults to [`JsonCodec`].
    pub fn mirror_codec(mut self, codec: Arc<dyn MirrorCodec>) -> Self {
        self.mirror_codec = Some(codec);
        self
    }

    pub fn build(self) -> Result<Client> {
        let config = self.config;
        config.validate()?;

        let (handle, runtime) = match Handle::try_current() {
            Ok(handle) => (handle, None),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .thread_name("ledger-client")
                    .enable_all()
                    .build()
                    .map_err(|e| ClientError::Config(format!("failed to start runtime: {e}")))?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalTransport::new()) as Arc<dyn Transport>);
        let options = TopologyOptions {
            node_backoff: BackoffPolicy::new(config.min_node_backoff(), config.max_node_backoff()),
            transport_security: config.transport_security,
            verify_certificates: config.verify_certificates,
            max_nodes_per_request: config.max_nodes_per_request,
            max_node_failures: config.max_node_failures,
            close_timeout: config.close_timeout(),
        };

        let consensus = Arc::new(Topology::new(Arc::clone(&transport), options.clone()));
        consensus.set_ledger_id(self.ledger);
        if config.network.is_empty() {
            if let Some(book) = self.ledger.and_then(AddressBook::bundled) {
                consensus.set_address_book(&book);
                consensus.replace_network(book.to_network());
            }
        } else {
            consensus.replace_network(config.network.clone());
        }

        let mirror = Arc::new(Topology::new(
            Arc::clone(&transport),
            TopologyOptions {
                transport_security: false,
                max_node_failures: None,
                ..options
            },
        ));
        mirror.set_ledger_id(self.ledger);
        mirror.replace_network(mirror_entries(&config.mirror_network)?);

        let mut executor =
            RequestExecutor::new(Arc::clone(&consensus), RetryPolicy::from_config(&config));
        let refresher = self.address_book_source.map(|source| {
            Arc::new(AddressBookRefresher::new(source, Arc::clone(&consensus)))
        });
        if let Some(refresher) = &refresher {
            executor = executor.with_refresher(Arc::clone(refresher));
        }

        let codec = self
            .mirror_codec
            .unwrap_or_else(|| Arc::new(JsonCodec) as Arc<dyn MirrorCodec>);
        let subscriptions = SubscriptionEngine::new(Arc::clone(&mirror), codec, handle.clone());

        info!(
            ledger = ?self.ledger.map(|l| l.as_str()),
            nodes = consensus.len(),
            mirrors = mirror.len(),
            secure = config.transport_security,
            "client ready"
        );

        Ok(Client {
            inner: Arc::new(Inner {
                config,
                consensus,
                mirror,
                executor,
                subscriptions,
                refresher,
                handle,
                runtime,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

fn mirror_entries(mirrors: &[String]) -> Result<Vec<(Endpoint, String)>> {
    mirrors
        .iter()
        .map(|raw| {
            let endpoint: Endpoint = raw.parse()?;
            let key = endpoint.to_string();
            Ok((endpoint, key))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Inner {
    config: ClientConfig,
    consensus: Arc<Topology<AccountId>>,
    mirror: Arc<Topology<String>>,
    executor: RequestExecutor,
    subscriptions: SubscriptionEngine,
    refresher: Option<Arc<AddressBookRefresher>>,
    handle: Handle,
    /// Present when the client started its own runtime.
    runtime: Option<Runtime>,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The last clone may be dropped on one of the runtime's own workers,
        // where a blocking shutdown would panic.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Entry point for executing requests and subscribing to topics.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// A client for `ledger` seeded from its bundled address book.
    pub fn for_ledger(ledger: LedgerId) -> Result<Self> {
        ClientBuilder::new(ClientConfig::default()).ledger(ledger).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn ledger_id(&self) -> Option<LedgerId> {
        self.inner.consensus.ledger_id()
    }

    pub fn consensus(&self) -> &Arc<Topology<AccountId>> {
        &self.inner.consensus
    }

    pub fn mirror(&self) -> &Arc<Topology<String>> {
        &self.inner.mirror
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    // -- Execution ------------------------------------------------------------

    /// Runs `request` through the retry state machine.
    pub async fn execute<R: Request>(&self, request: &R) -> Result<Executed<R::Output>> {
        self.ensure_open()?;
        self.inner.executor.execute(request).await
    }

    /// Blocking form of [`Client::execute`]. Same state machine; the calling
    /// thread waits for it.
    ///
    /// On a multi-threaded runtime's worker the wait is moved off the
    /// worker first. A current-thread runtime cannot give its only thread
    /// away, so there this fails with [`ClientError::BlockingOnRuntime`].
    pub fn execute_blocking<R: Request>(&self, request: &R) -> Result<Executed<R::Output>> {
        match Handle::try_current().map(|current| current.runtime_flavor()) {
            Err(_) => self.inner.handle.block_on(self.execute(request)),
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| {
                self.inner.handle.block_on(self.execute(request))
            }),
            Ok(_) => Err(ClientError::BlockingOnRuntime),
        }
    }

    // -- Subscriptions --------------------------------------------------------

    /// Streams `query`. Retry settings the query leaves unset come from
    /// the client config.
    pub fn subscribe(
        &self,
        query: TopicQuery,
        handlers: SubscriptionHandlers,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        let config = &self.inner.config;
        let query = query.or_defaults(config.stream_max_attempts, config.stream_max_backoff());
        Ok(self.inner.subscriptions.subscribe(query, handlers))
    }

    /// Live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.active()
    }

    // -- Topology -------------------------------------------------------------

    /// Replaces the consensus node set.
    pub async fn set_network<I>(&self, network: I) -> Result<NetworkChange>
    where
        I: IntoIterator<Item = (Endpoint, AccountId)>,
    {
        self.ensure_open()?;
        Ok(self.inner.consensus.set_network(network).await)
    }

    /// Replaces the mirror node set.
    pub async fn set_mirror_network(&self, mirrors: &[String]) -> Result<NetworkChange> {
        self.ensure_open()?;
        let entries = mirror_entries(mirrors)?;
        Ok(self.inner.mirror.set_network(entries).await)
    }

    /// Switches consensus traffic between plaintext and TLS ports.
    pub async fn set_transport_security(&self, secure: bool) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.inner.consensus.set_transport_security(secure).await)
    }

    pub async fn set_verify_certificates(&self, verify: bool) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.inner.consensus.set_verify_certificates(verify).await)
    }

    pub fn set_address_book(&self, book: &AddressBook) {
        self.inner.consensus.set_address_book(book);
    }

    pub fn set_max_nodes_per_request(&self, count: Option<usize>) {
        self.inner.consensus.set_max_nodes_per_request(count);
    }

    pub fn network(&self) -> HashMap<Endpoint, AccountId> {
        self.inner.consensus.network()
    }

    pub fn mirror_network(&self) -> Vec<String> {
        let mut mirrors: Vec<String> = self.inner.mirror.network().into_values().collect();
        mirrors.sort();
        mirrors
    }

    /// Fetches and applies the address book now.
    pub async fn refresh_address_book(&self) -> Result<NetworkChange> {
        self.ensure_open()?;
        let refresher = self
            .inner
            .refresher
            .as_ref()
            .ok_or_else(|| ClientError::Config("no address book source configured".into()))?;
        refresher.refresh().await
    }

    // -- Teardown -------------------------------------------------------------

    /// Cancels every subscription and closes every channel. Later calls
    /// fail with [`ClientError::Closed`]. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions = self.inner.subscriptions.active();
        self.inner.subscriptions.unsubscribe_all();
        self.inner.consensus.close().await;
        self.inner.mirror.close().await;
        debug!(subscriptions, owns_runtime = self.inner.runtime.is_some(), "client closed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("ledger", &self.ledger_id())
            .field("nodes", &self.inner.consensus.len())
            .field("mirrors", &self.inner.mirror.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
