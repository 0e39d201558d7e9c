//! Out-of-band address-book refresh.
//!
//! When a node answers for an account other than the one we addressed, the
//! address book is stale. The executor fires [`AddressBookRefresher::trigger`]
//! and moves on to the next candidate; the refresh runs on its own task.
//! Concurrent triggers collapse into one fetch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::id::AccountId;
use crate::network::address_book::AddressBookSource;
use crate::network::topology::{NetworkChange, Topology};

pub struct AddressBookRefresher {
    source: Arc<dyn AddressBookSource>,
    topology: Arc<Topology<AccountId>>,
    in_flight: AtomicBool,
}

impl AddressBookRefresher {
    pub fn new(source: Arc<dyn AddressBookSource>, topology: Arc<Topology<AccountId>>) -> Self {
        Self {
            source,
            topology,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Starts a background refresh. Returns `false` if one is already running.
    /// Must be called from within a tokio runtime.
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }
        let guard = InFlight(Arc::clone(self));
        tokio::spawn(async move {
            match guard.0.refresh().await {
                Ok(change) => debug!(
                    added = change.added,
                    removed = change.removed,
                    "address book refreshed"
                ),
                Err(e) => warn!(error = %e, "address book refresh failed"),
            }
        });
        true
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fetches the book and applies it: node set first, then metadata.
    /// An empty book is refused rather than wiping the topology.
    pub async fn refresh(&self) -> Result<NetworkChange> {
        let book = self.source.fetch().await?;
        if book.is_empty() {
            return Err(ClientError::AddressBook("fetched address book is empty".into()));
        }
        let change = self.topology.set_network(book.to_network()).await;
        self.topology.set_address_book(&book);
        Ok(change)
    }
}

/// Clears the in-flight flag when the refresh task ends, panics included.
struct InFlight(Arc<AddressBookRefresher>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::network::address_book::{AddressBook, AddressBookEntry, StaticAddressBook};
    use crate::network::topology::TopologyOptions;
    use crate::transport::LocalTransport;

    fn topology() -> Arc<Topology<AccountId>> {
        Arc::new(Topology::new(
            Arc::new(LocalTransport::new()),
            TopologyOptions::default(),
        ))
    }

    #[tokio::test]
    async fn refresh_replaces_network_and_metadata() {
        let topology = topology();
        topology
            .set_network(vec![(Endpoint::remote("old", 50211), AccountId::from_num(3))])
            .await;

        let book = AddressBook::new(vec![AddressBookEntry::new(
            AccountId::from_num(7),
            vec![Endpoint::remote("new", 50211)],
        )
        .with_certificate_hash("beef")]);
        let refresher =
            AddressBookRefresher::new(Arc::new(StaticAddressBook(book)), Arc::clone(&topology));

        let change = refresher.refresh().await.unwrap();
        assert_eq!(change.added, 1);
        assert_eq!(change.removed, 1);
        assert!(topology.contains(&AccountId::from_num(7)));
        assert!(topology.address_book_entry(&AccountId::from_num(7)).is_some());
    }

    #[tokio::test]
    async fn empty_book_is_refused() {
        let topology = topology();
        topology
            .set_network(vec![(Endpoint::remote("old", 50211), AccountId::from_num(3))])
            .await;
        let refresher = AddressBookRefresher::new(
            Arc::new(StaticAddressBook(AddressBook::default())),
            Arc::clone(&topology),
        );
        assert!(refresher.refresh().await.is_err());
        assert_eq!(topology.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_coalesce() {
        let topology = topology();
        let book = AddressBook::new(vec![AddressBookEntry::new(
            AccountId::from_num(3),
            vec![Endpoint::remote("n", 50211)],
        )]);
        let refresher = Arc::new(AddressBookRefresher::new(
            Arc::new(StaticAddressBook(book)),
            Arc::clone(&topology),
        ));

        assert!(refresher.trigger());
        assert!(!refresher.trigger());
        while refresher.is_refreshing() {
            tokio::task::yield_now().await;
        }
        assert!(topology.contains(&AccountId::from_num(3)));
        assert!(refresher.trigger());
    }

    struct BrokenSource;

    #[async_trait::async_trait]
    impl AddressBookSource for BrokenSource {
        async fn fetch(&self) -> Result<AddressBook> {
            panic!("source blew up");
        }
    }

    #[tokio::test]
    async fn panicking_refresh_does_not_block_later_ones() {
        let refresher = Arc::new(AddressBookRefresher::new(Arc::new(BrokenSource), topology()));

        assert!(refresher.trigger());
        while refresher.is_refreshing() {
            tokio::task::yield_now().await;
        }
        assert!(refresher.trigger());
    }
}
