//! # Address Book
//!
//! The network's own record of who its consensus nodes are: account id,
//! endpoints, and the SHA-384 hash of each node's TLS certificate. The
//! client loads a bundled copy at startup and refreshes it from a live
//! source whenever a node turns out to be answering for a different account
//! than we thought.
//!
//! The persisted form here is JSON. Production sources decode whatever the
//! network actually serves and hand us an [`AddressBook`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};

use crate::config::{CONSENSUS_PLAINTEXT_PORT, CONSENSUS_TLS_PORT};
use crate::endpoint::Endpoint;
use crate::error::{ClientError, Result};
use crate::id::AccountId;

const LOCAL_ADDRESS_BOOK: &str = include_str!("../../address_books/local.json");

// ---------------------------------------------------------------------------
// LedgerId
// ---------------------------------------------------------------------------

/// Which ledger a topology talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerId {
    Mainnet,
    Testnet,
    Previewnet,
    Local,
}

impl LedgerId {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerId::Mainnet => "mainnet",
            LedgerId::Testnet => "testnet",
            LedgerId::Previewnet => "previewnet",
            LedgerId::Local => "local",
        }
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerId {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(LedgerId::Mainnet),
            "testnet" => Ok(LedgerId::Testnet),
            "previewnet" => Ok(LedgerId::Previewnet),
            "local" => Ok(LedgerId::Local),
            other => Err(ClientError::Config(format!("unknown ledger `{other}`"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Hex SHA-384 of a certificate as it appears in the address book.
pub fn certificate_hash(certificate: &[u8]) -> String {
    hex::encode(Sha384::digest(certificate))
}

/// What the network says about one consensus node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBookEntry {
    #[serde(rename = "node_account_id")]
    pub remote_id: AccountId,
    pub endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_hash: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl AddressBookEntry {
    pub fn new(remote_id: AccountId, endpoints: Vec<Endpoint>) -> Self {
        Self {
            remote_id,
            endpoints,
            certificate_hash: None,
            description: String::new(),
        }
    }

    pub fn with_certificate_hash(mut self, hash: impl Into<String>) -> Self {
        self.certificate_hash = Some(hash.into());
        self
    }

    pub fn has_certificate_hash(&self) -> bool {
        self.certificate_hash.as_deref().is_some_and(|h| !h.is_empty())
    }

    /// Fills a missing certificate hash from the entry this one replaces.
    /// A freshly fetched book may leave the hash out even though we knew it.
    pub fn inherit_certificate_hash(&mut self, previous: &AddressBookEntry) {
        if !self.has_certificate_hash() && previous.has_certificate_hash() {
            self.certificate_hash = previous.certificate_hash.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// AddressBook
// ---------------------------------------------------------------------------

/// A set of [`AddressBookEntry`] records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBook {
    pub nodes: Vec<AddressBookEntry>,
}

impl AddressBook {
    pub fn new(nodes: Vec<AddressBookEntry>) -> Self {
        Self { nodes }
    }

    /// The book shipped with the crate for `ledger`, if there is one.
    /// Public ledgers rotate nodes too often to bundle; load those with
    /// [`AddressBook::load`] or fetch them live.
    pub fn bundled(ledger: LedgerId) -> Option<Self> {
        match ledger {
            LedgerId::Local => Self::from_json(LOCAL_ADDRESS_BOOK).ok(),
            _ => None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ClientError::AddressBook(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ClientError::AddressBook(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClientError::AddressBook(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn get(&self, remote_id: &AccountId) -> Option<&AddressBookEntry> {
        self.nodes.iter().find(|entry| entry.remote_id == *remote_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The endpoint map to feed `set_network`.
    ///
    /// Only consensus ports are used when a node advertises any; they are
    /// normalized to plaintext because the topology applies its own security
    /// mode. A node with only custom ports contributes all of them.
    pub fn to_network(&self) -> BTreeMap<Endpoint, AccountId> {
        let mut network = BTreeMap::new();
        for entry in &self.nodes {
            let consensus: Vec<&Endpoint> = entry
                .endpoints
                .iter()
                .filter(|e| {
                    matches!(e.port(), Some(CONSENSUS_PLAINTEXT_PORT) | Some(CONSENSUS_TLS_PORT))
                })
                .collect();
            if consensus.is_empty() {
                for endpoint in &entry.endpoints {
                    network.insert(endpoint.clone(), entry.remote_id);
                }
            } else {
                for endpoint in consensus {
                    network.insert(endpoint.to_insecure(), entry.remote_id);
                }
            }
        }
        network
    }
}

// ---------------------------------------------------------------------------
// Live source
// ---------------------------------------------------------------------------

/// Somewhere a current address book can be fetched from.
#[async_trait]
pub trait AddressBookSource: Send + Sync {
    async fn fetch(&self) -> Result<AddressBook>;
}

/// A source that always returns the same book. Handy for tests and for
/// pinning a network that never changes.
#[derive(Debug, Clone)]
pub struct StaticAddressBook(pub AddressBook);

#[async_trait]
impl AddressBookSource for StaticAddressBook {
    async fn fetch(&self) -> Result<AddressBook> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(num: u64, endpoints: &[&str]) -> AddressBookEntry {
        AddressBookEntry::new(
            AccountId::from_num(num),
            endpoints.iter().map(|e| e.parse().unwrap()).collect(),
        )
    }

    #[test]
    fn bundled_local_book_parses() {
        let book = AddressBook::bundled(LedgerId::Local).unwrap();
        assert_eq!(book.len(), 1);
        let node = book.get(&AccountId::from_num(3)).unwrap();
        assert_eq!(node.endpoints[0].to_string(), "127.0.0.1:50211");
        assert!(AddressBook::bundled(LedgerId::Mainnet).is_none());
    }

    #[test]
    fn to_network_prefers_consensus_ports() {
        let book = AddressBook::new(vec![
            entry(3, &["10.0.0.3:50211", "10.0.0.3:50212", "10.0.0.3:9000"]),
            entry(4, &["10.0.0.4:7000"]),
        ]);
        let network = book.to_network();
        assert_eq!(network.len(), 2);
        assert_eq!(
            network.get(&"10.0.0.3:50211".parse().unwrap()),
            Some(&AccountId::from_num(3))
        );
        assert_eq!(
            network.get(&"10.0.0.4:7000".parse().unwrap()),
            Some(&AccountId::from_num(4))
        );
    }

    #[test]
    fn missing_hash_is_inherited() {
        let previous = entry(3, &["10.0.0.3:50211"]).with_certificate_hash("abcd");
        let mut fresh = entry(3, &["10.0.0.3:50211"]).with_certificate_hash("");
        fresh.inherit_certificate_hash(&previous);
        assert_eq!(fresh.certificate_hash.as_deref(), Some("abcd"));

        let mut replaced = entry(3, &["10.0.0.3:50211"]).with_certificate_hash("ef01");
        replaced.inherit_certificate_hash(&previous);
        assert_eq!(replaced.certificate_hash.as_deref(), Some("ef01"));
    }

    #[test]
    fn certificate_hash_is_hex_sha384() {
        let cert = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        let hash = certificate_hash(cert);
        assert_eq!(hash.len(), 96);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash, certificate_hash(b"something else"));
    }

    #[test]
    fn json_round_trip_keeps_entries() {
        let book = AddressBook::new(vec![entry(5, &["in-process:node-5"])]);
        let json = book.to_json().unwrap();
        assert!(json.contains("node_account_id"));
        assert_eq!(AddressBook::from_json(&json).unwrap(), book);
    }

    #[test]
    fn ledger_ids_parse_case_insensitively() {
        assert_eq!("TestNet".parse::<LedgerId>().unwrap(), LedgerId::Testnet);
        assert!("moonnet".parse::<LedgerId>().is_err());
    }

    #[tokio::test]
    async fn static_source_returns_its_book() {
        let book = AddressBook::new(vec![entry(3, &["127.0.0.1:50211"])]);
        let source = StaticAddressBook(book.clone());
        assert_eq!(source.fetch().await.unwrap(), book);
    }
}
