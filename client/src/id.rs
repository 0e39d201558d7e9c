//! # Entity Identifiers
//!
//! Accounts, topics, and nodes on the ledger are all addressed by the same
//! three-part `shard.realm.num` triple. A consensus node's "remote identity"
//! is the account it is paid through, which is why the topology is keyed by
//! [`AccountId`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ClientError;

/// A `shard.realm.num` entity identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub shard: u64,
    pub realm: u64,
    pub num: u64,
}

/// The account a consensus node is reachable through.
pub type AccountId = EntityId;

/// A consensus topic.
pub type TopicId = EntityId;

impl EntityId {
    /// Shorthand for shard 0, realm 0. Nearly every id in practice.
    pub const fn from_num(num: u64) -> Self {
        Self {
            shard: 0,
            realm: 0,
            num,
        }
    }

    pub const fn new(shard: u64, realm: u64, num: u64) -> Self {
        Self { shard, realm, num }
    }

    /// Big-endian bytes of the triple. Used when framing a body for a node.
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..8].copy_from_slice(&self.shard.to_be_bytes());
        out[8..16].copy_from_slice(&self.realm.to_be_bytes());
        out[16..].copy_from_slice(&self.num.to_be_bytes());
        out
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.shard, self.realm, self.num)
    }
}

impl FromStr for EntityId {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidEntityId(s.to_string());
        let mut parts = s.split('.');
        let (Some(shard), Some(realm), Some(num), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        Ok(Self {
            shard: shard.parse().map_err(|_| invalid())?,
            realm: realm.parse().map_err(|_| invalid())?,
            num: num.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let id: EntityId = "0.0.3".parse().unwrap();
        assert_eq!(id, EntityId::from_num(3));
        assert_eq!(id.to_string(), "0.0.3");

        let id: EntityId = "1.2.1001".parse().unwrap();
        assert_eq!(id, EntityId::new(1, 2, 1001));
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in ["", "3", "0.0", "0.0.3.4", "a.b.c", "0.0.-1"] {
            assert!(bad.parse::<EntityId>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn serde_uses_dotted_form() {
        let id = EntityId::from_num(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0.0.7\"");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
