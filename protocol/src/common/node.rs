//! # Node Descriptors
//!
//! The registry's view of a node: identity, where to reach it and what it
//! does. The storage client only ever holds read-only copies, looked up by
//! the public key the scheduler puts into a committee.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::address::{Address, ConsensusAddress};
use crate::crypto::PublicKey;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Bitmask of the roles a node is registered for.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolesMask(u32);

impl RolesMask {
    pub const COMPUTE_WORKER: RolesMask = RolesMask(1 << 0);
    pub const STORAGE_WORKER: RolesMask = RolesMask(1 << 1);
    pub const KEY_MANAGER: RolesMask = RolesMask(1 << 2);
    pub const VALIDATOR: RolesMask = RolesMask(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Returns `true` iff every role in `roles` is set.
    pub const fn contains(&self, roles: RolesMask) -> bool {
        self.0 & roles.0 == roles.0
    }

    pub const fn union(self, other: RolesMask) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for RolesMask {
    type Output = RolesMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl fmt::Debug for RolesMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::COMPUTE_WORKER, "compute"),
            (Self::STORAGE_WORKER, "storage"),
            (Self::KEY_MANAGER, "key-manager"),
            (Self::VALIDATOR, "validator"),
        ]
        .iter()
        .filter(|(role, _)| self.contains(*role))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "RolesMask({})", names.join(","))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A registered node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identity. Receipts from this node are signed with this key.
    pub id: PublicKey,
    /// Entity that controls the node.
    pub entity_id: PublicKey,
    /// Epoch after which the registration lapses.
    pub expiration: u64,
    /// Storage/committee endpoints.
    pub addresses: Vec<Address>,
    /// Consensus peer endpoints.
    pub consensus_addresses: Vec<ConsensusAddress>,
    pub roles: RolesMask,
}

impl Node {
    /// A storage worker reachable at `addresses`, controlled by itself.
    pub fn storage_worker(id: PublicKey, addresses: Vec<Address>) -> Self {
        Self {
            id,
            entity_id: id,
            expiration: u64::MAX,
            addresses,
            consensus_addresses: Vec::new(),
            roles: RolesMask::STORAGE_WORKER,
        }
    }

    pub fn has_roles(&self, roles: RolesMask) -> bool {
        self.roles.contains(roles)
    }

    /// Whether the registration is still valid at `epoch`.
    pub fn is_expired(&self, epoch: u64) -> bool {
        epoch > self.expiration
    }

    /// Addresses that pass the routability check.
    pub fn routable_addresses(&self) -> Vec<Address> {
        self.addresses
            .iter()
            .copied()
            .filter(Address::is_routable)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn roles_mask_contains() {
        let roles = RolesMask::STORAGE_WORKER | RolesMask::VALIDATOR;
        assert!(roles.contains(RolesMask::STORAGE_WORKER));
        assert!(roles.contains(RolesMask::VALIDATOR));
        assert!(!roles.contains(RolesMask::COMPUTE_WORKER));
        assert!(roles.contains(RolesMask::empty()));
        assert_eq!(format!("{:?}", roles), "RolesMask(storage,validator)");
    }

    #[test]
    fn storage_worker_descriptor() {
        let id = Keypair::generate().public_key();
        let node = Node::storage_worker(id, vec!["10.0.0.1:9100".parse().unwrap()]);
        assert!(node.has_roles(RolesMask::STORAGE_WORKER));
        assert_eq!(node.entity_id, id);
        assert!(!node.is_expired(1_000));
    }

    #[test]
    fn routable_addresses_filters_reserved() {
        let id = Keypair::generate().public_key();
        let node = Node::storage_worker(
            id,
            vec![
                "10.0.0.1:9100".parse().unwrap(),
                "8.8.4.4:9100".parse().unwrap(),
                "[::1]:9100".parse().unwrap(),
            ],
        );
        assert_eq!(
            node.routable_addresses(),
            vec!["8.8.4.4:9100".parse::<Address>().unwrap()]
        );
    }

    #[test]
    fn json_descriptor_is_readable() {
        let id = Keypair::from_seed(&[3u8; 32]).public_key();
        let node = Node::storage_worker(id, vec!["192.0.2.7:9100".parse().unwrap()]);
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"192.0.2.7:9100\""));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
