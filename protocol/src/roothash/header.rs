//! # Block Headers
//!
//! A runtime block header commits to the runtime's I/O and state roots for a
//! round and carries the storage committee's signatures over those roots.
//!
//! ## Header Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Header                                        │
//! │  ├── version: u16                              │
//! │  ├── namespace: Namespace                      │
//! │  ├── round: u64                                │
//! │  ├── timestamp: u64      (POSIX seconds)       │
//! │  ├── header_type: HeaderType                   │
//! │  ├── previous_hash: Hash (parent identity)     │
//! │  ├── io_root: Hash                             │
//! │  ├── state_root: Hash                          │
//! │  ├── messages: Vec<RoothashMessage>            │
//! │  └── storage_signatures: Vec<SignatureBundle>  │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! A header's identity is [`Header::encoded_hash`]: BLAKE3 over the bincode
//! encoding of every field, signatures included. Two copies that differ only
//! in which storage signatures they collected are compared with
//! [`Header::mostly_equal`].

use serde::{Deserialize, Serialize};

use crate::common::Namespace;
use crate::config::{HEADER_VERSION, RECEIPT_SIGNATURE_CONTEXT, RECEIPT_VERSION};
use crate::crypto::{Hash, Keypair, SignatureBundle};
use crate::storage::ReceiptBody;

/// Kind of block a header describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HeaderType {
    /// A regular block.
    Normal = 0,
    /// Produced when a round fails. Carries no transactions but still
    /// advances the round so stale commitments cannot be replayed.
    RoundFailed = 1,
    /// Produced at an epoch boundary. Carries no transactions and advances
    /// the round.
    EpochTransition = 2,
}

/// A message emitted by the runtime to the consensus layer in this round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoothashMessage {
    pub method: String,
    pub body: Vec<u8>,
}

/// A runtime block header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u16,
    pub namespace: Namespace,
    pub round: u64,
    pub timestamp: u64,
    pub header_type: HeaderType,
    /// `encoded_hash()` of the parent header.
    pub previous_hash: Hash,
    pub io_root: Hash,
    pub state_root: Hash,
    pub messages: Vec<RoothashMessage>,
    /// Storage receipt signatures over [`roots_for_receipt`](Self::roots_for_receipt).
    pub storage_signatures: Vec<SignatureBundle>,
}

impl Header {
    /// The round-0 header of a namespace. Both roots denote empty trees.
    pub fn genesis(namespace: Namespace, timestamp: u64) -> Self {
        Self {
            version: HEADER_VERSION,
            namespace,
            round: 0,
            timestamp,
            header_type: HeaderType::Normal,
            previous_hash: Hash::empty(),
            io_root: Hash::empty(),
            state_root: Hash::empty(),
            messages: Vec::new(),
            storage_signatures: Vec::new(),
        }
    }

    /// Builds the child of `parent`. Every header type advances the round.
    pub fn next(
        parent: &Header,
        header_type: HeaderType,
        io_root: Hash,
        state_root: Hash,
        timestamp: u64,
    ) -> Self {
        Self {
            version: HEADER_VERSION,
            namespace: parent.namespace,
            round: parent.round.saturating_add(1),
            timestamp,
            header_type,
            previous_hash: parent.encoded_hash(),
            io_root,
            state_root,
            messages: Vec::new(),
            storage_signatures: Vec::new(),
        }
    }

    /// BLAKE3 of the canonical encoding of the whole header.
    pub fn encoded_hash(&self) -> Hash {
        Hash::digest_encoded(self)
    }

    /// Compares two headers ignoring `storage_signatures`.
    pub fn mostly_equal(&self, other: &Header) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.storage_signatures.clear();
        b.storage_signatures.clear();
        a.encoded_hash() == b.encoded_hash()
    }

    /// Returns `true` iff `child` links back to this header.
    pub fn is_parent_of(&self, child: &Header) -> bool {
        child.previous_hash == self.encoded_hash()
    }

    /// The roots a storage receipt for this header must cover, in order.
    pub fn roots_for_receipt(&self) -> Vec<Hash> {
        vec![self.io_root, self.state_root]
    }

    /// The receipt body a storage node is expected to sign for this header.
    pub fn receipt_body(&self) -> ReceiptBody {
        ReceiptBody {
            version: RECEIPT_VERSION,
            namespace: self.namespace,
            round: self.round,
            roots: self.roots_for_receipt(),
        }
    }

    /// Signs this header's receipt body with `signer` and appends the
    /// signature to `storage_signatures`.
    pub fn add_storage_signature(&mut self, signer: &Keypair) {
        let blob = self.receipt_body().encode();
        self.storage_signatures.push(SignatureBundle::sign(
            signer,
            RECEIPT_SIGNATURE_CONTEXT,
            &blob,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace() -> Namespace {
        Namespace::from_bytes([9u8; 32])
    }

    #[test]
    fn genesis_header() {
        let genesis = Header::genesis(namespace(), 1_700_000_000);
        assert_eq!(genesis.round, 0);
        assert_eq!(genesis.header_type, HeaderType::Normal);
        assert!(genesis.io_root.is_empty());
        assert!(genesis.state_root.is_empty());
        assert_eq!(genesis.version, HEADER_VERSION);
    }

    #[test]
    fn next_chains_and_advances_round() {
        let genesis = Header::genesis(namespace(), 1);
        let io = Hash::digest_bytes(b"io");
        let state = Hash::digest_bytes(b"state");

        let normal = Header::next(&genesis, HeaderType::Normal, io, state, 2);
        let failed = Header::next(&normal, HeaderType::RoundFailed, io, state, 3);
        let epoch = Header::next(&failed, HeaderType::EpochTransition, io, state, 4);

        assert_eq!(normal.round, 1);
        assert_eq!(failed.round, 2);
        assert_eq!(epoch.round, 3);
        assert!(genesis.is_parent_of(&normal));
        assert!(normal.is_parent_of(&failed));
        assert!(failed.is_parent_of(&epoch));
        assert!(!genesis.is_parent_of(&failed));
        assert!(!normal.is_parent_of(&genesis));
    }

    #[test]
    fn encoded_hash_covers_every_field() {
        let base = Header::genesis(namespace(), 10);
        let h = base.encoded_hash();

        let mut changed = base.clone();
        changed.timestamp = 11;
        assert_ne!(changed.encoded_hash(), h);

        let mut changed = base.clone();
        changed.messages.push(RoothashMessage {
            method: "staking.Transfer".into(),
            body: vec![1, 2, 3],
        });
        assert_ne!(changed.encoded_hash(), h);

        let mut changed = base.clone();
        changed.add_storage_signature(&Keypair::generate());
        assert_ne!(changed.encoded_hash(), h);

        assert_eq!(base.clone().encoded_hash(), h);
    }

    #[test]
    fn mostly_equal_ignores_signatures_only() {
        let a = Header::genesis(namespace(), 10);
        let mut b = a.clone();
        b.add_storage_signature(&Keypair::generate());
        b.add_storage_signature(&Keypair::generate());
        assert!(a.mostly_equal(&b));
        assert!(b.mostly_equal(&a));

        let mut c = a.clone();
        c.state_root = Hash::digest_bytes(b"other");
        assert!(!a.mostly_equal(&c));
    }

    #[test]
    fn receipt_body_uses_header_roots() {
        let genesis = Header::genesis(namespace(), 1);
        let io = Hash::digest_bytes(b"io");
        let state = Hash::digest_bytes(b"state");
        let header = Header::next(&genesis, HeaderType::Normal, io, state, 2);

        assert_eq!(header.roots_for_receipt(), vec![io, state]);
        let body = header.receipt_body();
        assert_eq!(body.version, RECEIPT_VERSION);
        assert_eq!(body.namespace, header.namespace);
        assert_eq!(body.round, 1);
        assert_eq!(body.roots, vec![io, state]);
    }
}
