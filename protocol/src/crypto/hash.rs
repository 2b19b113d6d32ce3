//! # Hashing
//!
//! Every digest in shardstore is a BLAKE3 output wrapped in [`Hash`]. Merkle
//! roots, header identities and write-log fingerprints all share this type,
//! so a root handed over by a storage node can be compared byte-for-byte
//! against the one carried in a block header.
//!
//! ## Canonical encoding
//!
//! Structured values are hashed over their bincode encoding
//! ([`Hash::digest_encoded`]). bincode is deterministic for our types (no
//! maps, fixed-width integers), which is what makes `encoded_hash()` on a
//! header stable across processes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::HASH_LENGTH;

/// Errors produced when decoding a hash from external input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashError {
    #[error("malformed hash: {0}")]
    Malformed(String),

    #[error("hash has invalid length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// A 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// Wraps raw digest bytes without hashing them.
    pub const fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Hashes arbitrary bytes.
    pub fn digest_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hashes the canonical (bincode) encoding of a value.
    ///
    /// Encoding into a `Vec` cannot fail for the plain-data types we hash, so
    /// a failure here would only mean a non-serializable type slipped in; we
    /// fall back to hashing the empty input rather than panicking.
    pub fn digest_encoded<T: Serialize + ?Sized>(value: &T) -> Self {
        let encoded = bincode::serialize(value).unwrap_or_default();
        Self::digest_bytes(&encoded)
    }

    /// The digest of the empty input. Denotes an empty tree.
    pub fn empty() -> Self {
        Self::digest_bytes(&[])
    }

    /// Returns `true` if this is the empty-tree digest.
    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex digest.
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(s).map_err(|e| HashError::Malformed(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }

    pub fn try_from_slice(slice: &[u8]) -> Result<Self, HashError> {
        let bytes: [u8; HASH_LENGTH] =
            slice.try_into().map_err(|_| HashError::InvalidLength {
                expected: HASH_LENGTH,
                got: slice.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic() {
        let a = Hash::digest_bytes(b"shardstore");
        let b = Hash::digest_bytes(b"shardstore");
        assert_eq!(a, b);
        assert_ne!(a, Hash::digest_bytes(b"shardstorE"));
    }

    #[test]
    fn encoded_digest_tracks_field_changes() {
        let a = Hash::digest_encoded(&(1u64, "io"));
        let b = Hash::digest_encoded(&(2u64, "io"));
        assert_ne!(a, b);
        assert_eq!(a, Hash::digest_encoded(&(1u64, "io")));
    }

    #[test]
    fn empty_hash_is_recognised() {
        assert!(Hash::empty().is_empty());
        assert!(!Hash::digest_bytes(b"x").is_empty());
        // The all-zero default is not the empty-tree digest.
        assert!(!Hash::default().is_empty());
    }

    #[test]
    fn hex_roundtrip() {
        let h = Hash::digest_bytes(b"round trip");
        assert_eq!(Hash::from_hex(&h.to_hex()).unwrap(), h);
    }

    #[test]
    fn rejects_short_input() {
        assert_eq!(
            Hash::try_from_slice(&[0u8; 31]),
            Err(HashError::InvalidLength {
                expected: 32,
                got: 31
            })
        );
        assert!(matches!(Hash::from_hex("zz"), Err(HashError::Malformed(_))));
    }
}
