//! Runtime storage namespaces.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::NAMESPACE_LENGTH;
use crate::crypto::PublicKey;

/// Opaque identifier of a runtime's storage shard.
///
/// Derived from the runtime's public identity by copying its bytes, so the
/// same runtime always maps to the same namespace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Namespace([u8; NAMESPACE_LENGTH]);

impl Namespace {
    pub const fn from_bytes(bytes: [u8; NAMESPACE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// The namespace of a runtime.
    pub fn from_runtime_id(runtime_id: &PublicKey) -> Self {
        Self(*runtime_id.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; NAMESPACE_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", &self.to_hex()[..16])
    }
}
