//! # Cryptographic Primitives
//!
//! - **Ed25519** for node signatures and receipt attestation.
//! - **BLAKE3** for roots, header identities and write-log fingerprints.
//!
//! Everything here is a thin, type-safe wrapper around audited
//! implementations.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{Hash, HashError};
pub use keys::{KeyError, Keypair, PublicKey, Signature};
pub use signatures::{sign_with_context, verify_with_context, SignatureBundle, SignatureError};
