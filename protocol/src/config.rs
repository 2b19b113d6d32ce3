//! # Protocol Configuration & Constants
//!
//! Every magic number in shardstore lives here. Tunables that operators are
//! expected to change live in `Default`-implementing config structs next to
//! the module that uses them (`ClientConfig`, `StorageConfig`, ...); their
//! defaults are taken from the constants below.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate version string reported by the node binary.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Version stamped into every receipt body. Bump on any change to the
/// receipt encoding.
pub const RECEIPT_VERSION: u16 = 1;

/// Version stamped into block headers produced by the builders in
/// [`roothash`](crate::roothash).
pub const HEADER_VERSION: u16 = 0;

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// BLAKE3 output length.
pub const HASH_LENGTH: usize = 32;

/// Ed25519 public key length.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Namespace identifier length. Equal to the public key length because a
/// namespace is derived from the runtime's public identity.
pub const NAMESPACE_LENGTH: usize = 32;

/// Domain separation context for storage receipt signatures.
pub const RECEIPT_SIGNATURE_CONTEXT: &[u8] = b"shardstore/storage: receipt";

// ---------------------------------------------------------------------------
// Client Timing
// ---------------------------------------------------------------------------

/// Default deadline for a single client call (read or write), covering
/// every retry across the committee.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-peer attempt timeout. A peer that does not answer within this
/// window is abandoned and the next one is tried.
pub const DEFAULT_PEER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// How many peers a read is sent to concurrently.
pub const DEFAULT_READ_REDUNDANCY: usize = 1;

/// How often the client retries committee members it could not connect to.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Storage Backends
// ---------------------------------------------------------------------------

/// Default number of read results held by the caching client.
pub const DEFAULT_ROOT_CACHE_SLOTS: usize = 1000;

/// Upper bound on parent hops a local-engine read will follow before giving
/// up. Guards against a corrupted parent chain looping forever.
pub const MAX_ROOT_CHAIN_DEPTH: u64 = 1 << 20;
