//! # Storage Module
//!
//! Everything a node needs to read and write runtime state held by a
//! storage committee.
//!
//! ## Architecture
//!
//! ```text
//! api.rs        Roots, requests, receipts, RequestContext, the Backend trait
//! client.rs     Committee-aware client that fans requests out to members
//! transport.rs  Connections to storage nodes (in-process LocalTransport)
//! local.rs      sled-backed engine a storage node runs
//! caching.rs    LRU read cache wrapper
//! crashing.rs   Fault injection wrapper
//! metrics.rs    Prometheus wrapper
//! selector.rs   Builds the configured backend stack
//! ```
//!
//! Every backend and wrapper implements [`Backend`], so wrappers stack in any
//! order and callers never care which one they hold.

pub mod api;
pub mod caching;
pub mod client;
pub mod crashing;
pub mod local;
pub mod metrics;
pub mod selector;
pub mod transport;

pub use api::{
    derive_root, ApplyBatchRequest, ApplyOp, ApplyRequest, Backend, GetRequest, GetResponse,
    Initialized, LogEntry, Receipt, ReceiptBody, RequestContext, Root, StorageError,
    StorageResult, TreeId, WriteLog,
};
pub use caching::{CachingBackend, CachingConfig};
pub use client::{ClientConfig, ConnectionInfo, StorageClient, WritePolicy};
pub use crashing::{CrashPoint, CrashingBackend};
pub use local::{DbError, LocalBackend, LocalConfig};
pub use metrics::{MetricsBackend, StorageMetrics};
pub use selector::{
    new_backend, BackendKind, Collaborators, SelectedBackend, SelectorError, StorageConfig,
};
pub use transport::{LocalTransport, StorageConnection, StorageTransport, TransportError};
