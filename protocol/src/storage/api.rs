//! # Storage API
//!
//! Request/response types, receipts and the [`Backend`] trait shared by the
//! committee client, the local engine and every wrapper.
//!
//! ## Roots
//!
//! A [`Root`] names one version of a runtime's tree: namespace, round and
//! root hash. Applying a write log to a source root produces a new root; the
//! new hash is a pure function of its inputs ([`derive_root`]), so every
//! honest storage node that applies the same batch reports the same roots.
//!
//! ## Receipts
//!
//! A storage node attests to the roots it produced by signing a
//! [`ReceiptBody`]. The signature covers the encoded bytes exactly as they
//! travel (`Receipt::blob`), never a re-encoding of the decoded struct.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::common::Namespace;
use crate::config::{RECEIPT_SIGNATURE_CONTEXT, RECEIPT_VERSION};
use crate::crypto::{Hash, Keypair, PublicKey, SignatureBundle};
use crate::registry::RegistryError;
use crate::roothash::ReceiptError;
use crate::storage::local::DbError;
use crate::storage::transport::TransportError;

// ---------------------------------------------------------------------------
// Roots and requests
// ---------------------------------------------------------------------------

/// One version of a runtime's tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Root {
    pub namespace: Namespace,
    pub round: u64,
    pub hash: Hash,
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Root({:?}, round={}, {})",
            self.namespace,
            self.round,
            &self.hash.to_hex()[..16]
        )
    }
}

/// Addresses a subtree for reads: a root plus a node position within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeId {
    pub root: Root,
    pub position: Hash,
}

impl TreeId {
    /// Addresses the whole tree under `root`.
    pub fn at_root(root: Root) -> Self {
        Self {
            root,
            position: root.hash,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GetRequest {
    pub tree: TreeId,
    pub key: Vec<u8>,
}

/// A read result. `root` echoes the root the serving node read from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub root: Root,
    pub value: Option<Vec<u8>>,
}

/// One write: `value: None` deletes the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl LogEntry {
    pub fn insert(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

pub type WriteLog = Vec<LogEntry>;

/// Applies `write_log` on top of `src_root` at `src_round`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOp {
    pub src_round: u64,
    pub src_root: Hash,
    pub write_log: WriteLog,
}

/// A set of writes that all land in `dst_round` of `namespace`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyBatchRequest {
    pub namespace: Namespace,
    pub dst_round: u64,
    pub ops: Vec<ApplyOp>,
}

/// A single write log application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub namespace: Namespace,
    pub dst_round: u64,
    pub op: ApplyOp,
}

impl From<ApplyRequest> for ApplyBatchRequest {
    fn from(request: ApplyRequest) -> Self {
        Self {
            namespace: request.namespace,
            dst_round: request.dst_round,
            ops: vec![request.op],
        }
    }
}

/// The root hash resulting from applying `write_log` to `src_root`.
///
/// An empty write log leaves the tree unchanged. Otherwise the hash commits
/// to the destination namespace and round, the source root and the write
/// log in order.
pub fn derive_root(
    namespace: &Namespace,
    dst_round: u64,
    src_root: &Hash,
    write_log: &WriteLog,
) -> Hash {
    if write_log.is_empty() {
        return *src_root;
    }
    Hash::digest_encoded(&(namespace, dst_round, src_root, write_log))
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// What a storage node attests to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptBody {
    pub version: u16,
    pub namespace: Namespace,
    pub round: u64,
    pub roots: Vec<Hash>,
}

impl ReceiptBody {
    pub fn new(namespace: Namespace, round: u64, roots: Vec<Hash>) -> Self {
        Self {
            version: RECEIPT_VERSION,
            namespace,
            round,
            roots,
        }
    }

    /// Canonical bincode encoding.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(blob: &[u8]) -> Result<Self, ReceiptError> {
        bincode::deserialize(blob).map_err(|e| ReceiptError::MalformedBody(e.to_string()))
    }
}

/// A signed receipt body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Encoded [`ReceiptBody`], exactly as signed.
    pub blob: Vec<u8>,
    pub signature: SignatureBundle,
}

impl Receipt {
    pub fn sign(signer: &Keypair, body: &ReceiptBody) -> Self {
        let blob = body.encode();
        let signature = SignatureBundle::sign(signer, RECEIPT_SIGNATURE_CONTEXT, &blob);
        Self { blob, signature }
    }

    /// Verifies the signature over the blob, then decodes it.
    pub fn open(&self) -> Result<ReceiptBody, ReceiptError> {
        self.signature
            .verify(RECEIPT_SIGNATURE_CONTEXT, &self.blob)
            .map_err(|_| ReceiptError::SignatureInvalid)?;
        ReceiptBody::decode(&self.blob)
    }

    pub fn signer(&self) -> &PublicKey {
        &self.signature.public_key
    }
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Deadline and cancellation for one call.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl RequestContext {
    /// No deadline, never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().deadline_at(Instant::now() + timeout)
    }

    /// Sets the deadline, keeping an earlier one if already set.
    pub fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Cancels the call once `cancel` carries `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` if there is none.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once the call is cancelled. Pending forever otherwise.
    pub async fn cancelled(&self) {
        let Some(mut rx) = self.cancel.clone() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Resolves when the deadline passes. Pending forever without one.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Initialized signal
// ---------------------------------------------------------------------------

/// Fires once a backend is ready to serve requests.
#[derive(Clone, Debug)]
pub struct Initialized {
    rx: watch::Receiver<bool>,
}

impl Initialized {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that has already fired.
    pub fn ready() -> Self {
        let (_tx, rx) = watch::channel(true);
        Self { rx }
    }

    pub fn is_initialized(&self) -> bool {
        *self.rx.borrow()
    }

    /// Waits for the signal. Returns `false` if the backend went away
    /// without ever becoming ready.
    pub async fn wait(&mut self) -> bool {
        loop {
            if *self.rx.borrow_and_update() {
                return true;
            }
            if self.rx.changed().await.is_err() {
                return *self.rx.borrow();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The client has no committee yet, or the committee is empty.
    #[error("storage client: storage not available")]
    StorageNotAvailable,

    /// Every peer failed or the deadline passed.
    #[error("storage client: unavailable: {0}")]
    Unavailable(String),

    /// Responses failed integrity checks.
    #[error("storage client: verification failed: {0}")]
    VerificationFailed(String),

    /// Fewer members acknowledged a write than the write policy requires.
    #[error("storage client: insufficient replicas: {acknowledged} acknowledged, {required} required")]
    InsufficientReplicas { acknowledged: usize, required: usize },

    #[error("storage: request cancelled")]
    Cancelled,

    #[error("storage client: already watching a runtime")]
    AlreadyWatching,

    #[error("storage: unknown root {0}")]
    UnknownRoot(Hash),

    #[error("storage: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage: receipt error: {0}")]
    Receipt(#[from] ReceiptError),

    #[error("storage: registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("storage: transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage: database error: {0}")]
    Db(#[from] DbError),

    #[error("storage: backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether retrying the same call later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageNotAvailable | Self::Unavailable(_) | Self::InsufficientReplicas { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// A storage backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Reads `key` from the tree named by `request.tree`.
    async fn get(&self, ctx: &RequestContext, request: GetRequest) -> StorageResult<GetResponse>;

    /// Applies a batch of write logs and returns the resulting receipts.
    async fn apply_batch(
        &self,
        ctx: &RequestContext,
        request: ApplyBatchRequest,
    ) -> StorageResult<Vec<Receipt>>;

    /// Applies a single write log.
    async fn apply(
        &self,
        ctx: &RequestContext,
        request: ApplyRequest,
    ) -> StorageResult<Vec<Receipt>> {
        self.apply_batch(ctx, request.into()).await
    }

    /// Signal that fires once the backend can serve requests.
    fn initialized(&self) -> Initialized;

    /// Releases resources. Calls after cleanup fail.
    fn cleanup(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> ReceiptBody {
        ReceiptBody::new(
            Namespace::from_bytes([4u8; 32]),
            12,
            vec![Hash::digest_bytes(b"a"), Hash::digest_bytes(b"b")],
        )
    }

    #[test]
    fn receipt_open_verifies_then_decodes() {
        let kp = Keypair::generate();
        let receipt = Receipt::sign(&kp, &body());
        assert_eq!(receipt.open(), Ok(body()));
        assert_eq!(receipt.signer(), &kp.public_key());
    }

    #[test]
    fn receipt_with_wrong_context_fails() {
        let kp = Keypair::generate();
        let blob = body().encode();
        let receipt = Receipt {
            signature: SignatureBundle::sign(&kp, b"some other context", &blob),
            blob,
        };
        assert_eq!(receipt.open(), Err(ReceiptError::SignatureInvalid));
    }

    #[test]
    fn garbage_blob_is_malformed() {
        let kp = Keypair::generate();
        let blob = vec![0xff; 3];
        let receipt = Receipt {
            signature: SignatureBundle::sign(&kp, RECEIPT_SIGNATURE_CONTEXT, &blob),
            blob,
        };
        assert!(matches!(receipt.open(), Err(ReceiptError::MalformedBody(_))));
    }

    #[test]
    fn derive_root_is_deterministic() {
        let ns = Namespace::from_bytes([1u8; 32]);
        let src = Hash::empty();
        let log = vec![LogEntry::insert("k", "v")];
        let a = derive_root(&ns, 1, &src, &log);
        assert_eq!(a, derive_root(&ns, 1, &src, &log));
        assert_ne!(a, derive_root(&ns, 2, &src, &log));
        assert_ne!(a, derive_root(&ns, 1, &src, &vec![LogEntry::delete("k")]));
        assert_eq!(derive_root(&ns, 1, &src, &Vec::new()), src);
    }

    #[test]
    fn retryable_classification() {
        assert!(StorageError::StorageNotAvailable.is_retryable());
        assert!(StorageError::Unavailable("x".into()).is_retryable());
        assert!(StorageError::InsufficientReplicas {
            acknowledged: 1,
            required: 2
        }
        .is_retryable());
        assert!(!StorageError::VerificationFailed("x".into()).is_retryable());
        assert!(!StorageError::Cancelled.is_retryable());
        assert!(!StorageError::AlreadyWatching.is_retryable());
    }

    #[tokio::test]
    async fn context_cancellation() {
        let (tx, rx) = watch::channel(false);
        let ctx = RequestContext::background().with_cancel(rx);
        assert!(!ctx.is_cancelled());

        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.cancelled().await })
        };
        tx.send(true).unwrap();
        waiter.await.unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn context_deadline() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(100));
        assert!(!ctx.is_expired());
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(100));

        let earlier = ctx.clone().deadline_at(Instant::now() + Duration::from_millis(10));
        assert!(earlier.deadline() < ctx.deadline());

        ctx.expired().await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert!(RequestContext::background().remaining().is_none());
    }

    #[tokio::test]
    async fn initialized_fires_once_set() {
        let (tx, rx) = watch::channel(false);
        let mut init = Initialized::new(rx);
        assert!(!init.is_initialized());
        tx.send_if_modified(|v| {
            *v = true;
            true
        });
        assert!(init.wait().await);
        assert!(Initialized::ready().wait().await);
    }

    #[tokio::test]
    async fn initialized_reports_abandonment() {
        let (tx, rx) = watch::channel(false);
        let mut init = Initialized::new(rx);
        drop(tx);
        assert!(!init.wait().await);
    }
}
