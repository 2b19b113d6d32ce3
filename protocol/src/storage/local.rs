//! # Local Storage Engine
//!
//! A versioned key/value store on sled's embedded database. Stands in for
//! the merkle tree engine a storage node runs: it produces the same kind of
//! roots and receipts, but stores plain key/value deltas instead of tree
//! nodes.
//!
//! ## Tree Layout
//!
//! | Tree      | Key                                  | Value                    |
//! |-----------|--------------------------------------|--------------------------|
//! | `roots`   | `namespace ‖ round (8B BE) ‖ hash`   | `bincode(RootRecord)`    |
//! | `entries` | `root key ‖ user key`                | `bincode(Option<value>)` |
//!
//! Every root stores only the writes that produced it plus a link to its
//! source root. A read walks that parent chain until it finds the key or
//! reaches a root with no parent. Deletes are stored as `None` tombstones so
//! they shadow older values.
//!
//! ## Known roots
//!
//! A write must build on a root this engine already has (or on the empty
//! root). Anything else is rejected with [`StorageError::UnknownRoot`]
//! unless `insecure_skip_checks` is set, in which case the unknown root is
//! treated as empty.
//!
//! ## Atomicity
//!
//! Entries land before the root record that makes them reachable, each as a
//! single sled `Batch`. A crash in between leaves unreachable entries, never
//! a root with missing data.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use tracing::{debug, info};

use super::api::{
    derive_root, ApplyBatchRequest, ApplyOp, Backend, GetRequest, GetResponse, Initialized,
    Receipt, ReceiptBody, RequestContext, Root, StorageError, StorageResult,
};
use crate::common::Namespace;
use crate::config::MAX_ROOT_CHAIN_DEPTH;
use crate::crypto::{Hash, Keypair};

/// Name reported by the backend selector.
pub const BACKEND_NAME: &str = "local";

/// Directory name used under the node's data dir.
pub const DB_DIR: &str = "local-storage.sled";

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt root chain: {0}")]
    CorruptChain(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Local engine configuration.
#[derive(Clone, Debug)]
pub struct LocalConfig {
    /// Key receipts are signed with.
    pub signer: Keypair,
    /// INSECURE: accept writes on top of unknown roots.
    pub insecure_skip_checks: bool,
}

impl LocalConfig {
    pub fn new(signer: Keypair) -> Self {
        Self {
            signer,
            insecure_skip_checks: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Keys and records
// ---------------------------------------------------------------------------

const ROOT_KEY_LENGTH: usize = 32 + 8 + 32;

type RootKey = [u8; ROOT_KEY_LENGTH];

fn root_key(namespace: &Namespace, round: u64, hash: &Hash) -> RootKey {
    let mut key = [0u8; ROOT_KEY_LENGTH];
    key[..32].copy_from_slice(namespace.as_bytes());
    key[32..40].copy_from_slice(&round.to_be_bytes());
    key[40..].copy_from_slice(hash.as_bytes());
    key
}

fn entry_key(root: &RootKey, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ROOT_KEY_LENGTH + key.len());
    out.extend_from_slice(root);
    out.extend_from_slice(key);
    out
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RootRecord {
    /// `(round, hash)` of the source root, within the same namespace.
    parent: Option<(u64, Hash)>,
}

// ---------------------------------------------------------------------------
// LocalBackend
// ---------------------------------------------------------------------------

/// sled-backed storage engine.
///
/// sled trees are safe for concurrent use, so the backend can be shared via
/// `Arc` without further locking.
pub struct LocalBackend {
    db: Db,
    roots: Tree,
    entries: Tree,
    config: LocalConfig,
    closed: AtomicBool,
}

impl LocalBackend {
    /// Opens or creates a database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: LocalConfig) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db, config)
    }

    /// A database that is deleted when dropped.
    pub fn open_temporary(config: LocalConfig) -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, config)
    }

    fn from_db(db: Db, config: LocalConfig) -> DbResult<Self> {
        let roots = db.open_tree("roots")?;
        let entries = db.open_tree("entries")?;
        info!(
            signer = %config.signer.public_key(),
            roots = roots.len(),
            insecure_skip_checks = config.insecure_skip_checks,
            "local storage engine opened"
        );
        Ok(Self {
            db,
            roots,
            entries,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Whether `root` is stored here. The empty root always is.
    pub fn has_root(&self, root: &Root) -> DbResult<bool> {
        if root.hash.is_empty() {
            return Ok(true);
        }
        Ok(self
            .roots
            .contains_key(root_key(&root.namespace, root.round, &root.hash))?)
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Blocks until pending writes are durable.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn check_open(&self, ctx: &RequestContext) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("local storage engine closed".into()));
        }
        if ctx.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }

    fn read_record(&self, key: &RootKey) -> DbResult<Option<RootRecord>> {
        match self.roots.get(key)? {
            Some(bytes) => {
                let record = bincode::deserialize(&bytes)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Looks up `key` under `root`, following parent links.
    fn lookup(&self, root: &Root, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let mut round = root.round;
        let mut hash = root.hash;

        for depth in 0..MAX_ROOT_CHAIN_DEPTH {
            let current = root_key(&root.namespace, round, &hash);

            if let Some(bytes) = self
                .entries
                .get(entry_key(&current, key))
                .map_err(DbError::from)?
            {
                let value: Option<Vec<u8>> = bincode::deserialize(&bytes)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                return Ok(value);
            }

            match self.read_record(&current)? {
                Some(RootRecord {
                    parent: Some((parent_round, parent_hash)),
                }) => {
                    round = parent_round;
                    hash = parent_hash;
                }
                Some(RootRecord { parent: None }) => return Ok(None),
                None if hash.is_empty() => return Ok(None),
                None if depth == 0 => return Err(StorageError::UnknownRoot(hash)),
                None => {
                    return Err(DbError::CorruptChain(format!(
                        "missing root {} at round {}",
                        hash, round
                    ))
                    .into())
                }
            }
        }

        Err(DbError::CorruptChain(format!("chain under {} exceeds depth limit", root.hash)).into())
    }

    /// Applies one write log and returns the new root hash.
    fn apply_op(&self, namespace: &Namespace, dst_round: u64, op: &ApplyOp) -> StorageResult<Hash> {
        if dst_round < op.src_round {
            return Err(StorageError::InvalidArgument(format!(
                "destination round {} precedes source round {}",
                dst_round, op.src_round
            )));
        }

        let src = Root {
            namespace: *namespace,
            round: op.src_round,
            hash: op.src_root,
        };
        let parent = if self.has_root(&src)? {
            Some((op.src_round, op.src_root))
        } else if self.config.insecure_skip_checks {
            debug!(root = %op.src_root, "skipping known root check");
            None
        } else {
            return Err(StorageError::UnknownRoot(op.src_root));
        };

        let new_hash = derive_root(namespace, dst_round, &op.src_root, &op.write_log);
        let new_key = root_key(namespace, dst_round, &new_hash);
        if parent == Some((dst_round, new_hash))
            || self.roots.contains_key(new_key).map_err(DbError::from)?
        {
            return Ok(new_hash);
        }

        let mut entries = Batch::default();
        for entry in &op.write_log {
            let value = bincode::serialize(&entry.value)
                .map_err(|e| DbError::Serialization(e.to_string()))?;
            entries.insert(entry_key(&new_key, &entry.key), value);
        }
        self.entries.apply_batch(entries).map_err(DbError::from)?;

        let record = bincode::serialize(&RootRecord { parent })
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        self.roots.insert(new_key, record).map_err(DbError::from)?;

        Ok(new_hash)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn get(&self, ctx: &RequestContext, request: GetRequest) -> StorageResult<GetResponse> {
        self.check_open(ctx)?;
        let root = request.tree.root;
        let value = self.lookup(&root, &request.key)?;
        Ok(GetResponse { root, value })
    }

    async fn apply_batch(
        &self,
        ctx: &RequestContext,
        request: ApplyBatchRequest,
    ) -> StorageResult<Vec<Receipt>> {
        self.check_open(ctx)?;

        let roots = request
            .ops
            .iter()
            .map(|op| self.apply_op(&request.namespace, request.dst_round, op))
            .collect::<StorageResult<Vec<Hash>>>()?;
        self.flush()?;

        debug!(
            namespace = %request.namespace,
            round = request.dst_round,
            ops = roots.len(),
            "batch applied"
        );

        let body = ReceiptBody::new(request.namespace, request.dst_round, roots);
        Ok(vec![Receipt::sign(&self.config.signer, &body)])
    }

    fn initialized(&self) -> Initialized {
        Initialized::ready()
    }

    fn cleanup(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.db.flush() {
                tracing::warn!(error = %e, "failed to flush local storage on cleanup");
            }
            info!("local storage engine closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::api::{LogEntry, TreeId, WriteLog};

    fn ns() -> Namespace {
        Namespace::from_bytes([5u8; 32])
    }

    fn backend() -> (LocalBackend, Keypair) {
        let signer = Keypair::generate();
        let backend = LocalBackend::open_temporary(LocalConfig::new(signer.clone())).unwrap();
        (backend, signer)
    }

    fn root(round: u64, hash: Hash) -> Root {
        Root {
            namespace: ns(),
            round,
            hash,
        }
    }

    async fn get(backend: &LocalBackend, root: Root, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let request = GetRequest {
            tree: TreeId::at_root(root),
            key: key.as_bytes().to_vec(),
        };
        backend
            .get(&RequestContext::background(), request)
            .await
            .map(|r| r.value)
    }

    async fn apply(
        backend: &LocalBackend,
        src_round: u64,
        src_root: Hash,
        dst_round: u64,
        log: WriteLog,
    ) -> StorageResult<Hash> {
        let request = ApplyBatchRequest {
            namespace: ns(),
            dst_round,
            ops: vec![ApplyOp {
                src_round,
                src_root,
                write_log: log,
            }],
        };
        let receipts = backend
            .apply_batch(&RequestContext::background(), request)
            .await?;
        let body = receipts[0].open().unwrap();
        Ok(body.roots[0])
    }


    #[tokio::test]
    async fn write_then_read() {
        let (backend, _) = backend();
        let r1 = apply(&backend, 0, Hash::empty(), 1, vec![LogEntry::insert("a", "1")])
            .await
            .unwrap();
        assert_eq!(get(&backend, root(1, r1), "a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(get(&backend, root(1, r1), "b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_follow_parent_chain() {
        let (backend, _) = backend();
        let r1 = apply(&backend, 0, Hash::empty(), 1, vec![LogEntry::insert("a", "1")])
            .await
            .unwrap();
        let r2 = apply(
            &backend,
            1,
            r1,
            2,
            vec![LogEntry::insert("b", "2"), LogEntry::delete("a")],
        )
        .await
        .unwrap();

        assert_eq!(get(&backend, root(2, r2), "b").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(get(&backend, root(2, r2), "a").await.unwrap(), None);
        // Old versions stay readable.
        assert_eq!(get(&backend, root(1, r1), "a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(get(&backend, root(1, r1), "b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn receipt_is_signed_by_engine_key() {
        let (backend, signer) = backend();
        let request = ApplyBatchRequest {
            namespace: ns(),
            dst_round: 1,
            ops: vec![
                ApplyOp {
                    src_round: 0,
                    src_root: Hash::empty(),
                    write_log: vec![LogEntry::insert("io", "x")],
                },
                ApplyOp {
                    src_round: 0,
                    src_root: Hash::empty(),
                    write_log: vec![LogEntry::insert("state", "y")],
                },
            ],
        };
        let receipts = backend
            .apply_batch(&RequestContext::background(), request.clone())
            .await
            .unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].signer(), &signer.public_key());

        let body = receipts[0].open().unwrap();
        assert_eq!(body.round, 1);
        assert_eq!(body.namespace, ns());
        assert_eq!(
            body.roots,
            request
                .ops
                .iter()
                .map(|op| derive_root(&ns(), 1, &op.src_root, &op.write_log))
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn unknown_source_root_rejected() {
        let (backend, _) = backend();
        let bogus = Hash::digest_bytes(b"never written");
        let err = apply(&backend, 0, bogus, 1, vec![LogEntry::insert("a", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownRoot(h) if h == bogus));
    }

    #[tokio::test]
    async fn insecure_skip_checks_accepts_unknown_root() {
        let mut config = LocalConfig::new(Keypair::generate());
        config.insecure_skip_checks = true;
        let backend = LocalBackend::open_temporary(config).unwrap();

        let bogus = Hash::digest_bytes(b"never written");
        let r1 = apply(&backend, 0, bogus, 1, vec![LogEntry::insert("a", "1")])
            .await
            .unwrap();
        assert_eq!(get(&backend, root(1, r1), "a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn read_of_unknown_root_fails() {
        let (backend, _) = backend();
        let bogus = Hash::digest_bytes(b"nope");
        assert!(matches!(
            get(&backend, root(3, bogus), "a").await,
            Err(StorageError::UnknownRoot(_))
        ));
        assert_eq!(get(&backend, root(3, Hash::empty()), "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn destination_before_source_rejected() {
        let (backend, _) = backend();
        let err = apply(&backend, 5, Hash::empty(), 4, vec![LogEntry::insert("a", "1")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn reapplying_is_idempotent() {
        let (backend, _) = backend();
        let log = vec![LogEntry::insert("a", "1")];
        let r1 = apply(&backend, 0, Hash::empty(), 1, log.clone()).await.unwrap();
        let count = backend.root_count();
        let again = apply(&backend, 0, Hash::empty(), 1, log).await.unwrap();
        assert_eq!(r1, again);
        assert_eq!(backend.root_count(), count);
    }

    #[tokio::test]
    async fn closed_backend_refuses_calls() {
        let (backend, _) = backend();
        backend.cleanup();
        assert!(matches!(
            get(&backend, root(0, Hash::empty()), "a").await,
            Err(StorageError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signer = Keypair::generate();
        let r1 = {
            let backend = LocalBackend::open(dir.path(), LocalConfig::new(signer.clone())).unwrap();
            let r1 = apply(&backend, 0, Hash::empty(), 1, vec![LogEntry::insert("k", "v")])
                .await
                .unwrap();
            backend.cleanup();
            r1
        };

        let backend = LocalBackend::open(dir.path(), LocalConfig::new(signer)).unwrap();
        assert!(backend.has_root(&root(1, r1)).unwrap());
        assert_eq!(get(&backend, root(1, r1), "k").await.unwrap(), Some(b"v".to_vec()));
    }
}
