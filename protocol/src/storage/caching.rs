//! # Caching Backend
//!
//! Keeps recent read results in memory in front of another backend. A root
//! never changes once written, so a cached `(root, key)` result stays valid
//! for as long as it is cached. Writes pass straight through.
//!
//! Hits are only served while the inner backend reports itself initialized,
//! so a wrapped client that was shut down fails reads even for cached keys.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::api::{
    ApplyBatchRequest, Backend, GetRequest, GetResponse, Initialized, Receipt, RequestContext,
    StorageResult,
};
use crate::config::DEFAULT_ROOT_CACHE_SLOTS;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachingConfig {
    /// Read results kept in memory. Zero is treated as one.
    pub slots: usize,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_ROOT_CACHE_SLOTS,
        }
    }
}

/// LRU read cache around another backend.
pub struct CachingBackend {
    inner: Arc<dyn Backend>,
    cache: Mutex<LruCache<GetRequest, GetResponse>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachingBackend {
    pub fn new(inner: Arc<dyn Backend>, config: CachingConfig) -> Self {
        let slots = NonZeroUsize::new(config.slots).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(slots)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Backend for CachingBackend {
    async fn get(&self, ctx: &RequestContext, request: GetRequest) -> StorageResult<GetResponse> {
        if self.inner.initialized().is_initialized() {
            if let Some(hit) = self.cache.lock().get(&request).cloned() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(root = ?request.tree.root, "read cache hit");
                return Ok(hit);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let response = self.inner.get(ctx, request.clone()).await?;
        self.cache.lock().put(request, response.clone());
        Ok(response)
    }

    async fn apply_batch(
        &self,
        ctx: &RequestContext,
        request: ApplyBatchRequest,
    ) -> StorageResult<Vec<Receipt>> {
        self.inner.apply_batch(ctx, request).await
    }

    fn initialized(&self) -> Initialized {
        self.inner.initialized()
    }

    fn cleanup(&self) {
        self.cache.lock().clear();
        self.inner.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Namespace, Node};
    use crate::crypto::{Hash, Keypair};
    use crate::registry::MemoryRegistry;
    use crate::scheduler::{Committee, MemoryScheduler};
    use crate::storage::api::{ApplyOp, LogEntry, Root, StorageError, TreeId};
    use crate::storage::client::{ClientConfig, StorageClient};
    use crate::storage::local::{LocalBackend, LocalConfig};
    use crate::storage::transport::LocalTransport;
    use std::time::Duration;

    fn ns() -> Namespace {
        Namespace::from_bytes([9u8; 32])
    }

    fn read(root: Root, key: &str) -> GetRequest {
        GetRequest {
            tree: TreeId::at_root(root),
            key: key.as_bytes().to_vec(),
        }
    }

    async fn seeded(slots: usize) -> (CachingBackend, Root) {
        let local = LocalBackend::open_temporary(LocalConfig::new(Keypair::generate())).unwrap();
        let cache = CachingBackend::new(Arc::new(local), CachingConfig { slots });
        let receipts = cache
            .apply_batch(
                &RequestContext::background(),
                ApplyBatchRequest {
                    namespace: ns(),
                    dst_round: 1,
                    ops: vec![ApplyOp {
                        src_round: 0,
                        src_root: Hash::empty(),
                        write_log: vec![LogEntry::insert("a", "1"), LogEntry::insert("b", "2")],
                    }],
                },
            )
            .await
            .unwrap();
        let hash = receipts[0].open().unwrap().roots[0];
        (
            cache,
            Root {
                namespace: ns(),
                round: 1,
                hash,
            },
        )
    }

    #[tokio::test]
    async fn repeated_read_hits_cache() {
        let (cache, root) = seeded(8).await;
        let ctx = RequestContext::background();

        let first = cache.get(&ctx, read(root, "a")).await.unwrap();
        let second = cache.get(&ctx, read(root, "a")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.value, Some(b"1".to_vec()));
        assert_eq!(cache.stats(), (1, 1));
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted() {
        let (cache, root) = seeded(1).await;
        let ctx = RequestContext::background();

        cache.get(&ctx, read(root, "a")).await.unwrap();
        cache.get(&ctx, read(root, "b")).await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.get(&ctx, read(root, "a")).await.unwrap();
        assert_eq!(cache.stats(), (0, 3));
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let (cache, _) = seeded(8).await;
        let bogus = Root {
            namespace: ns(),
            round: 4,
            hash: Hash::digest_bytes(b"unknown"),
        };
        let err = cache
            .get(&RequestContext::background(), read(bogus, "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownRoot(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cleanup_clears_and_closes_inner() {
        let (cache, root) = seeded(8).await;
        cache.get(&RequestContext::background(), read(root, "a")).await.unwrap();
        cache.cleanup();
        assert!(cache.is_empty());
        assert!(cache
            .get(&RequestContext::background(), read(root, "a"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn hits_stop_once_wrapped_client_shuts_down() {
        let key = Keypair::generate();
        let runtime = Keypair::generate().public_key();
        let address: Address = "127.0.0.1:9100".parse().unwrap();

        let registry = Arc::new(MemoryRegistry::new());
        registry.register_node(Node::storage_worker(key.public_key(), vec![address]));
        let transport = LocalTransport::new();
        let engine = LocalBackend::open_temporary(LocalConfig::new(key.clone())).unwrap();
        transport.serve(address, Arc::new(engine));
        let scheduler = MemoryScheduler::new();

        let client = StorageClient::new(
            ClientConfig {
                allow_unroutable_addresses: true,
                ..ClientConfig::default()
            },
            Arc::new(scheduler.clone()),
            registry,
            Arc::new(transport),
        );
        client.watch_runtime(runtime).unwrap();
        scheduler.publish(Committee::storage(runtime, 1, &[key.public_key()]));
        client
            .wait_initialized(&RequestContext::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        let cache = CachingBackend::new(Arc::new(client.clone()), CachingConfig::default());
        let request = read(
            Root {
                namespace: Namespace::from_runtime_id(&runtime),
                round: 0,
                hash: Hash::empty(),
            },
            "a",
        );
        let ctx = RequestContext::background();
        cache.get(&ctx, request.clone()).await.unwrap();
        cache.get(&ctx, request.clone()).await.unwrap();
        assert_eq!(cache.stats(), (1, 1));

        client.shutdown();
        assert!(matches!(
            cache.get(&ctx, request).await,
            Err(StorageError::Cancelled)
        ));
        assert_eq!(cache.stats(), (1, 2));
    }
}
