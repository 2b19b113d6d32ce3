//! # Node Registry
//!
//! Resolves node identities to descriptors. The storage client asks the
//! registry where each committee member can be reached and follows
//! re-registrations through [`RegistryBackend::watch_nodes`]; it never
//! writes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::common::{Address, Node};
use crate::crypto::PublicKey;
use crate::scheduler::Subscription;

/// Errors from registry lookups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node not found: {0}")]
    NodeNotFound(PublicKey),

    #[error("node {0} has no usable addresses")]
    NoAddresses(PublicKey),
}

/// Read access to registered nodes.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Looks up a node descriptor by identity.
    async fn lookup_node(&self, id: &PublicKey) -> Result<Node, RegistryError>;

    /// The addresses a node can be reached at.
    ///
    /// When `allow_unroutable` is false, reserved addresses are dropped and
    /// a node left with none is an error.
    async fn resolve_node_addresses(
        &self,
        id: &PublicKey,
        allow_unroutable: bool,
    ) -> Result<Vec<Address>, RegistryError> {
        let node = self.lookup_node(id).await?;
        let addresses = if allow_unroutable {
            node.addresses
        } else {
            node.routable_addresses()
        };
        if addresses.is_empty() {
            return Err(RegistryError::NoAddresses(*id));
        }
        Ok(addresses)
    }

    /// Streams every node descriptor registered from now on, including
    /// replacements of known nodes.
    fn watch_nodes(&self) -> (mpsc::UnboundedReceiver<Node>, Subscription);
}

#[derive(Default)]
struct Watchers {
    next_subscriber: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Node>>,
}

/// In-process registry backed by a concurrent map.
#[derive(Default)]
pub struct MemoryRegistry {
    nodes: DashMap<PublicKey, Node>,
    watchers: Arc<Mutex<Watchers>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a node descriptor and notifies every watcher.
    pub fn register_node(&self, node: Node) {
        debug!(node_id = %node.id, addresses = node.addresses.len(), "node registered");
        self.nodes.insert(node.id, node.clone());
        self.watchers
            .lock()
            .subscribers
            .retain(|_, tx| tx.send(node.clone()).is_ok());
    }

    /// Removes a node. Returns the old descriptor, if any.
    pub fn deregister_node(&self, id: &PublicKey) -> Option<Node> {
        let removed = self.nodes.remove(id).map(|(_, node)| node);
        if removed.is_some() {
            debug!(node_id = %id, "node deregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().subscribers.len()
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistry {
    async fn lookup_node(&self, id: &PublicKey) -> Result<Node, RegistryError> {
        self.nodes
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::NodeNotFound(*id))
    }

    fn watch_nodes(&self) -> (mpsc::UnboundedReceiver<Node>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watchers = self.watchers.lock();
        let id = watchers.next_subscriber;
        watchers.next_subscriber += 1;
        watchers.subscribers.insert(id, tx);
        drop(watchers);

        let weak = Arc::downgrade(&self.watchers);
        let subscription = Subscription::new(move || {
            if let Some(watchers) = weak.upgrade() {
                watchers.lock().subscribers.remove(&id);
            }
        });

        (rx, subscription)
    }
}
