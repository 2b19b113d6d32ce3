//! # Storage Transport
//!
//! How the storage client talks to committee members. A transport turns a
//! node descriptor into a [`StorageConnection`]; the client never sees what
//! is underneath.
//!
//! [`LocalTransport`] routes connections to backends in the same process.
//! Connections are lazy: `connect` always succeeds and an address with no
//! registered backend only fails once a call is made, the way a network
//! dial would.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

use super::api::{ApplyBatchRequest, Backend, GetRequest, GetResponse, Receipt, RequestContext};
use crate::common::{Address, Node};
use crate::crypto::PublicKey;

/// Errors from a single peer call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("peer call timed out")]
    TimedOut,

    #[error("peer rejected request: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,
}

/// A connection to one storage node.
#[async_trait]
pub trait StorageConnection: Send + Sync {
    /// Unique per established connection. A reconnect gets a new id.
    fn connection_id(&self) -> u64;

    fn node_id(&self) -> &PublicKey;

    async fn get(&self, request: GetRequest) -> Result<GetResponse, TransportError>;

    async fn apply_batch(&self, request: ApplyBatchRequest) -> Result<Vec<Receipt>, TransportError>;

    /// Closes the connection. Later calls fail with [`TransportError::Closed`].
    fn close(&self);
}

/// Opens connections to storage nodes.
#[async_trait]
pub trait StorageTransport: Send + Sync {
    async fn connect(
        &self,
        node: &Node,
        addresses: &[Address],
    ) -> Result<Arc<dyn StorageConnection>, TransportError>;
}

// ---------------------------------------------------------------------------
// LocalTransport
// ---------------------------------------------------------------------------

/// In-process transport: addresses map to backends registered with
/// [`LocalTransport::serve`].
#[derive(Clone, Default)]
pub struct LocalTransport {
    endpoints: Arc<DashMap<Address, Arc<dyn Backend>>>,
    next_connection: Arc<AtomicU64>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `backend` at `address`, replacing whatever was there.
    pub fn serve(&self, address: Address, backend: Arc<dyn Backend>) {
        self.endpoints.insert(address, backend);
    }

    /// Stops serving at `address`. Open connections start failing.
    pub fn stop_serving(&self, address: &Address) {
        self.endpoints.remove(address);
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.next_connection.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageTransport for LocalTransport {
    async fn connect(
        &self,
        node: &Node,
        addresses: &[Address],
    ) -> Result<Arc<dyn StorageConnection>, TransportError> {
        if addresses.is_empty() {
            return Err(TransportError::Unreachable(format!(
                "node {} has no addresses",
                node.id
            )));
        }
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(node_id = %node.id, connection_id = id, "local connection opened");
        Ok(Arc::new(LocalConnection {
            id,
            node_id: node.id,
            addresses: addresses.to_vec(),
            endpoints: Arc::clone(&self.endpoints),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalConnection {
    id: u64,
    node_id: PublicKey,
    addresses: Vec<Address>,
    endpoints: Arc<DashMap<Address, Arc<dyn Backend>>>,
    closed: AtomicBool,
}

impl LocalConnection {
    fn endpoint(&self) -> Result<Arc<dyn Backend>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.addresses
            .iter()
            .find_map(|addr| self.endpoints.get(addr).map(|e| Arc::clone(e.value())))
            .ok_or_else(|| {
                TransportError::Unreachable(format!("no endpoint for node {}", self.node_id))
            })
    }
}

#[async_trait]
impl StorageConnection for LocalConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn node_id(&self) -> &PublicKey {
        &self.node_id
    }

    async fn get(&self, request: GetRequest) -> Result<GetResponse, TransportError> {
        let backend = self.endpoint()?;
        backend
            .get(&RequestContext::background(), request)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn apply_batch(
        &self,
        request: ApplyBatchRequest,
    ) -> Result<Vec<Receipt>, TransportError> {
        let backend = self.endpoint()?;
        backend
            .apply_batch(&RequestContext::background(), request)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            trace!(node_id = %self.node_id, connection_id = self.id, "local connection closed");
        }
    }
}
