//! # Replicated Storage Client
//!
//! Talks to the storage committee of one runtime. The client follows the
//! committee through a [`CommitteeWatcher`], keeps one connection per member
//! and spreads requests across them.
//!
//! ## Lifecycle
//!
//! ```text
//! new() ──► Uninitialized ──watch_runtime()──► Initializing
//!                                                   │ first non-empty committee
//!                                                   ▼
//!                      shutdown() ◄──────────────  Ready  ◄──┐
//!                          │                         │       │ committee update
//!                          ▼                         └───────┘ (diff + swap)
//!                      Shut down
//! ```
//!
//! Until the first committee arrives every call fails immediately with
//! [`StorageError::StorageNotAvailable`]. Callers that would rather block
//! use [`StorageClient::wait_initialized`].
//!
//! ## Connection set
//!
//! The connection set is an immutable snapshot behind a `RwLock`. Dispatch
//! clones the current `Arc` and releases the lock before awaiting anything.
//! The single update task builds the next set outside the lock (reusing the
//! connection of every member that stays) and swaps it in one write. A call
//! therefore sees either the old set or the new one, never a mix.
//!
//! A member the client cannot connect to when its committee arrives stays
//! pending. The update task retries pending members whenever the registry
//! reports a new descriptor for them and on every `reconnect_interval`
//! tick. A connected member that re-registers with different addresses is
//! reconnected and its old connection closed.
//!
//! ## Reads
//!
//! Peers are tried in random order, `read_redundancy` at a time. The first
//! response whose root echo matches the requested root wins. A response for
//! a different root is an integrity fault and is never retried against the
//! same peer.
//!
//! ## Writes
//!
//! Writes go to every connected member at once. Each member's receipts must
//! open, be signed by that member, and describe the requested namespace,
//! round and number of roots. Among the members that pass, the largest
//! group agreeing on the resulting roots is the accepted result; the write
//! succeeds once that group satisfies the [`WritePolicy`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::api::{
    ApplyBatchRequest, Backend, GetRequest, GetResponse, Initialized, Receipt, RequestContext,
    StorageError, StorageResult,
};
use super::transport::{StorageConnection, StorageTransport, TransportError};
use crate::common::{Address, Node};
use crate::config::{
    DEFAULT_PEER_ATTEMPT_TIMEOUT, DEFAULT_READ_REDUNDANCY, DEFAULT_RECONNECT_INTERVAL,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::crypto::{Hash, PublicKey};
use crate::registry::RegistryBackend;
use crate::scheduler::{Committee, CommitteeWatcher, SchedulerBackend, Subscription};

/// Name reported by the backend selector.
pub const BACKEND_NAME: &str = "client";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How many committee members must acknowledge a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WritePolicy {
    /// Every connected member.
    All,
    /// More than half of the connected members.
    Majority,
    /// At least this many members.
    AtLeast(usize),
}

impl WritePolicy {
    /// Acknowledgements required when `connected` members are connected.
    pub fn required(&self, connected: usize) -> usize {
        match self {
            Self::All => connected.max(1),
            Self::Majority => connected / 2 + 1,
            Self::AtLeast(n) => (*n).max(1),
        }
    }
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self::Majority
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Majority => f.write_str("majority"),
            Self::AtLeast(n) => write!(f, "{}", n),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid write policy '{0}': expected 'all', 'majority' or a member count")]
pub struct ParseWritePolicyError(String);

impl FromStr for WritePolicy {
    type Err = ParseWritePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "majority" => Ok(Self::Majority),
            other => other
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map(Self::AtLeast)
                .ok_or_else(|| ParseWritePolicyError(s.to_string())),
        }
    }
}

/// Storage client tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deadline for a whole call, across every peer attempt.
    pub request_timeout: Duration,
    /// Deadline for a single peer attempt on the read path.
    pub peer_attempt_timeout: Duration,
    /// Peers queried concurrently on the read path.
    pub read_redundancy: usize,
    pub write_policy: WritePolicy,
    /// Connect to members advertising only reserved addresses.
    pub allow_unroutable_addresses: bool,
    /// Period of reconnect attempts to members without a connection.
    pub reconnect_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            peer_attempt_timeout: DEFAULT_PEER_ATTEMPT_TIMEOUT,
            read_redundancy: DEFAULT_READ_REDUNDANCY,
            write_policy: WritePolicy::default(),
            allow_unroutable_addresses: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection set
// ---------------------------------------------------------------------------

/// A live connection to one committee member.
#[derive(Clone)]
struct PeerConnection {
    node: Node,
    connection: Arc<dyn StorageConnection>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("node_id", &self.node.id)
            .field("connection_id", &self.connection.connection_id())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
struct ConnectionSet {
    /// Epoch of the committee this set was built from.
    epoch: Option<u64>,
    /// Every member of that committee, connected or not.
    members: BTreeSet<PublicKey>,
    peers: BTreeMap<PublicKey, PeerConnection>,
}

impl ConnectionSet {
    /// Members without a connection.
    fn pending(&self) -> Vec<PublicKey> {
        self.members
            .iter()
            .filter(|id| !self.peers.contains_key(*id))
            .copied()
            .collect()
    }
}

/// Diagnostic view of one connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub node_id: PublicKey,
    pub connection_id: u64,
    pub addresses: Vec<Address>,
}

struct WatchHandle {
    runtime_id: PublicKey,
    // Held for their drop, which unsubscribes from the scheduler and the
    // registry.
    _watcher: CommitteeWatcher,
    _nodes: Subscription,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// StorageClient
// ---------------------------------------------------------------------------

/// Committee-aware storage client.
#[derive(Clone)]
pub struct StorageClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    scheduler: Arc<dyn SchedulerBackend>,
    registry: Arc<dyn RegistryBackend>,
    transport: Arc<dyn StorageTransport>,
    connections: RwLock<Arc<ConnectionSet>>,
    initialized: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    watching: Mutex<Option<WatchHandle>>,
}

impl StorageClient {
    /// Creates a client that is not yet tracking any runtime.
    pub fn new(
        config: ClientConfig,
        scheduler: Arc<dyn SchedulerBackend>,
        registry: Arc<dyn RegistryBackend>,
        transport: Arc<dyn StorageTransport>,
    ) -> Self {
        let (initialized, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                scheduler,
                registry,
                transport,
                connections: RwLock::new(Arc::new(ConnectionSet::default())),
                initialized,
                shutdown,
                watching: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Starts following the storage committee of `runtime_id`.
    ///
    /// Must be called from within a tokio runtime. A client follows at most
    /// one runtime.
    pub fn watch_runtime(&self, runtime_id: PublicKey) -> StorageResult<()> {
        let mut watching = self.inner.watching.lock();
        if self.inner.is_shut_down() {
            return Err(StorageError::Cancelled);
        }
        if let Some(handle) = watching.as_ref() {
            warn!(
                runtime_id = %runtime_id,
                watching = %handle.runtime_id,
                "storage client already watching a runtime"
            );
            return Err(StorageError::AlreadyWatching);
        }

        let (watcher, committees) =
            CommitteeWatcher::spawn(self.inner.scheduler.as_ref(), runtime_id);
        let (nodes, node_subscription) = self.inner.registry.watch_nodes();
        let task = tokio::spawn(run_updates(
            Arc::downgrade(&self.inner),
            committees,
            nodes,
            self.inner.shutdown.subscribe(),
            self.inner.config.reconnect_interval,
        ));
        *watching = Some(WatchHandle {
            runtime_id,
            _watcher: watcher,
            _nodes: node_subscription,
            task,
        });

        info!(runtime_id = %runtime_id, "storage client watching runtime");
        Ok(())
    }

    /// Nodes the client currently holds connections to.
    pub fn connected_nodes(&self) -> Vec<Node> {
        self.inner
            .snapshot()
            .peers
            .values()
            .map(|p| p.node.clone())
            .collect()
    }

    /// Connection ids per node, for diagnostics.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .snapshot()
            .peers
            .values()
            .map(|p| ConnectionInfo {
                node_id: p.node.id,
                connection_id: p.connection.connection_id(),
                addresses: p.node.addresses.clone(),
            })
            .collect()
    }

    /// Epoch of the committee the current connections were built from.
    pub fn committee_epoch(&self) -> Option<u64> {
        self.inner.snapshot().epoch
    }

    /// Blocks until the first committee is known.
    pub async fn wait_initialized(&self, ctx: &RequestContext) -> StorageResult<()> {
        let mut initialized = self.initialized();
        tokio::select! {
            ready = initialized.wait() => {
                if ready && !self.inner.is_shut_down() {
                    Ok(())
                } else {
                    Err(StorageError::Cancelled)
                }
            }
            _ = ctx.cancelled() => Err(StorageError::Cancelled),
            _ = self.inner.shutdown_signalled() => Err(StorageError::Cancelled),
            _ = ctx.expired() => Err(StorageError::StorageNotAvailable),
        }
    }

    /// Stops watching, closes every connection and fails all pending and
    /// future calls with [`StorageError::Cancelled`].
    ///
    /// The initialized signal drops back to `false`, so wrappers that answer
    /// from local state stop doing so.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        self.inner.initialized.send_replace(false);

        if let Some(handle) = self.inner.watching.lock().take() {
            handle.task.abort();
        }

        let old = std::mem::take(&mut *self.inner.connections.write());
        for peer in old.peers.values() {
            peer.connection.close();
        }
        info!(closed = old.peers.len(), "storage client shut down");
    }

    // -- Read path ----------------------------------------------------------

    async fn dispatch_get(
        &self,
        ctx: &RequestContext,
        request: GetRequest,
    ) -> StorageResult<GetResponse> {
        let peers = self.inner.dispatch_peers()?;
        let ctx = ctx
            .clone()
            .deadline_at(Instant::now() + self.inner.config.request_timeout);

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(StorageError::Cancelled),
            _ = self.inner.shutdown_signalled() => Err(StorageError::Cancelled),
            _ = ctx.expired() => Err(StorageError::Unavailable("deadline exceeded".into())),
            result = self.inner.read_from_peers(&ctx, peers, request) => result,
        }
    }

    // -- Write path ---------------------------------------------------------

    async fn dispatch_apply_batch(
        &self,
        ctx: &RequestContext,
        request: ApplyBatchRequest,
    ) -> StorageResult<Vec<Receipt>> {
        let peers = self.inner.dispatch_peers()?;
        let ctx = ctx
            .clone()
            .deadline_at(Instant::now() + self.inner.config.request_timeout);

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(StorageError::Cancelled),
            _ = self.inner.shutdown_signalled() => Err(StorageError::Cancelled),
            result = self.inner.write_to_peers(&ctx, peers, request) => result,
        }
    }
}

impl ClientInner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn snapshot(&self) -> Arc<ConnectionSet> {
        Arc::clone(&self.connections.read())
    }

    async fn shutdown_signalled(&self) {
        let mut rx = self.shutdown.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// Peers to dispatch a call to, in random order.
    fn dispatch_peers(&self) -> StorageResult<Vec<PeerConnection>> {
        if self.is_shut_down() {
            return Err(StorageError::Cancelled);
        }
        let snapshot = self.snapshot();
        if snapshot.peers.is_empty() {
            return Err(StorageError::StorageNotAvailable);
        }
        let mut peers: Vec<PeerConnection> = snapshot.peers.values().cloned().collect();
        peers.shuffle(&mut rand::thread_rng());
        Ok(peers)
    }

    async fn read_from_peers(
        &self,
        ctx: &RequestContext,
        peers: Vec<PeerConnection>,
        request: GetRequest,
    ) -> StorageResult<GetResponse> {
        let total = peers.len();
        let redundancy = self.config.read_redundancy.max(1);
        let attempt_timeout = self.config.peer_attempt_timeout;
        let expected_root = request.tree.root;

        let mut remaining = peers.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for peer in remaining.by_ref().take(redundancy) {
            in_flight.push(read_one(ctx.clone(), attempt_timeout, peer, request.clone()));
        }

        let mut integrity_faults = 0usize;
        let mut peer_errors = 0usize;
        while let Some((node_id, outcome)) = in_flight.next().await {
            match outcome {
                Ok(response) if response.root == expected_root => return Ok(response),
                Ok(response) => {
                    integrity_faults += 1;
                    warn!(
                        node_id = %node_id,
                        expected = ?expected_root,
                        got = ?response.root,
                        "storage node answered for a different root"
                    );
                }
                Err(e) => {
                    peer_errors += 1;
                    debug!(node_id = %node_id, error = %e, "storage read attempt failed");
                }
            }

            if let Some(peer) = remaining.next() {
                in_flight.push(read_one(ctx.clone(), attempt_timeout, peer, request.clone()));
            }
        }

        if integrity_faults > 0 {
            return Err(StorageError::VerificationFailed(format!(
                "{} of {} peers returned data for a different root",
                integrity_faults, total
            )));
        }
        Err(StorageError::Unavailable(format!(
            "all {} peers failed ({} errors)",
            total, peer_errors
        )))
    }

    async fn write_to_peers(
        &self,
        ctx: &RequestContext,
        peers: Vec<PeerConnection>,
        request: ApplyBatchRequest,
    ) -> StorageResult<Vec<Receipt>> {
        let required = self.config.write_policy.required(peers.len());
        let total = peers.len();

        let mut in_flight: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| write_one(ctx.clone(), peer, request.clone()))
            .collect();

        let mut peer_errors = 0usize;
        let mut verification_failures = 0usize;
        // Resulting roots -> (acknowledging nodes, their receipts).
        let mut groups: HashMap<Vec<Hash>, (Vec<PublicKey>, Vec<Receipt>)> = HashMap::new();

        while let Some((node_id, outcome)) = in_flight.next().await {
            let receipts = match outcome {
                Ok(receipts) => receipts,
                Err(e) => {
                    peer_errors += 1;
                    debug!(node_id = %node_id, error = %e, "storage write attempt failed");
                    continue;
                }
            };
            match check_receipts(&node_id, &request, &receipts) {
                Ok(roots) => {
                    let group = groups.entry(roots).or_default();
                    group.0.push(node_id);
                    group.1.extend(receipts);
                }
                Err(reason) => {
                    verification_failures += 1;
                    warn!(node_id = %node_id, reason = %reason, "storage receipt rejected");
                }
            }
        }

        let best = groups
            .into_iter()
            .max_by(|(a_roots, a), (b_roots, b)| {
                a.0.len().cmp(&b.0.len()).then_with(|| b_roots.cmp(a_roots))
            });
        let (acknowledged, receipts, dissenting) = match best {
            Some((_, (nodes, receipts))) => {
                let dissenting = total - peer_errors - verification_failures - nodes.len();
                (nodes.len(), receipts, dissenting)
            }
            None => (0, Vec::new(), 0),
        };
        if dissenting > 0 {
            warn!(dissenting, acknowledged, "storage nodes disagree on resulting roots");
        }

        if acknowledged >= required {
            debug!(
                namespace = %request.namespace,
                round = request.dst_round,
                acknowledged,
                required,
                "write accepted"
            );
            return Ok(receipts);
        }

        if acknowledged == 0 && peer_errors == 0 {
            return Err(StorageError::VerificationFailed(format!(
                "no valid receipt from {} peers",
                total
            )));
        }
        Err(StorageError::InsufficientReplicas {
            acknowledged,
            required,
        })
    }

    /// Applies one committee update to the connection set.
    async fn update_connections(&self, committee: Committee) {
        let current = self.snapshot();
        let members: BTreeSet<PublicKey> = committee.members.iter().map(|m| m.public_key).collect();

        let mut peers = BTreeMap::new();
        let mut opened = Vec::new();
        for member in &committee.members {
            let id = member.public_key;
            if peers.contains_key(&id) {
                continue;
            }
            if let Some(existing) = current.peers.get(&id) {
                peers.insert(id, existing.clone());
                continue;
            }
            match self.connect_member(&id).await {
                Ok(peer) => {
                    opened.push(Arc::clone(&peer.connection));
                    peers.insert(id, peer);
                }
                Err(e) => {
                    warn!(node_id = %id, error = %e, "failed to connect to storage node");
                }
            }
        }

        let removed: Vec<PeerConnection> = current
            .peers
            .iter()
            .filter(|(id, _)| !peers.contains_key(*id))
            .map(|(_, peer)| peer.clone())
            .collect();
        let connected = peers.len();
        let pending = members.len() - connected;

        {
            let mut connections = self.connections.write();
            if self.is_shut_down() {
                drop(connections);
                for conn in opened {
                    conn.close();
                }
                return;
            }
            *connections = Arc::new(ConnectionSet {
                epoch: Some(committee.valid_for),
                members,
                peers,
            });
        }

        for peer in &removed {
            peer.connection.close();
        }

        info!(
            runtime_id = %committee.runtime_id,
            epoch = committee.valid_for,
            members = committee.members.len(),
            connected,
            pending,
            opened = opened.len(),
            closed = removed.len(),
            "storage committee connections updated"
        );

        if !committee.members.is_empty() {
            let fired = self.initialized.send_if_modified(|ready| {
                if *ready {
                    false
                } else {
                    *ready = true;
                    true
                }
            });
            if fired {
                info!(runtime_id = %committee.runtime_id, "storage client initialized");
            }
        }
    }

    async fn connect_member(&self, id: &PublicKey) -> StorageResult<PeerConnection> {
        let node = self.registry.lookup_node(id).await?;
        let addresses = self
            .registry
            .resolve_node_addresses(id, self.config.allow_unroutable_addresses)
            .await?;
        let connection = self.transport.connect(&node, &addresses).await?;
        debug!(
            node_id = %id,
            connection_id = connection.connection_id(),
            "connected to storage node"
        );
        Ok(PeerConnection { node, connection })
    }

    /// Tries once more to connect every member still without a connection.
    async fn retry_pending(&self) {
        let pending = self.snapshot().pending();
        if pending.is_empty() {
            return;
        }

        let mut peers = Vec::new();
        for id in pending {
            match self.connect_member(&id).await {
                Ok(peer) => peers.push(peer),
                Err(e) => debug!(node_id = %id, error = %e, "storage node still unreachable"),
            }
        }
        self.install_peers(peers);
    }

    /// Handles a new registry descriptor for `node`.
    ///
    /// Members without a connection are connected. Connected members are
    /// reconnected only when their advertised addresses changed.
    async fn refresh_member(&self, node: Node) {
        let current = self.snapshot();
        if !current.members.contains(&node.id) {
            return;
        }
        if let Some(existing) = current.peers.get(&node.id) {
            if existing.node.addresses == node.addresses {
                return;
            }
        }

        match self.connect_member(&node.id).await {
            Ok(peer) => self.install_peers(vec![peer]),
            Err(e) => {
                warn!(node_id = %node.id, error = %e, "failed to connect to storage node");
            }
        }
    }

    /// Adds freshly opened connections to the current set.
    ///
    /// Connections replaced by one of `peers` are closed, as are those of
    /// peers that left the committee while they were being opened.
    fn install_peers(&self, peers: Vec<PeerConnection>) {
        if peers.is_empty() {
            return;
        }

        let mut installed = 0usize;
        let mut to_close = Vec::new();
        {
            let mut connections = self.connections.write();
            if self.is_shut_down() {
                drop(connections);
                for peer in peers {
                    peer.connection.close();
                }
                return;
            }
            let mut next = (**connections).clone();
            for peer in peers {
                if !next.members.contains(&peer.node.id) {
                    to_close.push(peer.connection);
                    continue;
                }
                if let Some(old) = next.peers.insert(peer.node.id, peer) {
                    to_close.push(old.connection);
                }
                installed += 1;
            }
            *connections = Arc::new(next);
        }

        for connection in &to_close {
            connection.close();
        }
        info!(installed, closed = to_close.len(), "storage node connections refreshed");
    }
}

/// Consumes committee updates in arrival order until shutdown. Between
/// them it follows registry updates and retries pending members.
async fn run_updates(
    inner: Weak<ClientInner>,
    mut committees: mpsc::UnboundedReceiver<Committee>,
    mut nodes: mpsc::UnboundedReceiver<Node>,
    mut shutdown: watch::Receiver<bool>,
    reconnect_interval: Duration,
) {
    // `interval` rejects a zero period.
    let mut reconnect = tokio::time::interval(reconnect_interval.max(Duration::from_millis(1)));
    reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut nodes_open = true;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            committee = committees.recv() => {
                let Some(committee) = committee else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.update_connections(committee).await;
            }
            node = nodes.recv(), if nodes_open => match node {
                Some(node) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.refresh_member(node).await;
                }
                None => nodes_open = false,
            },
            _ = reconnect.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.retry_pending().await;
            }
        }
    }
    debug!("storage client update task stopped");
}

async fn read_one(
    ctx: RequestContext,
    attempt_timeout: Duration,
    peer: PeerConnection,
    request: GetRequest,
) -> (PublicKey, Result<GetResponse, TransportError>) {
    let ctx = ctx.deadline_at(Instant::now() + attempt_timeout);
    let outcome = match ctx.deadline() {
        Some(deadline) => tokio::time::timeout_at(deadline, peer.connection.get(request))
            .await
            .unwrap_or(Err(TransportError::TimedOut)),
        None => peer.connection.get(request).await,
    };
    (peer.node.id, outcome)
}

async fn write_one(
    ctx: RequestContext,
    peer: PeerConnection,
    request: ApplyBatchRequest,
) -> (PublicKey, Result<Vec<Receipt>, TransportError>) {
    let outcome = match ctx.deadline() {
        Some(deadline) => tokio::time::timeout_at(deadline, peer.connection.apply_batch(request))
            .await
            .unwrap_or(Err(TransportError::TimedOut)),
        None => peer.connection.apply_batch(request).await,
    };
    (peer.node.id, outcome)
}

/// Validates one member's receipts and returns the roots they attest to.
fn check_receipts(
    node_id: &PublicKey,
    request: &ApplyBatchRequest,
    receipts: &[Receipt],
) -> Result<Vec<Hash>, String> {
    let mut attested: Option<Vec<Hash>> = None;
    for receipt in receipts {
        let body = receipt.open().map_err(|e| e.to_string())?;
        if receipt.signer() != node_id {
            return Err(format!("receipt signed by {}", receipt.signer()));
        }
        if body.namespace != request.namespace {
            return Err("receipt has unexpected namespace".into());
        }
        if body.round != request.dst_round {
            return Err(format!(
                "receipt has unexpected round: expected {}, got {}",
                request.dst_round, body.round
            ));
        }
        if body.roots.len() != request.ops.len() {
            return Err(format!(
                "receipt has {} roots for {} ops",
                body.roots.len(),
                request.ops.len()
            ));
        }
        match &attested {
            Some(roots) if *roots != body.roots => {
                return Err("receipts from one node disagree".into());
            }
            Some(_) => {}
            None => attested = Some(body.roots),
        }
    }
    attested.ok_or_else(|| "no receipts".to_string())
}

#[async_trait]
impl Backend for StorageClient {
    async fn get(&self, ctx: &RequestContext, request: GetRequest) -> StorageResult<GetResponse> {
        self.dispatch_get(ctx, request).await
    }

    async fn apply_batch(
        &self,
        ctx: &RequestContext,
        request: ApplyBatchRequest,
    ) -> StorageResult<Vec<Receipt>> {
        self.dispatch_apply_batch(ctx, request).await
    }

    fn initialized(&self) -> Initialized {
        Initialized::new(self.inner.initialized.subscribe())
    }

    fn cleanup(&self) {
        self.shutdown();
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(handle) = self.watching.get_mut().take() {
            handle.task.abort();
        }
    }
}
