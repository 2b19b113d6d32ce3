//! # Backend Selector
//!
//! Builds the storage backend a node runs with from its configuration.
//!
//! ```text
//!  local          LocalBackend (sled)
//!  client         StorageClient
//!  cachingclient  CachingBackend(StorageClient)
//!
//!  then, in order:  CrashingBackend   (if crash_enabled)
//!                   MetricsBackend    (always)
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::api::{Backend, StorageError};
use super::caching::{CachingBackend, CachingConfig};
use super::client::{self, ClientConfig, StorageClient};
use super::crashing::CrashingBackend;
use super::local::{self, DbError, LocalBackend, LocalConfig};
use super::metrics::{MetricsBackend, StorageMetrics};
use super::transport::StorageTransport;
use crate::config::DEFAULT_ROOT_CACHE_SLOTS;
use crate::crypto::{Hash, Keypair, PublicKey};
use crate::registry::RegistryBackend;
use crate::scheduler::SchedulerBackend;

/// Name of the caching client variant.
pub const CACHING_CLIENT_BACKEND_NAME: &str = "cachingclient";

/// Seed material for the debug mock signing key. Every node using it signs
/// with the same well-known key.
const DEBUG_MOCK_SIGNING_SEED: &[u8] = b"shardstore: debug mock signing key";

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("unsupported storage backend: {0}")]
    UnsupportedBackend(String),

    #[error("local storage backend requires a signing key")]
    MissingSigner,

    #[error("{0} storage backend requires a runtime id")]
    MissingRuntime(BackendKind),

    #[error("failed to open local storage: {0}")]
    Db(#[from] DbError),

    #[error("failed to start storage client: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to register storage metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Which backend to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Local,
    Client,
    CachingClient,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local => local::BACKEND_NAME,
            Self::Client => client::BACKEND_NAME,
            Self::CachingClient => CACHING_CLIENT_BACKEND_NAME,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            local::BACKEND_NAME => Ok(Self::Local),
            client::BACKEND_NAME => Ok(Self::Client),
            CACHING_CLIENT_BACKEND_NAME => Ok(Self::CachingClient),
            other => Err(SelectorError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Storage settings of a node.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Where the local engine keeps its database. `None` uses a temporary
    /// database that is removed on drop.
    pub data_dir: Option<PathBuf>,
    /// Key the local engine signs receipts with.
    pub signer: Option<Keypair>,
    /// INSECURE: sign receipts with a fixed, publicly known key when no
    /// signer is configured.
    pub debug_mock_signing_key: bool,
    /// Wrap the backend in a [`CrashingBackend`].
    pub crash_enabled: bool,
    /// Read cache size of the caching client.
    pub root_cache_slots: usize,
    /// INSECURE: let the local engine accept writes on unknown roots.
    pub insecure_skip_checks: bool,
    pub client: ClientConfig,
    /// Runtime whose storage committee the client follows.
    pub runtime_id: Option<PublicKey>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Client,
            data_dir: None,
            signer: None,
            debug_mock_signing_key: false,
            crash_enabled: false,
            root_cache_slots: DEFAULT_ROOT_CACHE_SLOTS,
            insecure_skip_checks: false,
            client: ClientConfig::default(),
            runtime_id: None,
        }
    }
}

impl StorageConfig {
    fn signer(&self) -> Result<Keypair, SelectorError> {
        if let Some(signer) = &self.signer {
            return Ok(signer.clone());
        }
        if self.debug_mock_signing_key {
            warn!("using the debug mock signing key for storage receipts");
            return Ok(debug_mock_signer());
        }
        Err(SelectorError::MissingSigner)
    }
}

/// The fixed key used when `debug_mock_signing_key` is set.
pub fn debug_mock_signer() -> Keypair {
    Keypair::from_seed(Hash::digest_bytes(DEBUG_MOCK_SIGNING_SEED).as_bytes())
}

/// Collaborators the client backends need.
#[derive(Clone)]
pub struct Collaborators {
    pub scheduler: Arc<dyn SchedulerBackend>,
    pub registry: Arc<dyn RegistryBackend>,
    pub transport: Arc<dyn StorageTransport>,
}

/// A built backend. `client` is set for the client variants so callers can
/// inspect its connections.
pub struct SelectedBackend {
    pub kind: BackendKind,
    pub backend: Arc<dyn Backend>,
    pub client: Option<StorageClient>,
}

/// Builds the configured backend.
///
/// Client variants start watching `config.runtime_id` right away, so this
/// must be called from within a tokio runtime.
pub fn new_backend(
    config: &StorageConfig,
    collaborators: &Collaborators,
    metrics: StorageMetrics,
) -> Result<SelectedBackend, SelectorError> {
    let kind = config.backend;
    let (base, client): (Arc<dyn Backend>, Option<StorageClient>) = match kind {
        BackendKind::Local => {
            let mut local_config = LocalConfig::new(config.signer()?);
            local_config.insecure_skip_checks = config.insecure_skip_checks;
            if config.insecure_skip_checks {
                warn!("local storage accepts writes on unknown roots");
            }
            let engine = match &config.data_dir {
                Some(dir) => LocalBackend::open(dir.join(local::DB_DIR), local_config)?,
                None => LocalBackend::open_temporary(local_config)?,
            };
            (Arc::new(engine), None)
        }
        BackendKind::Client | BackendKind::CachingClient => {
            let runtime_id = config.runtime_id.ok_or(SelectorError::MissingRuntime(kind))?;
            let client = StorageClient::new(
                config.client.clone(),
                Arc::clone(&collaborators.scheduler),
                Arc::clone(&collaborators.registry),
                Arc::clone(&collaborators.transport),
            );
            client.watch_runtime(runtime_id)?;

            let backend: Arc<dyn Backend> = if kind == BackendKind::CachingClient {
                Arc::new(CachingBackend::new(
                    Arc::new(client.clone()),
                    CachingConfig {
                        slots: config.root_cache_slots,
                    },
                ))
            } else {
                Arc::new(client.clone())
            };
            (backend, Some(client))
        }
    };

    let backend: Arc<dyn Backend> = if config.crash_enabled {
        warn!(backend = %kind, "storage crash injection enabled");
        Arc::new(CrashingBackend::new(base))
    } else {
        base
    };
    let backend = Arc::new(MetricsBackend::new(backend, kind.name(), metrics));

    info!(backend = %kind, crash_enabled = config.crash_enabled, "storage backend selected");
    Ok(SelectedBackend {
        kind,
        backend,
        client,
    })
}
