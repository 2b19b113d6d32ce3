//! # CLI Interface
//!
//! Command-line arguments of `shardstore-node`, defined with `clap` derive.
//! Every `run` flag can also be set through its `SHARDSTORE_*` environment
//! variable.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Shardstore node.
///
/// Runs the configured storage backend against an in-process committee and
/// serves Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "shardstore-node",
    about = "Shardstore storage node",
    version,
    propagate_version = true
)]
pub struct ShardstoreNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory and generate a storage signing key.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Node data directory. The local backend keeps its database here and
    /// the signing key is read from `storage.key` inside it.
    #[arg(long, short = 'd', env = "SHARDSTORE_DATA_DIR", default_value = ".shardstore")]
    pub data_dir: PathBuf,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "SHARDSTORE_METRICS_PORT", default_value_t = 9742)]
    pub metrics_port: u16,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "SHARDSTORE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Storage backend: `local`, `client` or `cachingclient`.
    #[arg(long, env = "SHARDSTORE_STORAGE_BACKEND", default_value = "client")]
    pub storage_backend: String,

    /// Inject random crashes into storage calls. Test networks only.
    #[arg(long, env = "SHARDSTORE_CRASH_ENABLED")]
    pub crash_enabled: bool,

    /// Read results kept by the caching client.
    #[arg(long, env = "SHARDSTORE_ROOT_CACHE_SLOTS", default_value_t = 1000)]
    pub root_cache_slots: usize,

    /// INSECURE: let the local backend accept writes on unknown roots.
    #[arg(long, env = "SHARDSTORE_INSECURE_SKIP_CHECKS")]
    pub insecure_skip_checks: bool,

    /// INSECURE: sign receipts with a fixed, publicly known key.
    #[arg(long, env = "SHARDSTORE_DEBUG_MOCK_SIGNING_KEY")]
    pub debug_mock_signing_key: bool,

    /// Hex-encoded Ed25519 storage signing key.
    ///
    /// Overrides `storage.key` in the data directory. Never pass this flag
    /// in production.
    #[arg(long, env = "SHARDSTORE_SIGNING_KEY")]
    pub signing_key: Option<String>,

    /// Deadline for one storage client call, in milliseconds.
    #[arg(long, env = "SHARDSTORE_REQUEST_TIMEOUT_MS", default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Write acknowledgements required: `all`, `majority` or a member count.
    #[arg(long, env = "SHARDSTORE_WRITE_POLICY", default_value = "majority")]
    pub write_policy: String,

    /// Hex-encoded runtime id whose storage committee the client follows.
    /// A random one is generated when omitted.
    #[arg(long, env = "SHARDSTORE_RUNTIME_ID")]
    pub runtime_id: Option<String>,

    /// Storage nodes started in-process to form the runtime's committee.
    #[arg(long, env = "SHARDSTORE_LOCAL_COMMITTEE_SIZE", default_value_t = 3)]
    pub local_committee_size: usize,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "SHARDSTORE_DATA_DIR", default_value = ".shardstore")]
    pub data_dir: PathBuf,

    /// Replace an existing signing key.
    #[arg(long)]
    pub force: bool,
}
