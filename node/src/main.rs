// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Shardstore Node
//!
//! Entry point for the `shardstore-node` binary. Parses CLI arguments,
//! initializes logging and metrics, builds the selected storage backend and
//! serves `/metrics` until shut down.
//!
//! - `run`     start the node
//! - `init`    initialize the data directory and generate a signing key
//! - `version` print build version information
//!
//! The node has no network scheduler or registry of its own. For the client
//! backends it starts a storage committee in-process and publishes it
//! through the in-memory scheduler, so the client follows a real committee
//! stream end to end.

mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use shardstore_protocol::common::{Address, Node};
use shardstore_protocol::crypto::{Keypair, PublicKey};
use shardstore_protocol::registry::MemoryRegistry;
use shardstore_protocol::scheduler::{Committee, MemoryScheduler};
use shardstore_protocol::storage::{
    new_backend, BackendKind, ClientConfig, Collaborators, LocalBackend, LocalConfig,
    LocalTransport, RequestContext, StorageClient, StorageConfig, WritePolicy,
};

use cli::{Commands, ShardstoreNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

/// File holding the hex-encoded storage signing key.
const SIGNING_KEY_FILE: &str = "storage.key";

/// First port handed to in-process committee members.
const LOCAL_COMMITTEE_BASE_PORT: u16 = 26_000;

/// How often connection gauges are refreshed.
const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ShardstoreNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Builds the storage backend and serves metrics until a shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "shardstore_node=info,shardstore_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    let backend_kind: BackendKind = args
        .storage_backend
        .parse()
        .context("invalid --storage-backend")?;
    let write_policy: WritePolicy = args
        .write_policy
        .parse()
        .context("invalid --write-policy")?;
    let runtime_id = match &args.runtime_id {
        Some(hex) => PublicKey::from_hex(hex).context("invalid --runtime-id")?,
        None => Keypair::generate().public_key(),
    };

    std::fs::create_dir_all(&args.data_dir).with_context(|| {
        format!("failed to create data directory: {}", args.data_dir.display())
    })?;
    let signer = load_signer(args.signing_key.as_deref(), &args.data_dir)?;

    tracing::info!(
        backend = %backend_kind,
        runtime_id = %runtime_id,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting shardstore-node"
    );

    // --- Collaborators ---
    let scheduler = MemoryScheduler::new();
    let registry = Arc::new(MemoryRegistry::new());
    let transport = LocalTransport::new();
    let collaborators = Collaborators {
        scheduler: Arc::new(scheduler.clone()),
        registry: registry.clone(),
        transport: Arc::new(transport.clone()),
    };

    let uses_client = backend_kind != BackendKind::Local;
    let local_committee = uses_client && args.local_committee_size > 0;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics")?);

    // --- Storage backend ---
    let config = StorageConfig {
        backend: backend_kind,
        data_dir: Some(args.data_dir.clone()),
        signer,
        debug_mock_signing_key: args.debug_mock_signing_key,
        crash_enabled: args.crash_enabled,
        root_cache_slots: args.root_cache_slots,
        insecure_skip_checks: args.insecure_skip_checks,
        client: ClientConfig {
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            write_policy,
            allow_unroutable_addresses: local_committee,
            ..ClientConfig::default()
        },
        runtime_id: Some(runtime_id),
    };
    let selected = new_backend(&config, &collaborators, node_metrics.storage.clone())
        .context("failed to build storage backend")?;

    if local_committee {
        let members = start_local_committee(args.local_committee_size, &registry, &transport)?;
        scheduler.publish(Committee::storage(runtime_id, 1, &members));
    }

    let ready_ctx = RequestContext::with_timeout(config.client.request_timeout);
    let mut initialized = selected.backend.initialized();
    tokio::select! {
        ready = initialized.wait() => {
            if ready {
                tracing::info!(backend = %backend_kind, "storage backend initialized");
            }
        }
        _ = ready_ctx.expired() => {
            tracing::warn!(
                backend = %backend_kind,
                "storage backend not initialized yet, continuing"
            );
        }
    }

    let gauges = selected
        .client
        .clone()
        .map(|client| tokio::spawn(refresh_gauges(client, Arc::clone(&node_metrics))));

    // --- Metrics server ---
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(metrics_listener, metrics::router(Arc::clone(&node_metrics))) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(task) = gauges {
        task.abort();
    }
    selected.backend.cleanup();
    tracing::info!("shardstore-node stopped");
    Ok(())
}

/// Starts `size` storage nodes in-process, registers them and returns their
/// identities.
fn start_local_committee(
    size: usize,
    registry: &MemoryRegistry,
    transport: &LocalTransport,
) -> Result<Vec<PublicKey>> {
    let mut members = Vec::with_capacity(size);
    for i in 0..size {
        let key = Keypair::generate();
        let id = key.public_key();
        let port = u16::try_from(i)
            .ok()
            .and_then(|i| LOCAL_COMMITTEE_BASE_PORT.checked_add(i))
            .context("local committee too large")?;
        let address: Address = format!("127.0.0.1:{}", port).parse()?;

        let engine = LocalBackend::open_temporary(LocalConfig::new(key))
            .context("failed to open committee member storage")?;
        transport.serve(address, Arc::new(engine));
        registry.register_node(Node::storage_worker(id, vec![address]));
        members.push(id);
    }
    tracing::info!(members = members.len(), "local storage committee started");
    Ok(members)
}

/// Mirrors the client's connection set into gauges.
async fn refresh_gauges(client: StorageClient, metrics: Arc<NodeMetrics>) {
    let mut interval = tokio::time::interval(GAUGE_REFRESH_INTERVAL);
    let mut last = String::new();
    loop {
        interval.tick().await;
        let connections = client.connections();
        metrics.connected_storage_nodes.set(connections.len() as i64);
        if let Some(epoch) = client.committee_epoch() {
            metrics.committee_epoch.set(epoch as i64);
        }

        match serde_json::to_string(&connections) {
            Ok(json) if json != last => {
                tracing::debug!(connections = %json, "storage connections changed");
                last = json;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to encode connections"),
        }
    }
}

/// Reads the signing key from `--signing-key` or the data directory.
fn load_signer(flag: Option<&str>, data_dir: &Path) -> Result<Option<Keypair>> {
    if let Some(hex) = flag {
        return Ok(Some(Keypair::from_hex(hex).context("invalid --signing-key")?));
    }
    let key_path = data_dir.join(SIGNING_KEY_FILE);
    if !key_path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&key_path)
        .with_context(|| format!("failed to read signing key from {}", key_path.display()))?;
    let keypair = Keypair::from_hex(contents.trim())
        .with_context(|| format!("malformed signing key in {}", key_path.display()))?;
    Ok(Some(keypair))
}

/// Initializes a data directory and generates a storage signing key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("shardstore_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = data_dir.join(SIGNING_KEY_FILE);
    if key_path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to replace it",
            key_path.display()
        );
    }

    let keypair = Keypair::generate();
    let public_key = keypair.public_key();
    std::fs::write(&key_path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write signing key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(
        public_key = %public_key,
        key_path = %key_path.display(),
        "storage signing key generated"
    );

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Signing key    : {}", key_path.display());
    println!("  Public key     : {}", public_key);

    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("shardstore-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol        {}", shardstore_protocol::config::PROTOCOL_VERSION);
    println!("rustc           {}", rustc_version());
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
