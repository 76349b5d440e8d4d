//! WolfVol - Snapshot-based volume migration between storage nodes
//!
//! Runs the transfer and admin API for one storage pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfvol::api::{AppState, HttpServer};
use wolfvol::config::{BackendKind, WolfVolConfig};
use wolfvol::error::{Error, Result};
use wolfvol::guard;
use wolfvol::lifecycle::VolumeLifecycle;
use wolfvol::snapshot::{backend_for, SnapshotManager, StorageLayout};
use wolfvol::transfer::{peer_url, Receiver, TransferClient};

/// WolfVol - Snapshot-based volume migration between storage nodes
#[derive(Parser)]
#[command(name = "wolfvol")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfvol.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfVol node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfvol.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Address peers use to reach this node
        #[arg(long, default_value = "127.0.0.1:4000")]
        advertise: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Query a running node's status
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:4000")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config-driven logging when the file is readable, CLI flag wins
    let logging = WolfVolConfig::from_file(&cli.config).ok().map(|c| c.logging);
    let level = cli
        .log_level
        .clone()
        .or_else(|| logging.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = logging
        .map(|l| l.format)
        .unwrap_or_else(|| "pretty".to_string());
    init_logging(&level, &format);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init {
            output,
            node_id,
            advertise,
        } => run_init(output, node_id, advertise),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Status { address } => run_status(address).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the WolfVol node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfVol node...");

    let config = match WolfVolConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if config.storage.backend == BackendKind::Btrfs && !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("Not running as root; btrfs subvolume operations will likely fail");
    }

    let layout = StorageLayout::new(config.storage_root().clone());
    let backend = backend_for(config.storage.backend);

    // Validate the pool and open the catalog under the storage lock
    let catalog = {
        let pool = layout.clone();
        let backend = Arc::clone(&backend);
        let catalog_path = config.catalog_path();
        let timeout = config.lock_timeout();
        let result = tokio::task::spawn_blocking(move || {
            guard::initialize(&pool, backend.as_ref(), &catalog_path, timeout)
        })
        .await?;

        match result {
            Ok(catalog) => Arc::new(catalog),
            Err(e) => {
                tracing::error!("Failed to initialize storage pool {:?}: {}", layout.root(), e);
                if e.is_fatal() {
                    tracing::error!("Check that {:?} is writable and, for btrfs, a btrfs mount", layout.root());
                }
                return Err(e);
            }
        }
    };

    let manager = SnapshotManager::new(layout, backend, config.storage.keep_snapshots);
    let receiver = Receiver::new(manager.clone(), Arc::clone(&catalog), config.host());
    let client = match TransferClient::new(config.connect_timeout(), config.request_timeout()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to create transfer client: {}", e);
            return Err(e);
        }
    };
    let lifecycle = VolumeLifecycle::new(
        manager.clone(),
        Arc::clone(&catalog),
        receiver.clone(),
        client,
        config.host(),
    );

    let volumes = manager.list_volumes().await?;
    tracing::info!(
        "Storage pool holds {} volume(s), advertising as {}",
        volumes.len(),
        config.host()
    );

    let http_server = HttpServer::new(
        config.api.clone(),
        AppState {
            node_id: config.node.id.clone(),
            host: config.host().to_string(),
            manager,
            receiver,
            catalog,
            lifecycle,
            started_at: Instant::now(),
        },
    );

    tokio::select! {
        result = http_server.start() => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    tracing::info!("WolfVol node stopped");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String, advertise: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfVol Configuration
# Generated configuration file

[node]
id = "{node_id}"
# Address other nodes use to reach this node's transfer API
advertise_address = "{advertise}"

[storage]
root = "/var/lib/wolfvol"
# btrfs or plain
backend = "btrfs"
keep_snapshots = 8
lock_timeout_ms = 30000

[catalog]
# path = "/var/lib/wolfvol/catalog.db"

[api]
bind_address = "0.0.0.0:4000"
max_body_mb = 4096
cors_enabled = false

[transfer]
connect_timeout_secs = 10
request_timeout_secs = 600

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point storage.root at your btrfs pool.");
    println!("Then start with: wolfvol --config {} start", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfVolConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Advertise: {}", config.host());
            println!("  API: {}", config.api.bind_address);
            println!(
                "  Storage: {} ({})",
                config.storage_root().display(),
                config.storage.backend
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfVolConfig::from_file(&config_path)?;

    println!("WolfVol Node Information");
    println!("========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Advertise:        {}", config.host());
    println!("API Address:      {}", config.api.bind_address);
    println!();
    println!("Storage Configuration:");
    println!("  Root:           {}", config.storage_root().display());
    println!("  Backend:        {}", config.storage.backend);
    println!("  Keep:           {} snapshots", config.storage.keep_snapshots);
    println!("  Catalog:        {}", config.catalog_path().display());
    println!();
    println!("Transfer Configuration:");
    println!("  Connect:        {} s", config.transfer.connect_timeout_secs);
    println!("  Request:        {} s", config.transfer.request_timeout_secs);
    println!("  Max Body:       {} MB", config.api.max_body_mb);

    Ok(())
}

/// Query a running node's status
async fn run_status(address: String) -> Result<()> {
    let url = peer_url(&address, "/_status");

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            let pretty = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", pretty);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}
