//! WolfVolCtl - Command line tool for managing WolfVol nodes
//!
//! Usage:
//!   wolfvolctl status                       - Show local node status
//!   wolfvolctl volumes                      - List catalog entries and owners
//!   wolfvolctl migrate alice --from A --to B - Move a volume between nodes

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;

use wolfvol::config::TransferConfig;
use wolfvol::transfer::{peer_url, PullOutcome, TransferClient, TransferStream};
use wolfvol::volume::VolumeName;
use wolfvol::WolfVolConfig;

/// WolfVol Control Tool
#[derive(Parser)]
#[command(name = "wolfvolctl")]
#[command(about = "Control and monitor WolfVol storage nodes", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfvol/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the node
    Status,
    /// List volumes in the catalog with their owners
    Volumes,
    /// List sealed snapshots of a volume
    Snapshots { volume: String },
    /// Create a volume, or an overlay of an existing one
    Create {
        volume: String,
        /// Borrow the storage of this volume instead of creating new storage
        #[arg(long)]
        overlay: Option<String>,
        /// Start as a copy of this volume
        #[arg(long)]
        template: Option<String>,
    },
    /// Mount a volume on the node, pulling it from its owner if needed
    Mount {
        volume: String,
        /// Pull from this peer instead of the recorded owner
        #[arg(long)]
        from: Option<String>,
    },
    /// Seal a volume so other nodes can take it over
    Unmount { volume: String },
    /// Remove a volume entry (and its storage unless it is an overlay)
    Remove { volume: String },
    /// Move a volume from one node to another
    Migrate {
        volume: String,
        /// Source node (e.g., 10.0.10.11:4000 or http://storage-1:4000)
        #[arg(long)]
        from: String,
        /// Destination node (defaults to the endpoint)
        #[arg(long)]
        to: Option<String>,
    },
    /// Save a volume's current state to a stream file
    Export {
        volume: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Apply a stream file to a volume
    Import {
        volume: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node_id: String,
    host: String,
    backend: String,
    volumes: usize,
    active_here: usize,
    #[serde(default)]
    receives: Vec<ReceiveStatus>,
    uptime_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ReceiveStatus {
    volume: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct VolumeEntry {
    name: String,
    target: Option<String>,
    created_at: String,
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotListResponse {
    volume: String,
    current: Option<String>,
    snapshots: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MountResponse {
    mountpoint: String,
}

#[derive(Debug, Deserialize)]
struct UnmountResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = resolve_endpoint(cli.endpoint.as_deref(), &cli.config);

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Volumes => list_volumes(&endpoint).await,
        Commands::Snapshots { volume } => list_snapshots(&endpoint, volume).await,
        Commands::Create {
            volume,
            overlay,
            template,
        } => create_volume(&endpoint, volume, overlay.as_deref(), template.as_deref()).await,
        Commands::Mount { volume, from } => mount(&endpoint, volume, from.as_deref()).await,
        Commands::Unmount { volume } => unmount(&endpoint, volume).await,
        Commands::Remove { volume } => remove(&endpoint, volume).await,
        Commands::Migrate { volume, from, to } => {
            migrate(volume, from, to.as_deref().unwrap_or(&endpoint)).await
        }
        Commands::Export { volume, output } => export(&endpoint, volume, output).await,
        Commands::Import { volume, file } => import(&endpoint, volume, file).await,
        Commands::CheckConfig { file } => {
            let config_path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&config_path)
        }
    };

    if let Err(e) = result {
        eprintln!("\x1b[1;31mError:\x1b[0m {:#}", e);
        std::process::exit(1);
    }
}

/// Endpoint from the flag, else the config's API address, else the default port
fn resolve_endpoint(flag: Option<&str>, config: &Path) -> String {
    if let Some(endpoint) = flag {
        return peer_url(endpoint, "");
    }

    let bind = std::fs::read_to_string(config)
        .ok()
        .and_then(|content| WolfVolConfig::from_str(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(|| "127.0.0.1:4000".to_string());

    // Convert bind address to localhost if it's 0.0.0.0
    match bind.strip_prefix("0.0.0.0:") {
        Some(port) => format!("http://127.0.0.1:{}", port),
        None => peer_url(&bind, ""),
    }
}

fn client() -> anyhow::Result<TransferClient> {
    let timeouts = TransferConfig::default();
    Ok(TransferClient::new(
        Duration::from_secs(timeouts.connect_timeout_secs),
        Duration::from_secs(timeouts.request_timeout_secs),
    )?)
}

fn volume_name(volume: &str) -> anyhow::Result<VolumeName> {
    VolumeName::new(volume).with_context(|| format!("invalid volume name '{}'", volume))
}

/// Turn a non-success response into an error carrying the API's message
async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    bail!("API error ({}): {}", status, message.trim())
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> anyhow::Result<()> {
    let response = reqwest::get(format!("{}/_status", endpoint)).await?;
    let status: StatusResponse = check(response).await?.json().await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node ID:      {}", status.node_id);
    println!("Host:         {}", status.host);
    println!("Backend:      {}", status.backend);
    println!("Volumes:      {} ({} active here)", status.volumes, status.active_here);
    println!("Uptime:       {}", format_duration(status.uptime_seconds));
    if !status.receives.is_empty() {
        println!();
        println!("Receiving:");
        for receive in &status.receives {
            println!("  {:<24} \x1b[33m{}\x1b[0m", receive.volume, receive.state);
        }
    }
    println!();

    Ok(())
}

async fn list_volumes(endpoint: &str) -> anyhow::Result<()> {
    let response = reqwest::get(format!("{}/_volumes", endpoint)).await?;
    let volumes: Vec<VolumeEntry> = check(response).await?.json().await?;

    println!();
    println!("{:<24} {:<24} {:<22} {:<26}", "NAME", "OVERLAY OF", "OWNER", "CREATED");
    println!("{}", "-".repeat(96));
    for volume in &volumes {
        let owner_padded = format!("{:<22}", volume.owner.as_deref().unwrap_or("-"));
        let owner_colored = match volume.owner {
            Some(_) => format!("\x1b[32m{}\x1b[0m", owner_padded),
            None => owner_padded,
        };
        println!(
            "{:<24} {:<24} {} {:<26}",
            volume.name,
            volume.target.as_deref().unwrap_or("-"),
            owner_colored,
            volume.created_at
        );
    }
    println!();
    println!("Total: {} volumes", volumes.len());

    Ok(())
}

async fn list_snapshots(endpoint: &str, volume: &str) -> anyhow::Result<()> {
    let name = volume_name(volume)?;
    let response = reqwest::get(format!("{}/_snapshots/{}", endpoint, name)).await?;
    let list: SnapshotListResponse = check(response).await?.json().await?;

    println!();
    println!("Snapshots of {}", list.volume);
    println!();
    for token in &list.snapshots {
        if list.current.as_deref() == Some(token.as_str()) {
            println!("  \x1b[1;32m{}\x1b[0m  (current)", token);
        } else {
            println!("  {}", token);
        }
    }
    if list.snapshots.is_empty() {
        println!("  (none sealed yet)");
    }
    println!();

    Ok(())
}

async fn create_volume(
    endpoint: &str,
    volume: &str,
    overlay: Option<&str>,
    template: Option<&str>,
) -> anyhow::Result<()> {
    let response = reqwest::Client::new()
        .post(format!("{}/_volumes", endpoint))
        .json(&json!({
            "name": volume,
            "overlay_target": overlay,
            "template": template,
        }))
        .send()
        .await?;
    check(response).await?;

    match overlay {
        Some(target) => println!("\x1b[1;32m✓\x1b[0m Created {} as an overlay of {}", volume, target),
        None => println!("\x1b[1;32m✓\x1b[0m Created {}", volume),
    }
    Ok(())
}

async fn mount(endpoint: &str, volume: &str, from: Option<&str>) -> anyhow::Result<()> {
    let name = volume_name(volume)?;
    let response = reqwest::Client::new()
        .post(format!("{}/_volumes/{}/mount", endpoint, name))
        .json(&json!({ "from": from }))
        .send()
        .await?;
    let mounted: MountResponse = check(response).await?.json().await?;

    println!("{}", mounted.mountpoint);
    Ok(())
}

async fn unmount(endpoint: &str, volume: &str) -> anyhow::Result<()> {
    let name = volume_name(volume)?;
    let response = reqwest::Client::new()
        .post(format!("{}/_volumes/{}/unmount", endpoint, name))
        .send()
        .await?;
    let sealed: UnmountResponse = check(response).await?.json().await?;

    println!("\x1b[1;32m✓\x1b[0m {} sealed at {}", name, sealed.token);
    Ok(())
}

async fn remove(endpoint: &str, volume: &str) -> anyhow::Result<()> {
    let name = volume_name(volume)?;
    let response = reqwest::Client::new()
        .delete(format!("{}/_volumes/{}", endpoint, name))
        .send()
        .await?;
    check(response).await?;

    println!("\x1b[1;32m✓\x1b[0m Removed {}", name);
    Ok(())
}

async fn migrate(volume: &str, from: &str, to: &str) -> anyhow::Result<()> {
    let name = volume_name(volume)?;
    println!("Migrating {} from {} to {}...", name, from, to);

    let token = client()?
        .migrate(from, to, &name)
        .await
        .with_context(|| format!("migration of {} failed", name))?;

    println!("\x1b[1;32m✓\x1b[0m {} is at {} on {}", name, token, to);
    println!("Mount it there to take ownership.");
    Ok(())
}

async fn export(endpoint: &str, volume: &str, output: &Path) -> anyhow::Result<()> {
    let name = volume_name(volume)?;
    let stream = match client()?.pull(endpoint, &name, &[], None).await? {
        PullOutcome::Stream(stream) => stream,
        PullOutcome::NotModified => bail!("node answered not-modified to an unconditional pull"),
    };

    let encoded = stream.encode()?;
    std::fs::write(output, &encoded)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "\x1b[1;32m✓\x1b[0m Exported {} at {} ({} bytes) to {}",
        name,
        stream.token(),
        encoded.len(),
        output.display()
    );
    Ok(())
}

async fn import(endpoint: &str, volume: &str, file: &Path) -> anyhow::Result<()> {
    let name = volume_name(volume)?;
    let data = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let stream = TransferStream::decode(data.into())
        .with_context(|| format!("{} is not a volume stream", file.display()))?;

    let message = client()?.push(endpoint, &name, &stream).await?;
    println!("\x1b[1;32m✓\x1b[0m {}", message.trim());
    Ok(())
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    println!();
    println!("\x1b[1;36mWolfVol Configuration Check\x1b[0m");
    println!();

    if !path.exists() {
        println!("\x1b[1;31m✗ ERROR:\x1b[0m Config file not found: {}", path.display());
        return Ok(());
    }
    println!("\x1b[1;32m✓\x1b[0m Config file: {}", path.display());

    let content = std::fs::read_to_string(path)?;
    let config = match WolfVolConfig::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            println!("\x1b[1;31m✗ ERROR:\x1b[0m {}", e);
            return Ok(());
        }
    };
    println!("\x1b[1;32m✓\x1b[0m Node ID: {}", config.node.id);

    let mut warnings = Vec::new();
    let addr = config.host();
    if addr.starts_with("0.0.0.0") || addr.starts_with("127.") || addr.starts_with("localhost") {
        warnings.push(format!(
            "[node] advertise_address '{}' is not reachable from other nodes",
            addr
        ));
    } else {
        println!("\x1b[1;32m✓\x1b[0m Advertise address: {}", addr);
    }

    let root = config.storage_root();
    if root.is_dir() {
        println!("\x1b[1;32m✓\x1b[0m Storage root: {} ({})", root.display(), config.storage.backend);
    } else {
        warnings.push(format!("[storage] root {} does not exist yet", root.display()));
    }

    if config.api.max_body_mb < 64 {
        warnings.push(format!(
            "[api] max_body_mb = {} will reject full streams of most volumes",
            config.api.max_body_mb
        ));
    }

    println!();
    if warnings.is_empty() {
        println!("\x1b[1;32mConfiguration OK\x1b[0m");
    } else {
        for warning in &warnings {
            println!("\x1b[1;33m⚠ WARNING:\x1b[0m {}", warning);
        }
    }
    println!();

    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    } else if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}
