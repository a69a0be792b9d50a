//! WolfChat - Peer-to-peer group chat node
//!
//! Every room is ordered by the node that created it; the other nodes keep
//! replicas for their own clients.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfchat::api::ApiServer;
use wolfchat::config::{ChatConfig, LoggingConfig};
use wolfchat::error::{Error, Result};
use wolfchat::network::{NetworkServer, TcpPeerTransport};
use wolfchat::node::ChatNode;
use wolfchat::state::PeerRegistry;

/// Idle time after which pooled peer connections are closed
const PEER_CONNECTION_MAX_IDLE: Duration = Duration::from_secs(300);

/// WolfChat - Peer-to-peer group chat node
#[derive(Parser)]
#[command(name = "wolfchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfchat.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the chat node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfchat.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Query a running node's status
    Status {
        /// API address of the node
        #[arg(short, long, default_value = "localhost:8765")]
        address: String,
    },

    /// List rooms through a running node
    Rooms {
        /// API address of the node
        #[arg(short, long, default_value = "localhost:8765")]
        address: String,

        /// Include rooms administered by every reachable node
        #[arg(short, long)]
        global: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging follows the config file when it can be read
    let logging = ChatConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(&logging, cli.log_level.as_deref());

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Status { address } => run_get(&format!("http://{}/status", address)).await,
        Commands::Rooms { address, global } => {
            let scope = if global { "global" } else { "local" };
            run_get(&format!("http://{}/rooms?scope={}", address, scope)).await
        }
    }
}

/// Initialize logging
fn init_logging(config: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&config.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the chat node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfChat node...");

    let config = match ChatConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!(
        "Loaded configuration for node {} ({} static peer(s))",
        config.node.id,
        config.cluster.peers.len()
    );

    let registry = Arc::new(PeerRegistry::from_config(&config.cluster.peers));
    let transport = Arc::new(TcpPeerTransport::new(
        registry.clone(),
        config.timing.peer_rpc_timeout(),
    ));
    let node = ChatNode::new(config.clone(), transport.clone(), registry).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = node.spawn_background_tasks(shutdown_rx.clone());

    // Peer RPC
    let network_server = Arc::new(NetworkServer::new(config.node.bind_address.clone(), node.clone()));
    let server = network_server.clone();
    let network_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            tracing::error!("Peer RPC server error: {}", e);
        }
    });

    // Client API
    let api = ApiServer::new(config.api.clone(), node.clone());
    let api_shutdown = shutdown_rx.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.start(api_shutdown).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });

    // Pooled connection cleanup
    let mut pool_shutdown = shutdown_rx;
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(PEER_CONNECTION_MAX_IDLE / 2);
        loop {
            tokio::select! {
                _ = interval.tick() => transport.cleanup_stale(PEER_CONNECTION_MAX_IDLE).await,
                _ = pool_shutdown.changed() => break,
            }
        }
    }));

    tracing::info!(
        "Node {} running: peers on {}, API on {}",
        node.node_id(),
        config.node.bind_address,
        config.api.bind_address
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    network_server.stop();
    for task in tasks {
        let _ = task.await;
    }
    let _ = api_handle.await;
    let _ = network_handle.await;

    tracing::info!("WolfChat shutdown complete");
    Ok(())
}

/// Fetch a JSON endpoint of a running node and print it
async fn run_get(url: &str) -> Result<()> {
    let response = reqwest::get(url).await.map_err(|e| {
        eprintln!("Failed to reach {}: {}", url, e);
        Error::Network(e.to_string())
    })?;
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    let pretty = serde_json::to_string_pretty(&body).map_err(|e| Error::Internal(e.to_string()))?;
    println!("{}", pretty);
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfChat Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7700"
# advertise_address = "my-public-ip:7700"

[cluster]
peers = []
# peers = [
#     {{ id = "node-2", address = "node-2.example.com:7700" }},
#     {{ id = "node-3", address = "node-3.example.com:7700" }},
# ]

[timing]
heartbeat_interval_ms = 30000
heartbeat_timeout_ms = 2000
max_consecutive_heartbeat_failures = 3
membership_cleanup_interval_secs = 60
inactivity_timeout_secs = 900
peer_rpc_timeout_ms = 5000
deletion_phase_timeout_ms = 5000
prepare_grace_period_secs = 30

[limits]
max_message_length = 5000

[api]
enabled = true
bind_address = "0.0.0.0:8765"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to list your cluster peers.");
    println!("Then start with: wolfchat --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match ChatConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Peers: {}", config.cluster.peers.len());
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
    let config = ChatConfig::from_file(&config_path)?;
    let timing = &config.timing;

    println!("WolfChat Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("API:              {} (enabled: {})", config.api.bind_address, config.api.enabled);
    println!();
    println!("Cluster:");
    for peer in &config.cluster.peers {
        println!("  {:<16}{}", peer.id, peer.address);
    }
    println!();
    println!("Timing:");
    println!("  Heartbeat:      every {} ms, timeout {} ms, fail after {}",
        timing.heartbeat_interval_ms,
        timing.heartbeat_timeout_ms,
        timing.max_consecutive_heartbeat_failures);
    println!("  Inactivity:     {} s (checked every {} s)",
        timing.inactivity_timeout_secs,
        timing.membership_cleanup_interval_secs);
    println!("  Peer RPC:       {} ms", timing.peer_rpc_timeout_ms);
    println!("  Deletion phase: {} ms, grace {} s",
        timing.deletion_phase_timeout_ms,
        timing.prepare_grace_period_secs);
    println!("  Max message:    {} chars", config.limits.max_message_length);

    Ok(())
}
