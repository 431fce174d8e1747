//! nppd - NAT Punching Protocol daemon
//!
//! Runs a Rendezvous server or a relay cluster node, and queries running
//! instances.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use npp_core::TransportCredentials;
use npp_relay::{RelayMonitorClient, RelayServer};
use npp_rendezvous::{ClientConfig, RendezvousClient, RendezvousServer};
use rand::rngs::OsRng;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "nppd")]
#[command(about = "NAT Punching Protocol daemon")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "NPPD_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Rendezvous server
    Rendezvous {
        /// Path to config file
        #[arg(short, long, env = "NPPD_CONFIG", default_value = "/etc/nppd/config.json")]
        config: PathBuf,
    },

    /// Run a relay cluster node
    Relay {
        /// Path to config file
        #[arg(short, long, env = "NPPD_CONFIG", default_value = "/etc/nppd/config.json")]
        config: PathBuf,
    },

    /// Query a relay node's monitoring service
    RelayStatus {
        /// Monitoring service address
        #[arg(long, default_value = "127.0.0.1:12242")]
        monitor: SocketAddr,
    },

    /// Dump a Rendezvous server's waiting rooms
    RendezvousInfo {
        /// Rendezvous server address
        #[arg(long, default_value = "127.0.0.1:14099")]
        addr: SocketAddr,
    },

    /// Generate a sample config file with fresh secrets
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/nppd/config.json")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Rendezvous { config } => run_rendezvous(config).await?,
        Commands::Relay { config } => run_relay(config).await?,
        Commands::RelayStatus { monitor } => relay_status(monitor).await?,
        Commands::RendezvousInfo { addr } => rendezvous_info(addr).await?,
        Commands::InitConfig { output, force } => init_config(output, force)?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run_rendezvous(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting Rendezvous server");
    let config = DaemonConfig::load(&config_path)?;
    if config.secret_key.is_empty() {
        warn!("no secret_key configured, using an ephemeral identity");
    }
    let credentials = config.credentials()?;
    info!(identity = %credentials.wallet_address(), "loaded identity");

    let server = RendezvousServer::bind(config.rendezvous_config(), &credentials).await?;
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            if let Err(e) = shutdown.shutdown().await {
                error!(error = %e, "failed to signal shutdown");
            }
        }
    });
    server.serve().await?;
    Ok(())
}

async fn run_relay(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting relay node");
    let config = DaemonConfig::load(&config_path)?;
    let relay_config = config.relay_config()?;

    let server = RelayServer::bind(relay_config).await?;
    info!(
        node = %server.node(),
        gossip = %server.gossip_addr(),
        monitor = ?server.monitor_addr(),
        "relay node ready"
    );
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, leaving the cluster");
            if let Err(e) = shutdown.shutdown().await {
                error!(error = %e, "failed to signal shutdown");
            }
        }
    });
    server.serve().await?;
    Ok(())
}

async fn relay_status(monitor: SocketAddr) -> anyhow::Result<()> {
    let mut client = RelayMonitorClient::connect(monitor).await?;

    let members = client.cluster().await?;
    println!("Cluster ({} nodes):", members.len());
    for member in &members {
        println!("  {member}");
    }

    let info = client.info().await?;
    println!("\nWaiting servers:");
    if info.state.is_empty() {
        println!("  (none)");
    }
    let mut waiting: Vec<_> = info.state.iter().collect();
    waiting.sort_by(|a, b| a.0.cmp(b.0));
    for (addr, meeting) in waiting {
        println!("  {addr}: {}", meeting.servers.len());
    }

    let metrics = client.metrics().await?;
    println!("\nUptime: {}s", metrics.uptime_secs);
    println!("Connections: {}", metrics.conn_current);
    let mut net: Vec<_> = metrics.net.iter().collect();
    net.sort_by(|a, b| a.0.cmp(b.0));
    for (addr, counters) in net {
        println!("  {addr}: tx {} B, rx {} B", counters.tx_bytes, counters.rx_bytes);
    }
    Ok(())
}

async fn rendezvous_info(addr: SocketAddr) -> anyhow::Result<()> {
    let credentials = TransportCredentials::new(SigningKey::generate(&mut OsRng))?;
    let client = RendezvousClient::connect_tcp(addr, &credentials, ClientConfig::new())
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let info = client.info().await?;

    if info.state.is_empty() {
        println!("No peers waiting.");
        return Ok(());
    }
    let mut meetings: Vec<_> = info.state.iter().collect();
    meetings.sort_by(|a, b| a.0.cmp(b.0));
    for (resource, meeting) in meetings {
        println!("{resource}");
        println!("  servers: {}", meeting.servers.len());
        println!("  clients: {}", meeting.clients.len());
    }
    Ok(())
}

fn init_config(output: PathBuf, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists, pass --force to overwrite", output.display());
    }
    let config = DaemonConfig::sample();
    config.save(&output)?;
    let identity = config.credentials()?.wallet_address();
    println!("Config written to: {}", output.display());
    println!("Identity: {identity}");
    Ok(())
}
