//! meshdns — run a mesh membership node from the command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info};

use meshdns_protocol::{identity, GossipConfig, GossipService, MeshNode, Store, StoreConfig};

#[derive(Parser)]
#[command(name = "meshdns", about = "Decentralized membership registry with a DNS projection")]
struct Cli {
    /// File to read or write the mesh state to
    #[arg(long, default_value = "./meshdns_state.json", global = true)]
    state_file: PathBuf,

    /// File where the derived hostnames are written as JSON lines
    #[arg(long, default_value = "./meshdns_dns.json", global = true)]
    dns_file: PathBuf,

    /// Address other peers can reach this node at
    #[arg(long, global = true)]
    ip: Option<IpAddr>,

    /// Port to serve gossip on
    #[arg(long, default_value_t = 7331, global = true)]
    port: u16,

    /// File to read or write the signing key to
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Bootstrap peer to connect to, e.g. http://[2001:db8::1]:7331
    #[arg(long = "bootstrap-peer", global = true)]
    bootstrap_peers: Vec<String>,

    /// Hostname this peer should be known as (repeatable)
    #[arg(long = "hostname", global = true)]
    hostnames: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info", value_parser = ["debug", "info"], global = true)]
    log_level: String,

    /// Seconds between gossip rounds
    #[arg(long, default_value_t = 30, global = true)]
    gossip_interval: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gossip service and HTTP transport
    Server,

    /// Initialize a new network with this node as sole founder and persist it
    Create {
        /// Top-level domain of the network to create
        #[arg(long)]
        tld: String,
    },

    /// Diagnostic: print the configured peers and exit
    Test,
}

fn default_key_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meshdns")
        .join("key")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let Some(ip) = cli.ip else {
        bail!("--ip is required");
    };

    let key_file = cli.key_file.clone().unwrap_or_else(default_key_file);
    let key = identity::load_or_generate(&key_file)
        .with_context(|| format!("cannot load signing key from {}", key_file.display()))?;

    let store = Store::new(StoreConfig::new(
        cli.state_file.clone(),
        cli.dns_file.clone(),
    ));
    let config = GossipConfig {
        interval_secs: cli.gossip_interval,
        ..GossipConfig::default()
    };

    let node = MeshNode::open(
        key,
        ip,
        cli.port,
        cli.hostnames.clone(),
        &cli.bootstrap_peers,
        store,
        config,
    )
    .await
    .context("failed to initialize mesh node")?;
    let node = Arc::new(node);

    match cli.command {
        Command::Server => serve(node, ip, cli.port).await,
        Command::Create { tld } => {
            node.found_network(&tld)
                .await
                .context("failed to create network")?;
            info!(
                tld,
                state_file = %cli.state_file.display(),
                "network created"
            );
            Ok(())
        }
        Command::Test => {
            info!(public_key = node.public_key(), "local identity");
            for peer in node.peer_stats().await {
                info!(url = peer.url, bootstrap = peer.bootstrap, "configured peer");
            }
            Ok(())
        }
    }
}

/// Run the HTTP transport and the gossip loop until interrupted.
async fn serve(node: Arc<MeshNode>, ip: IpAddr, port: u16) -> Result<()> {
    let addr = SocketAddr::new(ip, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind gossip endpoint on {addr}"))?;
    info!(%addr, public_key = node.public_key(), "meshdns server listening");

    let router = meshdns_protocol::server::router(Arc::clone(&node));
    let gossip = GossipService::new(Arc::clone(&node))?;

    tokio::select! {
        result = axum::serve(listener, router) => {
            result.context("gossip HTTP server failed")?;
        }
        _ = gossip.run() => {
            // run() loops forever; reaching here means it was cancelled.
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
