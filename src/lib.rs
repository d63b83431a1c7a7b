// src/lib.rs
pub mod config;
pub mod config_manager;
pub mod error;
pub mod network;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use crate::config_manager::NodeConfig;
use crate::network::message::PING_REQUEST;
use crate::network::tcp::TcpTransport;
use crate::network::transport::Transport;
use crate::network::{
    new_session_id, protocols, Message, NetworkService, PeerId, PingHandler, RequestSequence, ResponseType,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Knowledge-graph network node", long_about = None)]
struct Cli {
    /// Path to config.json (default: ~/.dkg/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node until Ctrl+C
    Start {
        /// Override network.listen_addr
        #[arg(long)]
        listen: Option<String>,
    },
    /// Ping a peer through the bootstrap network
    Ping {
        /// Base58 peer id
        #[arg(long)]
        peer: String,
    },
    /// Find the peers closest to a key that speak a protocol
    FindNodes {
        #[arg(long)]
        key: String,
        #[arg(long, default_value = protocols::STORE)]
        protocol: String,
        /// Defaults to the replication factor
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging(level: &str) -> Result<()> {
    let level = tracing::Level::from_str(level).with_context(|| format!("invalid log level {:?}", level))?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))?;
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = match &cli.config {
        Some(path) => NodeConfig::load_from(path)?,
        None => NodeConfig::load()?,
    };

    match cli.command {
        Commands::Start { listen } => {
            let mut config = config;
            if let Some(listen) = listen {
                config.network.listen_addr = listen;
            }
            start_node(config).await
        }
        Commands::Ping { peer } => ping(config, &peer).await,
        Commands::FindNodes { key, protocol, limit } => find_nodes(config, &key, &protocol, limit).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            config::validate_config(&config).print_summary();
            Ok(())
        }
    }
}

async fn start_node(config: NodeConfig) -> Result<()> {
    let validation = config::validate_config(&config);
    validation.print_summary();
    if !validation.valid {
        bail!("invalid configuration, refusing to start");
    }

    let peer_id = config.peer_id()?;
    let transport = Arc::new(
        TcpTransport::bind(peer_id.clone(), &config.network.listen_addr, config.dial_timeout())
            .await
            .with_context(|| format!("binding {}", config.network.listen_addr))?,
    );
    let service = NetworkService::new(transport.clone(), config.service_config());
    service
        .register_handler_with_sequence(protocols::PING, RequestSequence::ping(), Arc::new(PingHandler))
        .await?;

    transport.bootstrap(&config.network.bootstrap_peers).await;
    let refresh = transport.spawn_refresh(config.refresh_interval());
    service.start();

    println!("Node {} listening on {}", peer_id, transport.listen_addr());

    tokio::signal::ctrl_c().await.context("failed to install Ctrl+C handler")?;
    tracing::info!("shutdown signal received, notifying tasks...");
    service.shutdown().await;
    let _ = refresh.await;
    Ok(())
}

/// Short-lived node with a throwaway identity, bootstrapped from the config.
async fn client_node(config: &NodeConfig) -> Result<(Arc<TcpTransport>, NetworkService)> {
    let transport = Arc::new(TcpTransport::bind(PeerId::random(), "0.0.0.0:0", config.dial_timeout()).await?);
    if transport.bootstrap(&config.network.bootstrap_peers).await == 0 {
        bail!("no bootstrap peer reachable");
    }
    let service = NetworkService::new(transport.clone(), config.service_config());
    service.register_sequence(protocols::PING, RequestSequence::ping());
    Ok((transport, service))
}

async fn ping(config: NodeConfig, peer: &str) -> Result<()> {
    let peer: PeerId = peer.parse().context("invalid peer id")?;
    let (transport, service) = client_node(&config).await?;

    if transport.routing().get(&peer).is_none() {
        // one lookup round towards the peer's own position
        let _: Vec<PeerId> = transport.closest_peers(&peer.kad_id()).collect().await;
    }

    let started = Instant::now();
    let message = Message::new(new_session_id(), PING_REQUEST, json!({ "sentAt": chrono::Utc::now().to_rfc3339() }));
    let response = service.send_message_with_retry(protocols::PING, &peer, message).await?;
    match response.as_ref().and_then(Message::response_type) {
        Some(ResponseType::Ack) => println!("pong from {} in {:?}", peer, started.elapsed()),
        Some(other) => println!("{} answered {}", peer, other),
        None => println!("{} sent an invalid response", peer),
    }
    service.shutdown().await;
    Ok(())
}

async fn find_nodes(config: NodeConfig, key: &str, protocol: &str, limit: Option<usize>) -> Result<()> {
    let (_transport, service) = client_node(&config).await?;
    let limit = limit.unwrap_or(config.discovery.replication_factor);

    let nodes = service.find_nodes(key, protocol, limit).await;
    if nodes.is_empty() {
        println!("No peers speaking {} found", protocol);
    }
    for (i, node) in nodes.iter().enumerate() {
        println!("{:>3}. {}", i + 1, node);
    }
    service.shutdown().await;
    Ok(())
}
