// Identity tool for dkg nodes
// Generates peer identities and writes them into the node configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use dkg_node::config_manager::{get_config_path, NodeConfig};
use dkg_node::network::PeerId;

#[derive(Parser)]
#[command(name = "dkg-keygen")]
#[command(about = "Generate peer identities for dkg nodes", long_about = None)]
struct Cli {
    /// Config file to update (default: ~/.dkg/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh peer id into the configuration
    Init {
        /// Replace an existing identity
        #[arg(short, long)]
        force: bool,
    },
    /// Print a fresh peer id without saving it
    Generate {
        /// Also print the hex encoding of the id bytes
        #[arg(long)]
        hex: bool,
    },
    /// Show the configured peer id and where it sits in the keyspace
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(get_config_path);

    match cli.command {
        Commands::Init { force } => init_identity(&path, force)?,
        Commands::Generate { hex } => {
            let peer = PeerId::random();
            println!("{}", peer);
            if hex {
                println!("hex: {}", hex::encode(peer.as_bytes()));
            }
        }
        Commands::Show => show_identity(&path)?,
    }

    Ok(())
}

fn init_identity(path: &Path, force: bool) -> Result<()> {
    let mut config = if path.exists() {
        NodeConfig::load_from(path)?
    } else {
        NodeConfig::from_env()
    };

    if !config.identity.peer_id.is_empty() && !force {
        bail!(
            "{} already has identity {} (use --force to replace it)",
            path.display(),
            config.identity.peer_id
        );
    }

    config.identity.peer_id.clear();
    config.ensure_identity();
    config
        .save_to(path)
        .with_context(|| format!("saving {}", path.display()))?;

    println!("Peer id: {}", config.identity.peer_id);
    println!("Saved to {}", path.display());
    Ok(())
}

fn show_identity(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("{} does not exist, run `dkg-keygen init` first", path.display());
    }
    let config = NodeConfig::load_from(path)?;
    let peer = config.peer_id()?;
    println!("Peer id:  {}", peer);
    println!("DHT id:   {}", hex::encode(peer.kad_id()));
    if let Some(created) = &config.identity.created_at {
        println!("Created:  {}", created);
    }
    Ok(())
}
