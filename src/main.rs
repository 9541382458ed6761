//! Chain-Daemon CLI Application
//!
//! Runs a peer-to-peer node or prints its effective configuration.

use chain_daemon::core::{Block, MemoryVisor, SignedBlock};
use chain_daemon::daemon::{
    ConnectionRegistry, Daemon, DaemonConfig, EventLoop, MessageGate, NodeIdentity,
};
use chain_daemon::network::{daemon_channels, ConnectionPool, MessageRegistry, PeerBook};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "chain-daemon")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer node daemon for a small blockchain", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bootstrap peers (comma-separated ip:port)
        #[arg(long)]
        peers: Option<String>,

        /// Data directory for the peer book
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Never dial out, only accept incoming connections
        #[arg(long)]
        no_outgoing: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<(), BoxError> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", config.to_json()?);
        }

        Commands::Start {
            port,
            peers,
            data_dir,
            no_outgoing,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(peers) = peers {
                config.default_connections = peers
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            config.disable_outgoing |= no_outgoing;
            config.validate()?;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_daemon(config))?;
        }
    }

    Ok(())
}

async fn run_daemon(config: DaemonConfig) -> Result<(), BoxError> {
    let genesis = SignedBlock::new(Block::genesis(config.genesis_time));
    log::info!("Genesis block {}", genesis.hash());
    let visor = MemoryVisor::new(genesis);

    let peers = PeerBook::load(&config.data_dir, config.max_known_peers)?;
    let identity = Arc::new(NodeIdentity::new(
        config.port,
        config.protocol_version,
        config.blockchain_pubkey()?,
        config.user_agent.clone(),
    ));
    let messages = Arc::new(MessageRegistry::standard()?);
    let connections = Arc::new(ConnectionRegistry::new());

    let (senders, receivers) = daemon_channels(
        config.ready_queue_size,
        config.event_queue_size,
        config.dial_failure_queue_size,
    );
    let pool = ConnectionPool::new(
        config.pool_config(),
        connections.clone(),
        messages,
        Arc::new(MessageGate::new(identity.clone())),
        senders,
    );
    let local = pool.listen(&config.listen_addr()).await?;

    println!("🌐 Node listening on {} (mirror {})", local, identity.mirror);

    let daemon = Daemon::new(
        config,
        identity,
        connections,
        Arc::new(pool),
        Box::new(peers),
        Box::new(visor),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        println!("\n📴 Shutting down node...");
        signal.cancel();
    });

    EventLoop::new(daemon, receivers, shutdown).run().await;
    Ok(())
}
