use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use weave_grid::{BootstrapResponder, PeerAnnouncement, PeerEvent};

mod config;
mod network;

use config::{NodeConfig, Overrides};
use network::Node;

#[derive(Parser)]
#[command(name = "weaved")]
#[command(about = "Weave overlay node daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Node identifier (random when unset)
    #[arg(short, long, global = true)]
    identifier: Option<String>,

    /// Local address to announce instead of probing
    #[arg(short, long, global = true)]
    address: Option<IpAddr>,

    /// Inbound listening port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Designated LAN discovery ports
    #[arg(long, value_delimiter = ',', global = true)]
    lan_ports: Option<Vec<u16>>,

    /// Disable LAN broadcast discovery
    #[arg(long, global = true)]
    no_lan: bool,

    /// Enable multicast discovery
    #[arg(long, global = true)]
    multicast: bool,

    /// WAN bootstrap server
    #[arg(short, long, global = true)]
    bootstrap: Option<SocketAddr>,

    /// Ask the bootstrap server for the authority key instead of peers
    #[arg(long, global = true)]
    authority: bool,

    /// Answer bootstrap requests on this address
    #[arg(long, global = true)]
    serve_bootstrap: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node daemon
    Start {
        /// Files to distribute once the first peer is trusted
        #[arg(long)]
        share: Vec<PathBuf>,
    },
    /// Print the effective configuration
    Config,
    /// Run only a bootstrap responder
    Bootstrap {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:45600")]
        listen: SocketAddr,
        /// Key handed to authority requests
        #[arg(long)]
        key: Option<String>,
    },
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            identifier: self.identifier.clone(),
            address: self.address,
            listen_port: self.port,
            lan_ports: self.lan_ports.clone(),
            multicast: self.multicast,
            no_lan: self.no_lan,
            bootstrap: self.bootstrap,
            authority: self.authority,
            serve_bootstrap: self.serve_bootstrap,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let mut config = NodeConfig::load(cli.config.as_deref())?;
    config.apply(cli.overrides());
    config.validate()?;

    match cli.command {
        Some(Commands::Start { share }) => run_daemon(config, share).await?,
        None => run_daemon(config, Vec::new()).await?,
        Some(Commands::Config) => print!("{}", config.to_toml()?),
        Some(Commands::Bootstrap { listen, key }) => run_bootstrap(listen, key).await?,
    }

    Ok(())
}

async fn run_daemon(config: NodeConfig, share: Vec<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    info!("Weave node daemon v{}", env!("CARGO_PKG_VERSION"));

    let node = Node::start(&config).await?;
    let registry = node.registry().clone();

    info!("Identifier: {}", registry.identifier());
    info!("Routines: {}", node.routines().join(", "));
    if let Some(responder) = node.responder() {
        info!("Answering bootstrap requests on {}", responder.local_addr());
    }

    let mut events = registry.subscribe();
    let distribution = node.distribution();
    let mut pending_share = share;
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PeerEvent::PeerAdded { peer, identifier, inbound }) => {
                    info!(
                        "Peer {} joined ({}, {})",
                        peer,
                        identifier.as_deref().unwrap_or("unknown"),
                        if inbound { "inbound" } else { "outbound" }
                    );
                }
                Ok(PeerEvent::PeerRemoved { peer }) => info!("Peer {} left", peer),
                Ok(PeerEvent::PeerTrusted { peer }) => {
                    info!("Peer {} trusted", peer);
                    for path in pending_share.drain(..) {
                        match distribution.distribute_file(&path).await {
                            Ok(bytes) => info!("Shared {} ({} bytes)", path.display(), bytes),
                            Err(e) => error!("Failed to share {}: {}", path.display(), e),
                        }
                    }
                }
                Ok(PeerEvent::Message { peer, text }) => info!("Message from {}: {}", peer, text),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event monitor lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let status_every = Duration::from_secs(config.routines.status_interval_secs.max(1));
    let status_registry = registry.clone();
    let status = tokio::spawn(async move {
        let mut interval = tokio::time::interval(status_every);
        loop {
            interval.tick().await;
            let peers = status_registry.peer_snapshot();
            let trusted = peers.iter().filter(|p| p.trusted).count();
            info!("Status: {} peers, {} trusted", peers.len(), trusted);
            if let Ok(json) = serde_json::to_string(&peers) {
                debug!("Peers: {}", json);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    status.abort();
    node.shutdown().await;
    info!("Node stopped");

    Ok(())
}

async fn run_bootstrap(listen: SocketAddr, key: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let responder = BootstrapResponder::bind(listen, Arc::new(Vec::<PeerAnnouncement>::new), key).await?;
    info!("Bootstrap responder ready on {}", responder.local_addr());

    tokio::signal::ctrl_c().await?;
    responder.shutdown();
    info!("Bootstrap responder stopped");
    Ok(())
}
