use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use swarmlink::{ConnectionEvent, Error, Keypair, Node, NodeConfig, PeerAddress};

const DEFAULT_PORT: u16 = 9876;
const DEFAULT_TOPIC: &str = "swarmlink-chat";
const RENDEZVOUS_LIMIT: usize = 20;

#[derive(Parser, Debug)]
#[command(name = "swarmlink")]
#[command(author, version, about, long_about = None)]
#[command(subcommand_negates_reqs = true)]
#[command(group(ArgGroup::new("mode").required(true).args(["bootstrapper", "peer"])))]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Listen for peers and help them find each other.
    #[arg(long)]
    bootstrapper: bool,

    /// Join the swarm through this bootstrap address
    /// (/ip4/<addr>/udp/<port>/id/<peer id>).
    #[arg(long, value_name = "ADDR")]
    peer: Option<PeerAddress>,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Key file to load. A fresh identity is generated when omitted.
    #[arg(short, long, value_name = "PATH")]
    key: Option<PathBuf>,

    #[arg(short, long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// TOML node configuration.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a new key file and print its PeerId.
    Keygen {
        #[arg(short, long, default_value = "private_key.bin")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if let Some(Command::Keygen { out }) = &args.command {
        return keygen(out);
    }

    let keypair = match &args.key {
        Some(path) => Keypair::load(path).context("failed to load key file")?,
        None => Keypair::generate().context("failed to generate identity")?,
    };
    let config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    let node = Node::bind_with_config(&format!("0.0.0.0:{}", args.port), keypair, config)
        .await
        .context("failed to start node")?;
    tokio::spawn(log_connection_events(node.connection_events()));

    let result = match args.peer {
        Some(seed) => run_peer(&node, seed, &args.topic).await,
        None => run_bootstrapper(&node).await,
    };

    node.shutdown().await;
    result
}

fn keygen(out: &Path) -> Result<()> {
    let keypair = Keypair::generate().context("failed to generate identity")?;
    keypair
        .save(out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("{}", keypair.peer_id());
    Ok(())
}

async fn log_connection_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Connected {
                peer,
                remote,
                direction,
            }) => {
                info!(peer = %peer.short(), remote = %remote, direction = ?direction, "peer connected");
            }
            Ok(ConnectionEvent::Closed { peer }) => {
                info!(peer = %peer.short(), "peer disconnected");
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "connection event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_bootstrapper(node: &Node) -> Result<()> {
    let mut address = node.peer_address();
    if address.addr.ip().is_unspecified() {
        info!("listening on all interfaces, replace 127.0.0.1 with a reachable address");
        address = address.with_observed_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    println!("{address}");
    info!("bootstrapper ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("received shutdown signal, exiting gracefully");
    Ok(())
}

async fn run_peer(node: &Node, seed: PeerAddress, topic: &str) -> Result<()> {
    let known = node.bootstrap(&seed).await.context("bootstrap failed")?;
    info!(known, "joined swarm");

    let peers = node.rendezvous(topic, RENDEZVOUS_LIMIT).await?;
    info!(topic, peers = peers.len(), "rendezvous complete");

    let mut subscription = node.subscribe(topic).await?;
    let local = node.peer_id();
    let printer = tokio::spawn(async move {
        while let Some(message) = subscription.next().await {
            if message.sender == local {
                continue;
            }
            println!(
                "{}: {}",
                message.sender.short(),
                String::from_utf8_lossy(&message.payload)
            );
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.is_empty() {
                    continue;
                }
                match node.publish(topic, line).await {
                    Ok(_) => {}
                    Err(Error::NotConnected) => warn!("no peers connected, message not sent"),
                    Err(e) => warn!(error = %e, "publish failed"),
                }
            }
        }
    }

    printer.abort();
    Ok(())
}
