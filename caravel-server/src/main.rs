//! Caravel consensus node binary.
//!
//! Runs one node of a Caravel cluster: the Raft engine, the TCP peer
//! transport, and the line-based client surface over the replicated
//! key/value store.
//!
//! # Single-Node Mode
//!
//! ```bash
//! caravel-server --listen /ip4/127.0.0.1/tcp/9001
//! ```
//!
//! # Multi-Node Mode
//!
//! ```bash
//! # Node 1
//! caravel-server --listen /ip4/node1/tcp/9001 --client-addr 0.0.0.0:6001 \
//!     --peer /ip4/node2/tcp/9002 --peer /ip4/node3/tcp/9003
//!
//! # Node 2
//! caravel-server --listen /ip4/node2/tcp/9002 --client-addr 0.0.0.0:6002 \
//!     --peer /ip4/node1/tcp/9001 --peer /ip4/node3/tcp/9003
//!
//! # Node 3
//! caravel-server --listen /ip4/node3/tcp/9003 --client-addr 0.0.0.0:6003 \
//!     --peer /ip4/node1/tcp/9001 --peer /ip4/node2/tcp/9002
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use caravel_core::Address;
use caravel_raft::MemoryLogStore;
use caravel_runtime::{
    ConsensusServer, IncomingDispatcher, NodeConfig, ServerEvent, TcpTransport, TimingConfig,
};
use caravel_server::KvStore;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Caravel consensus node.
#[derive(Parser, Debug)]
#[command(name = "caravel-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Endpoint this node listens on for peer traffic; also its cluster
    /// identity.
    #[arg(long, value_parser = parse_address, default_value = "/ip4/127.0.0.1/tcp/9001")]
    listen: Address,

    /// Address to listen on for client connections.
    #[arg(long, default_value = "127.0.0.1:6001")]
    client_addr: SocketAddr,

    /// Peer endpoint, e.g. `/ip4/node2/tcp/9002`.
    /// Can be specified multiple times for multiple peers.
    #[arg(long = "peer", value_parser = parse_address)]
    peers: Vec<Address>,

    /// Bound on queued-but-unconsumed inbound peer messages.
    #[arg(long, default_value = "100")]
    max_pending: usize,

    /// Minimum election timeout in milliseconds.
    #[arg(long, default_value = "150")]
    election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    #[arg(long, default_value = "300")]
    election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// Parses a path-style endpoint for clap.
fn parse_address(s: &str) -> Result<Address, String> {
    Address::parse(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Log to stderr; stdout belongs to whoever supervises the process.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let timing = TimingConfig {
        election_timeout_min: Duration::from_millis(args.election_timeout_min_ms),
        election_timeout_max: Duration::from_millis(args.election_timeout_max_ms),
        heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
        ..TimingConfig::default()
    };
    timing.validate()?;

    info!(
        listen = %args.listen,
        client_addr = %args.client_addr,
        peer_count = args.peers.len(),
        "starting caravel node"
    );

    let config = NodeConfig::new(args.listen.clone())
        .with_peers(args.peers)
        .with_max_pending(args.max_pending)
        .with_timing(timing);

    let dispatcher = Arc::new(IncomingDispatcher::new(config.max_pending));
    let transport = Arc::new(TcpTransport::start(args.listen, Arc::clone(&dispatcher)).await?);

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let server = ConsensusServer::new(
        config,
        Box::new(MemoryLogStore::new()),
        Box::new(KvStore::new()),
        transport.clone(),
        dispatcher,
        events_tx,
    )?;

    let (handle, server_future) = server.run();
    let server_task = tokio::spawn(server_future);

    // Keep the event channel drained; the loop blocks if nobody listens.
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ServerEvent::Committed { index, .. } => {
                    debug!(index = index.get(), "applied committed entry");
                }
                ServerEvent::BecameLeader { term } => {
                    info!(term = term.get(), "now leading the cluster");
                }
                ServerEvent::SteppedDown { term } => {
                    info!(term = term.get(), "no longer leading");
                }
            }
        }
    });

    let client_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = caravel_server::client::serve(args.client_addr, client_handle).await {
            tracing::error!(error = %e, "client listener failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await?;
    transport.shutdown().await;
    server_task.await?;

    Ok(())
}
