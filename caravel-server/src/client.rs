//! Line-based TCP surface for clients.
//!
//! Speaks a minimal text protocol, one request per line:
//!
//! ```text
//! SET <key> <value>   ->  OK
//! GET <key>           ->  OK <value> | MISSING
//! DEL <key>           ->  OK | MISSING
//! ```
//!
//! Failures come back as `ERR <CODE>` with the leader address appended when
//! a redirect hint is known, e.g. `ERR ENOTLEADER /ip4/10.0.0.2/tcp/9001`.
//! Clients redirect on `ENOTLEADER`, back off and retry on `ENOMAJORITY`,
//! and retry from scratch on `EOUTDATEDTERM`.

use std::net::SocketAddr;

use bytes::Bytes;
use caravel_runtime::ServerHandle;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::kv::{KvCommand, KvResponse};

/// Accepts client connections and serves them until the listener dies.
///
/// # Errors
/// Returns an error if the listen address cannot be bound.
pub async fn serve(bind_addr: SocketAddr, handle: ServerHandle) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "client listener started");

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(peer_addr = %peer_addr, "client connected");
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handle).await {
                        debug!(peer_addr = %peer_addr, error = %e, "client connection ended");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "failed to accept client connection");
            }
        }
    }
}

/// Serves one client connection, request per line.
async fn handle_connection(stream: TcpStream, handle: ServerHandle) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = handle_request(line.trim(), &handle).await;
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Executes one request line against the cluster.
async fn handle_request(line: &str, handle: &ServerHandle) -> String {
    let Some(command) = parse_request(line) else {
        return "ERR EBADREQUEST".to_string();
    };

    match handle.submit(command.encode()).await {
        Ok(outcome) => match KvResponse::decode(&outcome.result) {
            Ok(KvResponse::Ok) => "OK".to_string(),
            Ok(KvResponse::Value(value)) => {
                format!("OK {}", String::from_utf8_lossy(&value))
            }
            Ok(KvResponse::Missing) => "MISSING".to_string(),
            Ok(KvResponse::Invalid) | Err(_) => "ERR EBADREQUEST".to_string(),
        },
        Err(e) => match e.leader_hint() {
            Some(leader) => format!("ERR {} {leader}", e.code()),
            None => format!("ERR {}", e.code()),
        },
    }
}

/// Parses a request line into a command.
fn parse_request(line: &str) -> Option<KvCommand> {
    let mut parts = line.splitn(3, ' ');
    let verb = parts.next()?;
    let key = parts.next()?.to_string();
    if key.is_empty() {
        return None;
    }

    match verb.to_ascii_uppercase().as_str() {
        "SET" => Some(KvCommand::Set {
            key,
            value: Bytes::from(parts.next()?.to_string()),
        }),
        "GET" if parts.next().is_none() => Some(KvCommand::Get { key }),
        "DEL" if parts.next().is_none() => Some(KvCommand::Del { key }),
        _ => None,
    }
}
