//! TCP transport for peer communication.
//!
//! Reliable-enough message delivery between cluster nodes over TCP. The
//! consensus protocol tolerates loss and reordering, so the transport makes
//! no delivery promises beyond best effort:
//!
//! - **Inbound**: accepted connections are framed by the codec and fed into
//!   the node's [`IncomingDispatcher`]
//! - **Outbound**: one sender task per peer with a bounded queue, connecting
//!   lazily on first send and reconnecting with exponential backoff
//!
//! A connection failure is a peer-unreachable condition, never fatal: the
//! engine keeps running with reduced reachability and the next heartbeat or
//! election retries contact.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use caravel_core::Address;
use caravel_raft::Message;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{decode_message, encode_message, CodecError};
use crate::dispatcher::IncomingDispatcher;

/// Maximum read buffer size (1 MB).
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection timeout in milliseconds.
const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Maximum queued outbound messages per peer.
const MAX_OUTBOUND_PER_PEER: usize = 1000;

/// Maximum reconnect backoff in milliseconds.
const MAX_RECONNECT_DELAY_MS: u64 = 10_000;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind the listener.
    #[error("failed to bind {address}: {source}")]
    BindFailed {
        /// The address we tried to bind.
        address: Address,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Failed to connect to a peer.
    #[error("failed to connect to {address}: {source}")]
    ConnectFailed {
        /// The peer address.
        address: Address,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has shut down.
    #[error("transport is shut down")]
    Shutdown,

    /// The peer's outbound queue is full.
    #[error("send queue full for {0}")]
    QueueFull(Address),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// The seam between the engine loop and the network.
///
/// Production uses [`TcpTransport`]; simulations substitute an in-memory
/// implementation with scripted delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a message to the peer it addresses.
    ///
    /// Fire-and-forget from the engine's perspective: the message is queued
    /// for asynchronous delivery and may be silently lost if the peer is
    /// unreachable.
    ///
    /// # Errors
    /// Returns an error when the message cannot even be queued.
    async fn send(&self, message: Message) -> TransportResult<()>;
}

/// Outbound connection state for one peer.
struct PeerLink {
    sender: mpsc::Sender<Message>,
}

/// TCP transport: one listener for inbound, one sender task per peer.
pub struct TcpTransport {
    local: Address,
    links: Arc<RwLock<HashMap<Address, PeerLink>>>,
    shutdown: Arc<Mutex<bool>>,
}

impl TcpTransport {
    /// Binds the listener at `local` and starts accepting connections.
    ///
    /// Every decoded inbound message is handed to `dispatcher`. Outbound
    /// links are created lazily on first send, so membership may grow after
    /// startup without reconfiguring the transport.
    ///
    /// # Errors
    /// Returns an error if the listen address cannot be resolved or bound.
    pub async fn start(
        local: Address,
        dispatcher: Arc<IncomingDispatcher>,
    ) -> TransportResult<Self> {
        let listen_addr = resolve(&local).await?;
        let listener =
            create_reusable_listener(listen_addr).map_err(|e| TransportError::BindFailed {
                address: local.clone(),
                source: e,
            })?;

        info!(local = %local, addr = %listen_addr, "transport listening");

        let transport = Self {
            local,
            links: Arc::new(RwLock::new(HashMap::new())),
            shutdown: Arc::new(Mutex::new(false)),
        };

        let accept_shutdown = Arc::clone(&transport.shutdown);
        tokio::spawn(async move {
            Self::accept_loop(listener, dispatcher, accept_shutdown).await;
        });

        Ok(transport)
    }

    /// Returns this node's address.
    #[must_use]
    pub const fn local(&self) -> &Address {
        &self.local
    }

    /// Returns true once the transport has shut down.
    pub async fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().await
    }

    /// Tears the transport down.
    ///
    /// In-flight sender tasks drain and exit; accepted connections close as
    /// their streams error out.
    pub async fn shutdown(&self) {
        *self.shutdown.lock().await = true;
        self.links.write().await.clear();
        info!(local = %self.local, "transport closed");
    }

    /// Loop that accepts inbound connections.
    async fn accept_loop(
        listener: TcpListener,
        dispatcher: Arc<IncomingDispatcher>,
        shutdown: Arc<Mutex<bool>>,
    ) {
        loop {
            if *shutdown.lock().await {
                debug!("accept loop shutting down");
                break;
            }

            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "accepted connection");

                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        if let Err(e) = Self::receive_loop(stream, dispatcher).await {
                            debug!(peer_addr = %peer_addr, error = %e, "receive loop ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    /// Loop that reads frames off one inbound connection.
    async fn receive_loop(
        mut stream: TcpStream,
        dispatcher: Arc<IncomingDispatcher>,
    ) -> TransportResult<()> {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            let bytes_read = stream.read_buf(&mut buffer).await?;
            if bytes_read == 0 {
                debug!("connection closed by peer");
                break;
            }

            while !buffer.is_empty() {
                match decode_message(&buffer) {
                    Ok((message, consumed)) => {
                        dispatcher.accept(message);
                        let _ = buffer.split_to(consumed);
                    }
                    Err(CodecError::Truncated { .. }) => {
                        // Need more data.
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed frame, dropping connection");
                        return Err(e.into());
                    }
                }
            }

            // Prevent the buffer from growing unbounded.
            if buffer.capacity() > READ_BUFFER_SIZE * 2 {
                buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
            }
        }

        Ok(())
    }

    /// Returns the outbound queue for `peer`, creating its sender task on
    /// first use.
    async fn link_for(&self, peer: &Address) -> mpsc::Sender<Message> {
        if let Some(link) = self.links.read().await.get(peer) {
            return link.sender.clone();
        }

        let mut links = self.links.write().await;
        // Double-checked: another task may have raced us here.
        if let Some(link) = links.get(peer) {
            return link.sender.clone();
        }

        let (tx, rx) = mpsc::channel(MAX_OUTBOUND_PER_PEER);
        links.insert(
            peer.clone(),
            PeerLink { sender: tx.clone() },
        );

        let local = self.local.clone();
        let peer = peer.clone();
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            Self::sender_loop(local, peer, rx, shutdown).await;
        });

        tx
    }

    /// Loop that delivers queued messages to one peer.
    async fn sender_loop(
        local: Address,
        peer: Address,
        mut rx: mpsc::Receiver<Message>,
        shutdown: Arc<Mutex<bool>>,
    ) {
        let mut stream: Option<TcpStream> = None;
        let mut reconnect_delay_ms: u64 = 100;

        loop {
            if *shutdown.lock().await {
                debug!(local = %local, peer = %peer, "sender loop shutting down");
                break;
            }

            let Some(message) = rx.recv().await else {
                break; // Channel closed.
            };

            if stream.is_none() {
                match Self::connect(&peer).await {
                    Ok(s) => {
                        stream = Some(s);
                        reconnect_delay_ms = 100;
                        info!(local = %local, peer = %peer, "connected to peer");
                    }
                    Err(e) => {
                        warn!(local = %local, peer = %peer, error = %e, "connect failed, will retry");
                        tokio::time::sleep(tokio::time::Duration::from_millis(
                            reconnect_delay_ms,
                        ))
                        .await;
                        reconnect_delay_ms = (reconnect_delay_ms * 2).min(MAX_RECONNECT_DELAY_MS);
                        // The message that triggered the connect attempt is
                        // dropped; the protocol retries at the next timer.
                        continue;
                    }
                }
            }

            if let Some(ref mut s) = stream {
                let result = match encode_message(&message) {
                    Ok(frame) => Self::send_bytes(s, &frame).await,
                    Err(e) => Err(e.into()),
                };

                match result {
                    Ok(()) => {
                        debug!(peer = %peer, term = %message.term(), "sent message");
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "send failed, reconnecting");
                        stream = None;
                    }
                }
            }
        }
    }

    /// Connects to a peer with a timeout, resolving its host at connect time.
    async fn connect(peer: &Address) -> TransportResult<TcpStream> {
        let timeout = tokio::time::Duration::from_millis(CONNECT_TIMEOUT_MS);

        let connect_future = async {
            let addr = resolve_io(peer).await?;
            TcpStream::connect(addr).await
        };

        match tokio::time::timeout(timeout, connect_future).await {
            Ok(Ok(stream)) => {
                // Disable Nagle's algorithm for lower latency.
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::ConnectFailed {
                address: peer.clone(),
                source: e,
            }),
            Err(_) => Err(TransportError::ConnectFailed {
                address: peer.clone(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
            }),
        }
    }

    /// Sends raw bytes over a TCP stream.
    async fn send_bytes(stream: &mut TcpStream, data: &[u8]) -> TransportResult<()> {
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: Message) -> TransportResult<()> {
        // Precondition: the engine never addresses itself.
        debug_assert!(*message.to() != self.local, "cannot send message to self");

        if self.is_shutdown().await {
            return Err(TransportError::Shutdown);
        }

        let to = message.to().clone();
        let sender = self.link_for(&to).await;
        sender
            .try_send(message)
            .map_err(|_| TransportError::QueueFull(to))
    }
}

/// Resolves an [`Address`] to a socket address.
async fn resolve(address: &Address) -> TransportResult<SocketAddr> {
    resolve_io(address)
        .await
        .map_err(|e| TransportError::ConnectFailed {
            address: address.clone(),
            source: e,
        })
}

async fn resolve_io(address: &Address) -> std::io::Result<SocketAddr> {
    let host_port = format!("{}:{}", address.host(), address.port());
    let mut addrs = tokio::net::lookup_host(&host_port).await?;
    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {host_port}"),
        )
    })
}

/// Create a TCP listener with `SO_REUSEADDR` enabled.
///
/// This allows binding a port still in `TIME_WAIT`, which matters for fast
/// restarts during testing.
fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_core::{LogIndex, Term};
    use caravel_raft::{Message, RequestVoteRequest};

    fn addr(port: u16) -> Address {
        Address::parse(&format!("/ip4/127.0.0.1/tcp/{port}")).unwrap()
    }

    fn vote_request(from: u16, to: u16) -> Message {
        Message::RequestVote(RequestVoteRequest {
            term: Term::new(1),
            candidate: addr(from),
            to: addr(to),
            last_log_index: LogIndex::ZERO,
            last_log_term: Term::ZERO,
        })
    }

    #[tokio::test]
    async fn test_transport_starts_and_shuts_down() {
        let dispatcher = Arc::new(IncomingDispatcher::default());
        let transport = TcpTransport::start(addr(0), dispatcher).await.unwrap();

        assert!(!transport.is_shutdown().await);
        transport.shutdown().await;
        assert!(transport.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let dispatcher = Arc::new(IncomingDispatcher::default());
        let transport = TcpTransport::start(addr(0), dispatcher).await.unwrap();
        transport.shutdown().await;

        let result = transport.send(vote_request(0, 9)).await;
        assert!(matches!(result, Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_messages() {
        let receiver_dispatcher = Arc::new(IncomingDispatcher::default());
        let receiver = TcpTransport::start(addr(19201), Arc::clone(&receiver_dispatcher))
            .await
            .unwrap();

        let sender_dispatcher = Arc::new(IncomingDispatcher::default());
        let sender = TcpTransport::start(addr(19202), sender_dispatcher)
            .await
            .unwrap();

        let message = vote_request(19202, 19201);
        sender.send(message.clone()).await.unwrap();

        // Delivery is asynchronous; poll the dispatcher briefly.
        let mut received = None;
        for _ in 0..50 {
            if let Some(m) = receiver_dispatcher.next() {
                received = Some(m);
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }

        assert_eq!(received, Some(message));
        sender.shutdown().await;
        receiver.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_is_not_fatal() {
        let dispatcher = Arc::new(IncomingDispatcher::default());
        let transport = TcpTransport::start(addr(0), dispatcher).await.unwrap();

        // Nothing listens on this port; the send queues and the connect
        // failure stays inside the sender task.
        let result = transport.send(vote_request(0, 1)).await;
        assert!(result.is_ok());

        transport.shutdown().await;
    }
}
