//! Caravel Runtime - the async shell around the consensus engine.
//!
//! This crate bridges concurrent network I/O and the strictly serialized
//! consensus engine from `caravel-raft`:
//!
//! - [`IncomingDispatcher`]: a bounded FIFO absorbing inbound bursts,
//!   dropping the oldest messages under overload
//! - codec: length-prefixed binary framing for peer messages
//! - [`TcpTransport`]: peer connections, reconnect-on-failure
//! - [`ConsensusServer`]: the single consumer loop that owns all engine
//!   state, driven by the dispatcher, two timers, and client commands
//!
//! Engine state is mutated by exactly one task; everything else talks to
//! it through channels.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
mod config;
mod dispatcher;
mod server;
mod transport;

pub use config::{ConfigError, NodeConfig, TimingConfig};
pub use dispatcher::IncomingDispatcher;
pub use server::{ConsensusServer, ServerEvent, ServerHandle, ServerStatus, StateMachine};
pub use transport::{TcpTransport, Transport, TransportError, TransportResult};
