//! Caravel Raft - the consensus engine.
//!
//! This crate implements the Raft consensus algorithm as a pure state
//! machine: the engine takes inputs (peer messages, timer events, client
//! submissions) and produces outputs (messages to send, timers to reset,
//! entries to commit) but performs no I/O itself. The async runtime shell
//! lives in `caravel-runtime`; this separation keeps every safety-critical
//! transition unit-testable with plain function calls.
//!
//! # Safety properties
//!
//! - **Election safety**: at most one leader per term
//! - **Log matching**: logs that agree on the term at an index agree on
//!   every entry up to that index
//! - **Leader completeness**: a committed entry is present in the log of
//!   every subsequent leader
//!
//! # No unsafe code, no silent failures

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod config;
mod log;
mod membership;
mod message;
mod state;
mod storage;

pub use client::{CommandError, CommandOutcome, PendingCommands};
pub use config::EngineConfig;
pub use log::{LogEntry, ReplicatedLog};
pub use membership::{MembershipChange, NodePool};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Message, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{ConsensusEngine, EngineOutput, Role};
pub use storage::{HardState, LogStore, MemoryLogStore, StorageError, StorageResult};
