//! Caravel Tests - simulation and integration tests.
//!
//! This crate holds everything that exercises more than one Caravel crate
//! at a time. Tests are organized by level:
//!
//! **Simulation tests** (`raft_tests`, `partition_tests`): drive pure
//! [`caravel_raft::ConsensusEngine`] instances through a deterministic
//! in-memory message router with scripted timeouts, delivery, and
//! partitions. Safety properties are checked after every step.
//!
//! **Integration tests** (`server_tests`): run full
//! [`caravel_runtime::ConsensusServer`] loops - real timers, dispatchers,
//! and pending-command tracking - over an in-memory transport.
//!
//! **Support modules**:
//! - [`cluster`]: the deterministic engine-level simulator
//! - [`net`]: the in-memory [`caravel_runtime::Transport`] with severing
//! - [`properties`]: safety-property definitions and the checker
//!
//! Unit tests live inline in each crate under `#[cfg(test)]`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cluster;
pub mod net;
pub mod properties;

#[cfg(test)]
mod partition_tests;
#[cfg(test)]
mod raft_tests;
#[cfg(test)]
mod server_tests;
