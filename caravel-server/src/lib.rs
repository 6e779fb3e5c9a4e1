//! Caravel consensus node.
//!
//! This crate hosts the replicated key/value state machine applied from
//! committed log entries, and the line-based TCP surface clients talk to.
//! The consensus machinery itself lives in `caravel-raft` and
//! `caravel-runtime`; this crate only wires it to an application.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod kv;

pub use kv::{KvCommand, KvError, KvResponse, KvStore};
