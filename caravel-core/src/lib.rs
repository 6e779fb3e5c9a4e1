//! Caravel Core - endpoint addresses and strongly-typed identifiers.
//!
//! This crate provides the leaf types shared by every Caravel crate:
//! canonical cluster endpoint addresses, Raft term and log-index wrappers,
//! and system-wide limits. It performs no I/O and has no dependencies.
//!
//! # Design Principles
//!
//! - **Canonical identity**: every accepted address shape reduces to one
//!   canonical string, so equality is never a question of representation
//! - **Strongly-typed counters**: `Term` and `LogIndex` cannot be mixed up
//! - **Explicit limits**: every buffer and queue has a bounded maximum
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod address;
mod error;
mod types;

pub mod limits;

pub use address::{Address, AddressInput};
pub use error::{AddressError, Result};
pub use types::{LogIndex, Term};
