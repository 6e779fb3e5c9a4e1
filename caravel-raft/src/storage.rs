//! The durable log/term store contract.
//!
//! Raft requires three things to survive a crash: the current term, the
//! vote cast in that term, and the log entries. This module defines the
//! seam the engine's runtime persists them through; durability mechanics
//! behind the seam (files, fsync, replication of the store itself) are a
//! collaborator concern.
//!
//! The engine stays a pure state machine: it never calls the store itself.
//! The runtime persists [`HardState`] before any response that reveals a
//! term or vote change leaves the node.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use caravel_core::{Address, LogIndex, Term};

use crate::log::LogEntry;

/// Persistent state that must survive crashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardState {
    /// Latest term this node has seen.
    pub current_term: Term,
    /// The candidate this node voted for in `current_term`, if any.
    pub voted_for: Option<Address>,
}

impl HardState {
    /// Creates the initial hard state of a fresh node.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_term: Term::ZERO,
            voted_for: None,
        }
    }

    /// Encodes the hard state.
    ///
    /// Format: term (8 bytes LE) + vote flag (1 byte) + vote address
    /// (u16 LE length + UTF-8 bytes, present only when the flag is 1).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.current_term.get());
        match &self.voted_for {
            Some(address) => {
                buf.put_u8(1);
                let id = address.id().as_bytes();
                // Canonical ids are far below u16::MAX bytes.
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u16_le(id.len() as u16);
                buf.put_slice(id);
            }
            None => buf.put_u8(0),
        }
    }

    /// Decodes a hard state, returning `None` on any malformation.
    #[must_use]
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 9 {
            return None;
        }
        let current_term = Term::new(buf.get_u64_le());
        let has_vote = buf.get_u8();

        let voted_for = if has_vote == 1 {
            if buf.remaining() < 2 {
                return None;
            }
            let len = buf.get_u16_le() as usize;
            if buf.remaining() < len {
                return None;
            }
            let raw = buf.copy_to_bytes(len);
            let id = std::str::from_utf8(&raw).ok()?;
            Some(Address::parse(id).ok()?)
        } else {
            None
        };

        Some(Self {
            current_term,
            voted_for,
        })
    }
}

impl Default for HardState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors from the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// An I/O failure in the backing medium.
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },
    /// Stored data failed validation.
    Corruption {
        /// Description of the corruption.
        message: String,
    },
    /// No entry exists at the requested index.
    NotFound {
        /// The index that was requested.
        index: LogIndex,
    },
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { operation, message } => {
                write!(f, "store I/O error during {operation}: {message}")
            }
            Self::Corruption { message } => write!(f, "store corruption: {message}"),
            Self::NotFound { index } => write!(f, "no entry at index {}", index.get()),
        }
    }
}

impl std::error::Error for StorageError {}

/// The durable log/term store.
///
/// Implementations must guarantee that data returned-as-written survives a
/// crash once the call succeeds (after `sync` for the log methods).
pub trait LogStore {
    /// Persists the hard state (term and vote).
    ///
    /// # Errors
    /// Returns an error if the state cannot be made durable.
    fn save_hard_state(&mut self, state: &HardState) -> StorageResult<()>;

    /// Loads the hard state, or `None` on a fresh start.
    ///
    /// # Errors
    /// Returns an error if stored state cannot be read.
    fn load_hard_state(&self) -> StorageResult<Option<HardState>>;

    /// Appends entries to the log atomically.
    ///
    /// # Errors
    /// Returns an error if the entries cannot be appended.
    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()>;

    /// Reads entries in `[start, end]` inclusive, clamped to the stored range.
    ///
    /// # Errors
    /// Returns an error if the entries cannot be read.
    fn entries(&self, start: LogIndex, end: LogIndex) -> StorageResult<Vec<LogEntry>>;

    /// Drops all entries after `last_to_keep`.
    ///
    /// # Errors
    /// Returns an error if truncation fails.
    fn truncate_after(&mut self, last_to_keep: LogIndex) -> StorageResult<()>;

    /// Returns the last stored index, or 0 if empty.
    fn last_index(&self) -> LogIndex;

    /// Returns the term of the last stored entry, or 0 if empty.
    fn last_term(&self) -> Term;

    /// Flushes all previous writes to stable storage.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    fn sync(&mut self) -> StorageResult<()>;
}

/// In-memory store for tests and single-process runs.
///
/// Provides no durability across process restarts.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    hard_state: Option<HardState>,
    entries: Vec<LogEntry>,
}

impl MemoryLogStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hard_state: None,
            entries: Vec::new(),
        }
    }
}

impl LogStore for MemoryLogStore {
    fn save_hard_state(&mut self, state: &HardState) -> StorageResult<()> {
        self.hard_state = Some(state.clone());
        Ok(())
    }

    fn load_hard_state(&self) -> StorageResult<Option<HardState>> {
        Ok(self.hard_state.clone())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        for entry in entries {
            let expected = self.entries.len() as u64 + 1;
            if entry.index.get() != expected {
                return Err(StorageError::Corruption {
                    message: format!(
                        "non-sequential entry: expected {expected}, got {}",
                        entry.index.get()
                    ),
                });
            }
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn entries(&self, start: LogIndex, end: LogIndex) -> StorageResult<Vec<LogEntry>> {
        if self.entries.is_empty() || start > end {
            return Ok(Vec::new());
        }
        let first = start.get().max(1);
        let last = end.get().min(self.entries.len() as u64);
        if first > last {
            return Ok(Vec::new());
        }
        Ok(self.entries[(first - 1) as usize..last as usize].to_vec())
    }

    fn truncate_after(&mut self, last_to_keep: LogIndex) -> StorageResult<()> {
        self.entries.truncate(last_to_keep.get() as usize);
        Ok(())
    }

    fn last_index(&self) -> LogIndex {
        LogIndex::new(self.entries.len() as u64)
    }

    fn last_term(&self) -> Term {
        self.entries.last().map_or(Term::ZERO, |e| e.term)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
