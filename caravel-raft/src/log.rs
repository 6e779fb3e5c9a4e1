//! The replicated command log.
//!
//! An ordered, append-only sequence of `{term, index, command}` entries.
//! Entries below the commit index are immutable; uncommitted entries may be
//! truncated and replaced when a new leader's log conflicts (the standard
//! log-matching rule).

use bytes::Bytes;
use caravel_core::{LogIndex, Term};

/// A single entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The term of the leader that created this entry.
    pub term: Term,
    /// The position of this entry in the log (1-based).
    pub index: LogIndex,
    /// The opaque command payload.
    pub command: Bytes,
}

impl LogEntry {
    /// Creates a new log entry.
    #[must_use]
    pub const fn new(term: Term, index: LogIndex, command: Bytes) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// In-memory replicated log.
///
/// Index 0 means "before the first entry": an empty log reports
/// `last_index() == 0` and `last_term() == 0`.
#[derive(Debug, Default)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
}

impl ReplicatedLog {
    /// Creates a new empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Returns true if the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of entries in the log.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Returns the index of the last entry, or 0 if empty.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        LogIndex::new(self.entries.len() as u64)
    }

    /// Returns the term of the last entry, or 0 if empty.
    #[must_use]
    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(Term::ZERO, |e| e.term)
    }

    /// Gets the entry at `index`, if present.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index.get() == 0 {
            return None;
        }
        self.entries.get((index.get() - 1) as usize)
    }

    /// Returns the term of the entry at `index`, or 0 if absent.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> Term {
        self.get(index).map_or(Term::ZERO, |e| e.term)
    }

    /// Appends a single entry.
    ///
    /// # Panics
    /// Panics if the entry index is not the next sequential index.
    pub fn append(&mut self, entry: LogEntry) {
        let expected = self.last_index().next();
        assert_eq!(
            entry.index, expected,
            "log entry index must be sequential: expected {}, got {}",
            expected.get(),
            entry.index.get()
        );
        self.entries.push(entry);
    }

    /// Appends entries received from a leader, resolving conflicts.
    ///
    /// An existing entry whose term differs from the incoming entry at the
    /// same index is a conflict: the log is truncated from that point and
    /// the incoming entries take its place. Entries already present with a
    /// matching term are left untouched.
    pub fn append_entries(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            if let Some(existing) = self.get(entry.index) {
                if existing.term == entry.term {
                    continue;
                }
                self.truncate_after(LogIndex::new(entry.index.get() - 1));
            }
            if entry.index > self.last_index() {
                self.append(entry);
            }
        }
    }

    /// Truncates the log, keeping entries up to and including `last_to_keep`.
    pub fn truncate_after(&mut self, last_to_keep: LogIndex) {
        self.entries.truncate(last_to_keep.get() as usize);
    }

    /// Returns a copy of all entries from `start` to the end of the log.
    #[must_use]
    pub fn entries_from(&self, start: LogIndex) -> Vec<LogEntry> {
        if start.get() == 0 || start > self.last_index() {
            return Vec::new();
        }
        self.entries[(start.get() - 1) as usize..].to_vec()
    }

    /// Returns true iff a candidate log ending at `(candidate_term,
    /// candidate_index)` is at least as up-to-date as this log.
    ///
    /// Compared lexicographically by `(last term, last index)`; used by the
    /// vote-granting rule.
    #[must_use]
    pub fn candidate_is_up_to_date(&self, candidate_term: Term, candidate_index: LogIndex) -> bool {
        let my_term = self.last_term();
        let my_index = self.last_index();

        candidate_term > my_term || (candidate_term == my_term && candidate_index >= my_index)
    }
}
