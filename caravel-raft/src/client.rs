//! Client command outcomes and pending-request tracking.
//!
//! A client command either commits on a majority and returns the applied
//! result, or fails with a structured, retryable error. The error codes
//! mirror the wire-level protocol: clients redirect on `ENOTLEADER`, back
//! off and retry on `ENOMAJORITY`, and restart from scratch on
//! `EOUTDATEDTERM`.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use caravel_core::{Address, LogIndex, Term};
use tokio::sync::oneshot;

/// Why a client command was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// This node is not the leader; redirect to `leader_hint` if present.
    NotLeader {
        /// The current leader, when known.
        leader_hint: Option<Address>,
    },
    /// The leader could not confirm majority reachability within the probe
    /// window.
    NoMajority,
    /// The leader's term was superseded while the command was in flight.
    OutdatedTerm {
        /// The current leader, when known.
        leader_hint: Option<Address>,
    },
    /// The node is shutting down or the engine loop is gone.
    Unavailable,
    /// The command did not commit within the operation timeout.
    Timeout,
}

impl CommandError {
    /// Returns the wire-level error code for this failure.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotLeader { .. } => "ENOTLEADER",
            Self::NoMajority => "ENOMAJORITY",
            Self::OutdatedTerm { .. } => "EOUTDATEDTERM",
            Self::Unavailable => "EUNAVAILABLE",
            Self::Timeout => "ETIMEDOUT",
        }
    }

    /// Returns the leader hint carried by this failure, if any.
    #[must_use]
    pub const fn leader_hint(&self) -> Option<&Address> {
        match self {
            Self::NotLeader { leader_hint } | Self::OutdatedTerm { leader_hint } => {
                leader_hint.as_ref()
            }
            _ => None,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLeader { leader_hint: Some(leader) } => {
                write!(f, "not leader, try {leader}")
            }
            Self::NotLeader { leader_hint: None } => write!(f, "not leader"),
            Self::NoMajority => write!(f, "majority of cluster unreachable"),
            Self::OutdatedTerm { .. } => write!(f, "term superseded while command in flight"),
            Self::Unavailable => write!(f, "node unavailable"),
            Self::Timeout => write!(f, "command timed out"),
        }
    }
}

impl std::error::Error for CommandError {}

/// The outcome of a committed-and-applied client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// The log index the command committed at.
    pub index: LogIndex,
    /// The state machine's result for the command.
    pub result: Bytes,
}

/// Tracks commands waiting for majority commit on the leader.
///
/// Each pending command is keyed by the log index it was appended at and
/// remembers the term of that append: a command only resolves successfully
/// if the entry commits in the same term it was proposed in.
#[derive(Debug, Default)]
pub struct PendingCommands {
    waiting: HashMap<LogIndex, (Term, oneshot::Sender<Result<CommandOutcome, CommandError>>)>,
}

impl PendingCommands {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiting: HashMap::new(),
        }
    }

    /// Registers a command appended at `index` in `term`.
    pub fn register(
        &mut self,
        index: LogIndex,
        term: Term,
        respond: oneshot::Sender<Result<CommandOutcome, CommandError>>,
    ) {
        self.waiting.insert(index, (term, respond));
    }

    /// Resolves the command at `index` with the applied result.
    ///
    /// The command resolves successfully only when the committed entry's
    /// term matches the term it was proposed in; a conflicting entry that
    /// committed at the same index under a newer leader resolves the
    /// original command as outdated.
    pub fn complete(
        &mut self,
        index: LogIndex,
        committed_term: Term,
        result: Bytes,
        leader_hint: Option<&Address>,
    ) {
        if let Some((proposed_term, respond)) = self.waiting.remove(&index) {
            let outcome = if proposed_term == committed_term {
                Ok(CommandOutcome { index, result })
            } else {
                Err(CommandError::OutdatedTerm {
                    leader_hint: leader_hint.cloned(),
                })
            };
            let _ = respond.send(outcome);
        }
    }

    /// Fails every pending command, used when leadership is lost.
    pub fn fail_all(&mut self, error: &CommandError) {
        for (_, (_, respond)) in self.waiting.drain() {
            let _ = respond.send(Err(error.clone()));
        }
    }

    /// Returns the number of commands still waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Returns true if no commands are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
