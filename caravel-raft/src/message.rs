//! Peer RPC message types.
//!
//! The conceptual wire contract between cluster nodes. Each message carries
//! its source and destination [`Address`] so the transport can route it
//! without inspecting the payload; the term field is the sole basis for
//! establishing causal precedence across peers.

use bytes::Bytes;
use caravel_core::{Address, LogIndex, Term};

use crate::log::LogEntry;

/// A message exchanged between cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A candidate soliciting a vote.
    RequestVote(RequestVoteRequest),
    /// A voter's answer to a vote solicitation.
    RequestVoteResponse(RequestVoteResponse),
    /// Log replication from a leader (empty entries form the heartbeat).
    AppendEntries(AppendEntriesRequest),
    /// A follower's answer to a replication request.
    AppendEntriesResponse(AppendEntriesResponse),
}

impl Message {
    /// Returns the address of the node that sent this message.
    #[must_use]
    pub const fn from(&self) -> &Address {
        match self {
            Self::RequestVote(r) => &r.candidate,
            Self::RequestVoteResponse(r) => &r.from,
            Self::AppendEntries(r) => &r.leader,
            Self::AppendEntriesResponse(r) => &r.from,
        }
    }

    /// Returns the address this message is destined for.
    #[must_use]
    pub const fn to(&self) -> &Address {
        match self {
            Self::RequestVote(r) => &r.to,
            Self::RequestVoteResponse(r) => &r.to,
            Self::AppendEntries(r) => &r.to,
            Self::AppendEntriesResponse(r) => &r.to,
        }
    }

    /// Returns the term this message was sent in.
    #[must_use]
    pub const fn term(&self) -> Term {
        match self {
            Self::RequestVote(r) => r.term,
            Self::RequestVoteResponse(r) => r.term,
            Self::AppendEntries(r) => r.term,
            Self::AppendEntriesResponse(r) => r.term,
        }
    }
}

/// `RequestVote` RPC: sent by candidates to gather votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// The candidate requesting the vote.
    pub candidate: Address,
    /// Target voter.
    pub to: Address,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// `RequestVote` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// The voter's current term, for the candidate to update itself.
    pub term: Term,
    /// The voter.
    pub from: Address,
    /// The candidate that asked.
    pub to: Address,
    /// True if the vote was granted.
    pub vote_granted: bool,
}

/// `AppendEntries` RPC: log replication and heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// The leader sending this request.
    pub leader: Address,
    /// Target follower.
    pub to: Address,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Returns true if this request carries no entries.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `AppendEntries` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// The follower's current term, for the leader to update itself.
    pub term: Term,
    /// The follower.
    pub from: Address,
    /// The leader that asked.
    pub to: Address,
    /// True if the follower's log matched at `prev_log_index`.
    pub success: bool,
    /// The follower's last log index after the append (for fast catch-up).
    pub match_index: LogIndex,
}

/// A command submitted by a client for replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    /// The opaque command payload.
    pub command: Bytes,
}

impl ClientCommand {
    /// Creates a new client command.
    #[must_use]
    pub const fn new(command: Bytes) -> Self {
        Self { command }
    }
}
