//! The consensus state machine.
//!
//! [`ConsensusEngine`] is a pure state machine: it consumes one input at a
//! time (a peer message, a timer event, or a client submission), mutates
//! its state, and returns the [`EngineOutput`]s the runtime must execute.
//! It performs no I/O and contains no randomness, which keeps every
//! transition deterministic and directly testable.
//!
//! All consensus-state mutation funnels through these handlers; the runtime
//! guarantees they are invoked from a single consumer task.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use caravel_core::{Address, LogIndex, Term};

use crate::client::CommandError;
use crate::config::EngineConfig;
use crate::log::{LogEntry, ReplicatedLog};
use crate::membership::NodePool;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Message, RequestVoteRequest, RequestVoteResponse,
};
use crate::storage::HardState;

/// The role a node plays in the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Passive: answers RPCs, waits for heartbeats.
    #[default]
    Follower,
    /// Actively soliciting votes.
    Candidate,
    /// Replicating the log and admitting client commands.
    Leader,
}

/// An effect the runtime must carry out after a handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    /// Send a message to the peer it names.
    Send(Message),
    /// Restart the (randomized) election timer.
    ResetElectionTimer,
    /// Restart the heartbeat timer.
    ResetHeartbeatTimer,
    /// Persist the hard state before any dependent message leaves the node.
    PersistHardState(HardState),
    /// An entry reached majority commit and must be applied.
    Commit {
        /// The committed entry.
        entry: LogEntry,
    },
    /// This node won an election.
    BecameLeader,
    /// This node lost leadership to a higher term.
    SteppedDown,
}

/// The Raft consensus engine for one node.
#[derive(Debug)]
pub struct ConsensusEngine {
    config: EngineConfig,
    pool: NodePool,

    // Persistent state (mirrored to the durable store via outputs).
    current_term: Term,
    voted_for: Option<Address>,
    log: ReplicatedLog,

    // Volatile state.
    role: Role,
    commit_index: LogIndex,
    last_applied: LogIndex,
    leader_hint: Option<Address>,

    // Leader state, reinitialized after each election win.
    next_index: HashMap<Address, LogIndex>,
    match_index: HashMap<Address, LogIndex>,

    // Candidate state. The peer snapshot and quorum denominator are frozen
    // when the candidacy starts so a membership change mid-election cannot
    // retroactively alter the tally.
    votes_received: HashSet<Address>,
    election_peers: Vec<Address>,
    election_quorum: usize,

    // Reachability probe: the epoch advances on each heartbeat firing and
    // every received message stamps its sender.
    probe_epoch: u64,
    last_contact: HashMap<Address, u64>,
}

impl ConsensusEngine {
    /// Creates an engine over the given membership pool.
    ///
    /// # Panics
    /// Panics if the pool's local address does not match the engine's.
    #[must_use]
    pub fn new(config: EngineConfig, pool: NodePool) -> Self {
        assert!(
            pool.local() == Some(&config.local),
            "pool local address must match engine address"
        );

        Self {
            config,
            pool,
            current_term: Term::ZERO,
            voted_for: None,
            log: ReplicatedLog::new(),
            role: Role::Follower,
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            leader_hint: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            election_peers: Vec::new(),
            election_quorum: usize::MAX,
            probe_epoch: 0,
            last_contact: HashMap::new(),
        }
    }

    /// Restores persisted state into a freshly created engine.
    ///
    /// Must be called before the engine processes any input.
    pub fn restore(&mut self, state: HardState, entries: Vec<LogEntry>) {
        debug_assert!(self.log.is_empty() && self.current_term == Term::ZERO);

        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
        for entry in entries {
            self.log.append(entry);
        }
    }

    /// Returns this node's address.
    #[must_use]
    pub const fn local(&self) -> &Address {
        &self.config.local
    }

    /// Returns the current role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Returns true if this node is the leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Returns the current term.
    #[must_use]
    pub const fn current_term(&self) -> Term {
        self.current_term
    }

    /// Returns the believed current leader, if known.
    #[must_use]
    pub const fn leader_hint(&self) -> Option<&Address> {
        self.leader_hint.as_ref()
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Returns the index of the last applied entry.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns the replicated log.
    #[must_use]
    pub const fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    /// Returns the membership pool.
    #[must_use]
    pub const fn pool(&self) -> &NodePool {
        &self.pool
    }

    /// Returns the membership pool for mutation.
    ///
    /// Membership changes take effect at the next quorum decision; they
    /// never alter a tally already in flight.
    pub fn pool_mut(&mut self) -> &mut NodePool {
        &mut self.pool
    }

    /// Returns the hard state that must survive a crash.
    #[must_use]
    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        }
    }

    /// Handles the election timer firing.
    ///
    /// Starts (or restarts) a candidacy: a follower or candidate increments
    /// its term, votes for itself, and solicits votes from the membership
    /// snapshot taken at this instant.
    pub fn handle_election_timeout(&mut self) -> Vec<EngineOutput> {
        if self.role == Role::Leader {
            return Vec::new();
        }

        let prev_term = self.current_term;

        self.current_term = self.current_term.next();
        self.role = Role::Candidate;
        self.voted_for = Some(self.config.local.clone());
        self.leader_hint = None;
        self.votes_received.clear();
        self.votes_received.insert(self.config.local.clone());
        self.election_peers = self.pool.addresses();
        self.election_quorum = self.pool.quorum_size();

        debug_assert_eq!(self.current_term, prev_term.next());

        let mut outputs = vec![
            EngineOutput::PersistHardState(self.hard_state()),
            EngineOutput::ResetElectionTimer,
        ];

        for peer in self.election_peers.clone() {
            outputs.push(EngineOutput::Send(Message::RequestVote(
                RequestVoteRequest {
                    term: self.current_term,
                    candidate: self.config.local.clone(),
                    to: peer,
                    last_log_index: self.log.last_index(),
                    last_log_term: self.log.last_term(),
                },
            )));
        }

        // A single-node cluster wins immediately.
        if self.votes_received.len() >= self.election_quorum {
            outputs.extend(self.become_leader());
        }

        outputs
    }

    /// Handles the heartbeat timer firing.
    ///
    /// Leaders advance the reachability probe epoch and replicate to every
    /// member; other roles ignore the event.
    pub fn handle_heartbeat_timeout(&mut self) -> Vec<EngineOutput> {
        if self.role != Role::Leader {
            return Vec::new();
        }

        self.probe_epoch += 1;

        let mut outputs = Vec::new();
        for peer in self.pool.addresses() {
            outputs.push(self.append_entries_for(&peer));
        }
        outputs.push(EngineOutput::ResetHeartbeatTimer);
        outputs
    }

    /// Handles one inbound peer message.
    pub fn handle_message(&mut self, message: Message) -> Vec<EngineOutput> {
        self.last_contact
            .insert(message.from().clone(), self.probe_epoch);

        let mut outputs = Vec::new();

        // A higher term always wins: adopt it and downgrade before the
        // message body is processed.
        if message.term() > self.current_term {
            outputs.extend(self.step_down(message.term()));
        }

        match message {
            Message::RequestVote(req) => outputs.extend(self.handle_request_vote(&req)),
            Message::RequestVoteResponse(resp) => {
                outputs.extend(self.handle_request_vote_response(&resp));
            }
            Message::AppendEntries(req) => outputs.extend(self.handle_append_entries(req)),
            Message::AppendEntriesResponse(resp) => {
                outputs.extend(self.handle_append_entries_response(&resp));
            }
        }

        outputs
    }

    /// Admits a client command for replication.
    ///
    /// On success the command has been appended locally and replication has
    /// started; it is **not** yet committed. The returned index identifies
    /// the command for commit tracking.
    ///
    /// # Errors
    /// - [`CommandError::NotLeader`] when this node is not the leader
    /// - [`CommandError::NoMajority`] when a majority of the membership was
    ///   not reachable within the probe window
    pub fn submit(
        &mut self,
        command: Bytes,
    ) -> Result<(LogIndex, Vec<EngineOutput>), CommandError> {
        if self.role != Role::Leader {
            return Err(CommandError::NotLeader {
                leader_hint: self.leader_hint.clone(),
            });
        }

        if !self.majority_reachable() {
            return Err(CommandError::NoMajority);
        }

        let index = self.log.last_index().next();
        self.log
            .append(LogEntry::new(self.current_term, index, command));

        let mut outputs = Vec::new();
        for peer in self.pool.addresses() {
            outputs.push(self.append_entries_for(&peer));
        }

        // A single-node cluster commits immediately.
        outputs.extend(self.try_advance_commit());

        Ok((index, outputs))
    }

    /// True iff a strict majority of the current membership answered within
    /// the probe window.
    fn majority_reachable(&self) -> bool {
        let window = self.config.probe_epochs;
        let mut reachable = 1; // self
        for peer in &self.pool.addresses() {
            if let Some(&stamp) = self.last_contact.get(peer) {
                if self.probe_epoch - stamp <= window {
                    reachable += 1;
                }
            }
        }
        reachable >= self.pool.quorum_size()
    }

    /// Adopts a newer term and downgrades to follower.
    fn step_down(&mut self, new_term: Term) -> Vec<EngineOutput> {
        debug_assert!(new_term > self.current_term);

        let was_leader = self.role == Role::Leader;

        self.current_term = new_term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.votes_received.clear();
        self.leader_hint = None;

        let mut outputs = vec![EngineOutput::PersistHardState(self.hard_state())];
        if was_leader {
            outputs.push(EngineOutput::SteppedDown);
            outputs.push(EngineOutput::ResetElectionTimer);
        }
        outputs
    }

    fn handle_request_vote(&mut self, req: &RequestVoteRequest) -> Vec<EngineOutput> {
        let mut outputs = Vec::new();

        let grant = req.term >= self.current_term
            && self
                .voted_for
                .as_ref()
                .is_none_or(|voted| *voted == req.candidate)
            && self
                .log
                .candidate_is_up_to_date(req.last_log_term, req.last_log_index);

        if grant {
            self.voted_for = Some(req.candidate.clone());
            outputs.push(EngineOutput::PersistHardState(self.hard_state()));
            outputs.push(EngineOutput::ResetElectionTimer);
        }

        outputs.push(EngineOutput::Send(Message::RequestVoteResponse(
            RequestVoteResponse {
                term: self.current_term,
                from: self.config.local.clone(),
                to: req.candidate.clone(),
                vote_granted: grant,
            },
        )));

        outputs
    }

    fn handle_request_vote_response(&mut self, resp: &RequestVoteResponse) -> Vec<EngineOutput> {
        // Responses from a term we have left, or arriving when we are no
        // longer a candidate, apply to a stale context and are discarded.
        if self.role != Role::Candidate || resp.term != self.current_term {
            return Vec::new();
        }

        if !resp.vote_granted {
            return Vec::new();
        }

        // Only nodes in the frozen candidacy snapshot count toward the
        // frozen denominator.
        if !self.election_peers.contains(&resp.from) {
            return Vec::new();
        }

        self.votes_received.insert(resp.from.clone());

        if self.votes_received.len() >= self.election_quorum {
            self.become_leader()
        } else {
            Vec::new()
        }
    }

    fn become_leader(&mut self) -> Vec<EngineOutput> {
        debug_assert!(self.votes_received.len() >= self.election_quorum);

        self.role = Role::Leader;
        self.leader_hint = Some(self.config.local.clone());

        let next = self.log.last_index().next();
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.pool.addresses() {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer, LogIndex::ZERO);
        }

        let mut outputs = vec![EngineOutput::BecameLeader, EngineOutput::ResetHeartbeatTimer];
        for peer in self.pool.addresses() {
            outputs.push(self.append_entries_for(&peer));
        }
        outputs
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Vec<EngineOutput> {
        let mut outputs = Vec::new();

        if req.term < self.current_term {
            outputs.push(EngineOutput::Send(Message::AppendEntriesResponse(
                AppendEntriesResponse {
                    term: self.current_term,
                    from: self.config.local.clone(),
                    to: req.leader.clone(),
                    success: false,
                    match_index: self.log.last_index(),
                },
            )));
            return outputs;
        }

        // A legitimate leader exists for this term: a candidate yields.
        if self.role == Role::Candidate {
            self.role = Role::Follower;
            self.votes_received.clear();
        }

        self.leader_hint = Some(req.leader.clone());
        outputs.push(EngineOutput::ResetElectionTimer);

        // Log-matching check at prev_log_index.
        let log_ok = req.prev_log_index == LogIndex::ZERO
            || (self.log.get(req.prev_log_index).is_some()
                && self.log.term_at(req.prev_log_index) == req.prev_log_term);

        if !log_ok {
            outputs.push(EngineOutput::Send(Message::AppendEntriesResponse(
                AppendEntriesResponse {
                    term: self.current_term,
                    from: self.config.local.clone(),
                    to: req.leader.clone(),
                    success: false,
                    match_index: self.log.last_index(),
                },
            )));
            return outputs;
        }

        let matched = LogIndex::new(req.prev_log_index.get() + req.entries.len() as u64);
        if !req.entries.is_empty() {
            self.log.append_entries(req.entries);
        }

        // Follow the leader's commit index, clamped to our own log.
        if req.leader_commit > self.commit_index {
            let new_commit = req.leader_commit.min(self.log.last_index());
            outputs.extend(self.apply_up_to(new_commit));
        }

        outputs.push(EngineOutput::Send(Message::AppendEntriesResponse(
            AppendEntriesResponse {
                term: self.current_term,
                from: self.config.local.clone(),
                to: req.leader,
                success: true,
                match_index: matched,
            },
        )));

        outputs
    }

    fn handle_append_entries_response(
        &mut self,
        resp: &AppendEntriesResponse,
    ) -> Vec<EngineOutput> {
        // Stale context: we are not leading, or the response belongs to a
        // term we have left.
        if self.role != Role::Leader || resp.term != self.current_term {
            return Vec::new();
        }

        if resp.success {
            self.match_index
                .insert(resp.from.clone(), resp.match_index);
            self.next_index
                .insert(resp.from.clone(), resp.match_index.next());
            self.try_advance_commit()
        } else {
            // The follower's log diverges before next_index: back off and
            // retry. Its reported last index bounds how far back we need
            // to probe.
            let current = self
                .next_index
                .get(&resp.from)
                .copied()
                .unwrap_or_else(|| LogIndex::new(1));
            let backed_off = current.get().saturating_sub(1).max(1);
            let capped = backed_off.min(resp.match_index.get() + 1).max(1);
            self.next_index
                .insert(resp.from.clone(), LogIndex::new(capped));

            vec![self.append_entries_for(&resp.from)]
        }
    }

    /// Builds the append request for one peer from its next_index.
    fn append_entries_for(&self, peer: &Address) -> EngineOutput {
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or_else(|| self.log.last_index().next());
        let prev_index = LogIndex::new(next.get().saturating_sub(1));
        let prev_term = self.log.term_at(prev_index);

        let mut entries = self.log.entries_from(next);
        entries.truncate(self.config.max_entries_per_append);

        EngineOutput::Send(Message::AppendEntries(AppendEntriesRequest {
            term: self.current_term,
            leader: self.config.local.clone(),
            to: peer.clone(),
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            leader_commit: self.commit_index,
        }))
    }

    /// Advances the commit index to the highest current-term entry
    /// replicated on a strict majority of the current membership.
    ///
    /// Prior-term entries are never counted directly; they commit
    /// transitively when a current-term entry beyond them commits.
    fn try_advance_commit(&mut self) -> Vec<EngineOutput> {
        if self.role != Role::Leader {
            return Vec::new();
        }

        let members = self.pool.addresses();
        let quorum = self.pool.quorum_size();
        let prev_commit = self.commit_index;

        let mut highest = self.commit_index;
        for n in (self.commit_index.get() + 1)..=self.log.last_index().get() {
            let index = LogIndex::new(n);

            if self.log.term_at(index) != self.current_term {
                continue;
            }

            let mut count = 1; // the leader holds every entry of its own log
            for peer in &members {
                if self.match_index.get(peer).copied().unwrap_or(LogIndex::ZERO) >= index {
                    count += 1;
                }
            }

            if count >= quorum {
                highest = index;
            }
        }

        let outputs = self.apply_up_to(highest);
        debug_assert!(self.commit_index >= prev_commit);
        outputs
    }

    /// Raises the commit index and emits a commit output per newly
    /// committed entry, in log order.
    fn apply_up_to(&mut self, new_commit: LogIndex) -> Vec<EngineOutput> {
        debug_assert!(new_commit <= self.log.last_index());

        let mut outputs = Vec::new();
        if new_commit <= self.commit_index {
            return outputs;
        }

        self.commit_index = new_commit;
        while self.last_applied < self.commit_index {
            let index = self.last_applied.next();
            if let Some(entry) = self.log.get(index) {
                outputs.push(EngineOutput::Commit {
                    entry: entry.clone(),
                });
            }
            self.last_applied = index;
        }

        debug_assert_eq!(self.last_applied, self.commit_index);
        outputs
    }
}
