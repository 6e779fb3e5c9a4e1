//! Deterministic engine-level cluster simulator.
//!
//! Drives a set of pure [`ConsensusEngine`] instances with scripted timer
//! events and controlled message delivery. There are no timers, no tasks,
//! and no randomness: the test decides which node times out, which
//! messages are delivered, and which links are severed, so every
//! interleaving is reproducible.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use caravel_core::{Address, LogIndex, Term};
use caravel_raft::{
    CommandError, ConsensusEngine, EngineConfig, EngineOutput, LogEntry, Message, NodePool, Role,
};

/// Upper bound on messages delivered in one drain, against routing loops.
const DELIVERY_LIMIT: usize = 10_000;

/// One simulated node: an engine plus its observed commit sequence.
pub struct SimNode {
    engine: ConsensusEngine,
    committed: Vec<LogEntry>,
}

impl SimNode {
    /// Returns the node's engine for inspection.
    #[must_use]
    pub const fn engine(&self) -> &ConsensusEngine {
        &self.engine
    }

    /// Returns the entries this node has applied, in commit order.
    #[must_use]
    pub fn committed(&self) -> &[LogEntry] {
        &self.committed
    }
}

/// A simulated cluster with scripted delivery.
pub struct SimCluster {
    nodes: Vec<SimNode>,
    in_flight: VecDeque<Message>,
    severed: HashSet<Address>,
}

impl SimCluster {
    /// Creates a cluster of `size` nodes on consecutive loopback ports.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "cluster needs at least one node");

        let addresses: Vec<Address> = (0..size).map(|i| Self::address_for(i)).collect();

        let nodes = addresses
            .iter()
            .map(|local| {
                let peers: Vec<Address> = addresses
                    .iter()
                    .filter(|a| *a != local)
                    .cloned()
                    .collect();
                let pool = NodePool::new(peers, Some(local.clone()));
                SimNode {
                    engine: ConsensusEngine::new(EngineConfig::new(local.clone()), pool),
                    committed: Vec::new(),
                }
            })
            .collect();

        Self {
            nodes,
            in_flight: VecDeque::new(),
            severed: HashSet::new(),
        }
    }

    /// Returns the address of node `i`.
    ///
    /// # Panics
    /// Panics if the canonical form fails to parse, which it cannot.
    #[must_use]
    pub fn address_for(i: usize) -> Address {
        Address::parse(&format!("/ip4/127.0.0.1/tcp/{}", 9001 + i)).unwrap()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the cluster has no nodes. Never true in practice.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns node `i`.
    #[must_use]
    pub fn node(&self, i: usize) -> &SimNode {
        &self.nodes[i]
    }

    /// Returns every node.
    #[must_use]
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Returns the role of node `i`.
    #[must_use]
    pub fn role(&self, i: usize) -> Role {
        self.nodes[i].engine.role()
    }

    /// Returns the index of the current leader, if exactly one exists.
    #[must_use]
    pub fn leader(&self) -> Option<usize> {
        let mut leaders = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.engine.is_leader())
            .map(|(i, _)| i);
        let first = leaders.next()?;
        if leaders.next().is_some() {
            return None;
        }
        Some(first)
    }

    /// Returns the number of undelivered messages.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.in_flight.len()
    }

    /// Severs node `i` from the network in both directions.
    pub fn sever(&mut self, i: usize) {
        self.severed.insert(Self::address_for(i));
    }

    /// Reconnects node `i`.
    pub fn heal(&mut self, i: usize) {
        self.severed.remove(&Self::address_for(i));
    }

    /// Fires the election timer of node `i`.
    pub fn timeout(&mut self, i: usize) {
        let outputs = self.nodes[i].engine.handle_election_timeout();
        self.absorb(i, outputs);
    }

    /// Fires the heartbeat timer of node `i`.
    pub fn heartbeat(&mut self, i: usize) {
        let outputs = self.nodes[i].engine.handle_heartbeat_timeout();
        self.absorb(i, outputs);
    }

    /// Submits a client command to node `i`.
    ///
    /// # Errors
    /// Propagates the engine's admission errors.
    pub fn submit(&mut self, i: usize, command: &str) -> Result<LogIndex, CommandError> {
        let (index, outputs) = self.nodes[i]
            .engine
            .submit(Bytes::from(command.to_string()))?;
        self.absorb(i, outputs);
        Ok(index)
    }

    /// Delivers every in-flight message, including those produced along
    /// the way, until the network is quiet.
    ///
    /// # Panics
    /// Panics if delivery does not quiesce, which indicates a message loop.
    pub fn deliver_all(&mut self) -> usize {
        self.deliver(DELIVERY_LIMIT)
    }

    /// Delivers up to `limit` messages in FIFO order; returns the number
    /// actually delivered. Messages to or from severed nodes are dropped
    /// without counting.
    ///
    /// # Panics
    /// Panics if `limit == DELIVERY_LIMIT` messages were delivered without
    /// the network quiescing.
    pub fn deliver(&mut self, limit: usize) -> usize {
        let mut delivered = 0;
        while delivered < limit {
            let Some(message) = self.in_flight.pop_front() else {
                return delivered;
            };
            if self.severed.contains(message.to()) || self.severed.contains(message.from()) {
                continue;
            }

            let target = self
                .index_of(message.to())
                .expect("message addressed outside the cluster");
            let outputs = self.nodes[target].engine.handle_message(message);
            self.absorb(target, outputs);
            delivered += 1;
        }
        assert!(
            delivered < DELIVERY_LIMIT,
            "network failed to quiesce after {DELIVERY_LIMIT} messages"
        );
        delivered
    }

    /// Discards every undelivered message, simulating loss.
    pub fn drop_pending(&mut self) {
        self.in_flight.clear();
    }

    /// Convenience: elect node `i` by firing its timer and letting the
    /// whole exchange play out.
    pub fn elect(&mut self, i: usize) {
        self.timeout(i);
        self.deliver_all();
    }

    /// Folds a node's outputs into the simulation.
    fn absorb(&mut self, from: usize, outputs: Vec<EngineOutput>) {
        let source_severed = self.severed.contains(&Self::address_for(from));
        for output in outputs {
            match output {
                EngineOutput::Send(message) => {
                    if !source_severed {
                        self.in_flight.push_back(message);
                    }
                }
                EngineOutput::Commit { entry } => {
                    self.nodes[from].committed.push(entry);
                }
                // Timer resets and persistence are runtime concerns; the
                // simulator scripts time explicitly.
                EngineOutput::PersistHardState(_)
                | EngineOutput::ResetElectionTimer
                | EngineOutput::ResetHeartbeatTimer
                | EngineOutput::BecameLeader
                | EngineOutput::SteppedDown => {}
            }
        }
    }

    fn index_of(&self, address: &Address) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.engine.local() == address)
    }
}

/// Returns the terms under which each node currently claims leadership.
#[must_use]
pub fn leader_terms(cluster: &SimCluster) -> Vec<(usize, Term)> {
    cluster
        .nodes()
        .iter()
        .enumerate()
        .filter(|(_, n)| n.engine().is_leader())
        .map(|(i, n)| (i, n.engine().current_term()))
        .collect()
}
