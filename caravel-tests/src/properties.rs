//! Safety-property definitions and the checker for simulation tests.
//!
//! Properties are invariants that must hold at every step of a simulated
//! run. Tests call [`PropertyChecker::record_state`] after each scripted
//! action and assert no violations at the end, so the failing step is the
//! first one that broke the invariant.

use std::collections::{BTreeMap, BTreeSet};

use caravel_core::Address;
use caravel_raft::Role;

use crate::cluster::SimCluster;

/// A violation of a Raft safety property.
#[derive(Debug, Clone)]
pub enum PropertyViolation {
    /// Multiple leaders claimed the same term.
    MultipleLeadersInTerm {
        /// The term with more than one leader.
        term: u64,
        /// The leaders' addresses.
        leaders: Vec<Address>,
    },
    /// Two logs disagree on the entry at an index they both hold.
    LogMismatch {
        /// The log index where the mismatch occurred.
        index: u64,
        /// The first node.
        node_a: Address,
        /// The term at the index on the first node.
        term_a: u64,
        /// The second node.
        node_b: Address,
        /// The term at the index on the second node.
        term_b: u64,
    },
    /// A committed entry vanished from a leader's log.
    MissingCommittedEntry {
        /// The committed entry's index.
        index: u64,
        /// The committed entry's term.
        term: u64,
        /// The leader missing it.
        leader: Address,
    },
    /// A node's commit index ran past its own log.
    CommitBeyondLog {
        /// The offending node.
        node: Address,
        /// Its commit index.
        commit_index: u64,
        /// Its last log index.
        last_log_index: u64,
    },
    /// Two nodes committed different entries at the same index.
    DivergentCommit {
        /// The commit index where the divergence occurred.
        index: u64,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MultipleLeadersInTerm { term, leaders } => {
                write!(f, "multiple leaders in term {term}: {leaders:?}")
            }
            Self::LogMismatch {
                index,
                node_a,
                term_a,
                node_b,
                term_b,
            } => write!(
                f,
                "log mismatch at index {index}: {node_a} has term {term_a}, \
                 {node_b} has term {term_b}"
            ),
            Self::MissingCommittedEntry {
                index,
                term,
                leader,
            } => write!(
                f,
                "committed entry (index={index}, term={term}) missing from leader {leader}"
            ),
            Self::CommitBeyondLog {
                node,
                commit_index,
                last_log_index,
            } => write!(
                f,
                "{node} commit index {commit_index} exceeds its log ({last_log_index})"
            ),
            Self::DivergentCommit { index } => {
                write!(f, "divergent committed entries at index {index}")
            }
        }
    }
}

/// Tracks cluster state across a simulated run and accumulates violations.
#[derive(Debug, Default)]
pub struct PropertyChecker {
    /// Leaders observed per term.
    leaders_by_term: BTreeMap<u64, BTreeSet<Address>>,
    /// Committed entries: index -> term, fixed forever once observed.
    committed: BTreeMap<u64, u64>,
    violations: Vec<PropertyViolation>,
}

impl PropertyChecker {
    /// Creates a checker with no recorded state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the cluster's current state and checks every property.
    pub fn record_state(&mut self, cluster: &SimCluster) {
        self.check_election_safety(cluster);
        self.check_commit_bounds(cluster);
        self.record_commits(cluster);
        self.check_leader_completeness(cluster);
        self.check_log_matching(cluster);
    }

    /// Returns the violations found so far.
    #[must_use]
    pub fn violations(&self) -> &[PropertyViolation] {
        &self.violations
    }

    /// Panics with a readable report if any property was violated.
    ///
    /// # Panics
    /// Panics when at least one violation was recorded.
    pub fn assert_clean(&self) {
        assert!(
            self.violations.is_empty(),
            "safety violations: {}",
            self.violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        );
    }

    /// At most one leader per term.
    fn check_election_safety(&mut self, cluster: &SimCluster) {
        for node in cluster.nodes() {
            if node.engine().role() == Role::Leader {
                let term = node.engine().current_term().get();
                let leaders = self.leaders_by_term.entry(term).or_default();
                leaders.insert(node.engine().local().clone());
                if leaders.len() > 1 {
                    self.violations.push(PropertyViolation::MultipleLeadersInTerm {
                        term,
                        leaders: leaders.iter().cloned().collect(),
                    });
                }
            }
        }
    }

    /// `commit_index` never exceeds the node's own log.
    fn check_commit_bounds(&mut self, cluster: &SimCluster) {
        for node in cluster.nodes() {
            let commit_index = node.engine().commit_index().get();
            let last_log_index = node.engine().log().last_index().get();
            if commit_index > last_log_index {
                self.violations.push(PropertyViolation::CommitBeyondLog {
                    node: node.engine().local().clone(),
                    commit_index,
                    last_log_index,
                });
            }
        }
    }

    /// Remembers committed entries and flags divergence across nodes.
    fn record_commits(&mut self, cluster: &SimCluster) {
        for node in cluster.nodes() {
            for entry in node.committed() {
                let index = entry.index.get();
                let term = entry.term.get();
                match self.committed.get(&index) {
                    Some(&recorded) if recorded != term => {
                        self.violations
                            .push(PropertyViolation::DivergentCommit { index });
                    }
                    Some(_) => {}
                    None => {
                        self.committed.insert(index, term);
                    }
                }
            }
        }
    }

    /// Every committed entry is present in every current leader's log.
    fn check_leader_completeness(&mut self, cluster: &SimCluster) {
        for node in cluster.nodes() {
            if node.engine().role() != Role::Leader {
                continue;
            }
            for (&index, &term) in &self.committed {
                let held = node
                    .engine()
                    .log()
                    .term_at(caravel_core::LogIndex::new(index))
                    .get();
                if held != term {
                    self.violations.push(PropertyViolation::MissingCommittedEntry {
                        index,
                        term,
                        leader: node.engine().local().clone(),
                    });
                }
            }
        }
    }

    /// Logs that share a term at an index agree on the entry there.
    fn check_log_matching(&mut self, cluster: &SimCluster) {
        let nodes = cluster.nodes();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let shared = a
                    .engine()
                    .log()
                    .last_index()
                    .min(b.engine().log().last_index());
                for raw in 1..=shared.get() {
                    let index = caravel_core::LogIndex::new(raw);
                    let term_a = a.engine().log().term_at(index);
                    let term_b = b.engine().log().term_at(index);
                    if term_a != term_b {
                        continue;
                    }
                    let entry_a = a.engine().log().get(index).map(|e| &e.command);
                    let entry_b = b.engine().log().get(index).map(|e| &e.command);
                    if entry_a != entry_b {
                        self.violations.push(PropertyViolation::LogMismatch {
                            index: raw,
                            node_a: a.engine().local().clone(),
                            term_a: term_a.get(),
                            node_b: b.engine().local().clone(),
                            term_b: term_b.get(),
                        });
                    }
                }
            }
        }
    }
}
