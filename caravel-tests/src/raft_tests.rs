//! Raft safety tests over the deterministic simulator.
//!
//! Each test scripts a concrete interleaving - which node times out, what
//! gets delivered when - and checks the safety properties after every
//! step. The interesting scenarios are the adversarial ones: concurrent
//! candidacies, split votes, stale terms, and partially replicated logs.

use caravel_core::{LogIndex, Term};
use caravel_raft::Role;

use crate::cluster::{leader_terms, SimCluster};
use crate::properties::PropertyChecker;

#[test]
fn test_cluster_starts_all_followers() {
    let cluster = SimCluster::new(3);

    for node in cluster.nodes() {
        assert_eq!(node.engine().role(), Role::Follower);
        assert_eq!(node.engine().current_term(), Term::ZERO);
        assert_eq!(node.engine().commit_index(), LogIndex::ZERO);
    }
    assert!(cluster.leader().is_none());
}

#[test]
fn test_first_timeout_wins_election() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    checker.record_state(&cluster);

    assert_eq!(cluster.leader(), Some(0));
    assert_eq!(cluster.role(1), Role::Follower);
    assert_eq!(cluster.role(2), Role::Follower);
    // Followers learned the leader through its initial heartbeats.
    assert_eq!(
        cluster.node(1).engine().leader_hint(),
        Some(&SimCluster::address_for(0))
    );
    checker.assert_clean();
}

#[test]
fn test_concurrent_candidacies_elect_at_most_one_leader() {
    let mut cluster = SimCluster::new(5);
    let mut checker = PropertyChecker::new();

    // Two nodes time out before any message moves.
    cluster.timeout(0);
    cluster.timeout(1);
    checker.record_state(&cluster);

    cluster.deliver_all();
    checker.record_state(&cluster);

    // Both ran in term 1; the vote-splitting guarantees at most one won.
    let leaders = leader_terms(&cluster);
    assert!(leaders.len() <= 1, "leaders: {leaders:?}");
    checker.assert_clean();
}

#[test]
fn test_split_vote_resolves_on_reelection() {
    let mut cluster = SimCluster::new(4);
    let mut checker = PropertyChecker::new();

    // Node 3's vote is lost, so the two candidates split the rest: each
    // holds its own vote plus one grant, short of the quorum of 3.
    cluster.sever(3);
    cluster.timeout(0);
    cluster.timeout(1);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert!(cluster.leader().is_none());

    // One candidate's timer fires again first; term 2 elects it.
    cluster.heal(3);
    cluster.timeout(0);
    cluster.deliver_all();
    checker.record_state(&cluster);

    assert_eq!(cluster.leader(), Some(0));
    assert_eq!(cluster.node(0).engine().current_term(), Term::new(2));
    checker.assert_clean();
}

#[test]
fn test_stale_candidate_cannot_unseat_leader() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    cluster.submit(0, "a").unwrap();
    cluster.deliver_all();
    checker.record_state(&cluster);

    // Node 2 times out without having seen the entry? It has seen it -
    // sever it first, append another entry, then let it campaign with a
    // shorter log.
    cluster.sever(2);
    cluster.submit(0, "b").unwrap();
    cluster.deliver_all();
    checker.record_state(&cluster);

    cluster.heal(2);
    cluster.timeout(2);
    cluster.deliver_all();
    checker.record_state(&cluster);

    // Its log is behind, so the up-to-date check denies the votes.
    assert_ne!(cluster.leader(), Some(2));
    checker.assert_clean();
}

#[test]
fn test_replication_commits_on_majority() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    let index = cluster.submit(0, "set a 1").unwrap();
    assert_eq!(index, LogIndex::new(1));
    cluster.deliver_all();
    checker.record_state(&cluster);

    assert_eq!(cluster.node(0).engine().commit_index(), LogIndex::new(1));
    assert_eq!(cluster.node(0).committed().len(), 1);

    // Followers commit after the next heartbeat carries the commit index.
    cluster.heartbeat(0);
    cluster.deliver_all();
    checker.record_state(&cluster);

    for i in [1, 2] {
        assert_eq!(cluster.node(i).engine().commit_index(), LogIndex::new(1));
        assert_eq!(cluster.node(i).committed().len(), 1);
    }
    checker.assert_clean();
}

#[test]
fn test_commit_requires_majority_not_just_leader() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    cluster.sever(1);
    cluster.sever(2);

    // The append fans out but nobody hears it.
    cluster.submit(0, "lonely").unwrap();
    cluster.deliver_all();
    checker.record_state(&cluster);

    assert_eq!(cluster.node(0).engine().commit_index(), LogIndex::ZERO);
    assert!(cluster.node(0).committed().is_empty());
    checker.assert_clean();
}

#[test]
fn test_uncommitted_entry_overwritten_by_new_leader() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);

    // Node 0's entry reaches nobody.
    cluster.sever(1);
    cluster.sever(2);
    cluster.submit(0, "doomed").unwrap();
    cluster.deliver_all();
    checker.record_state(&cluster);

    // The others elect a fresh leader and replicate a conflicting entry.
    cluster.heal(1);
    cluster.heal(2);
    cluster.sever(0);
    cluster.timeout(1);
    cluster.deliver_all();
    assert_eq!(cluster.leader(), Some(1));
    cluster.submit(1, "survivor").unwrap();
    cluster.deliver_all();
    checker.record_state(&cluster);

    // Node 0 rejoins; the new leader's log wins at index 1.
    cluster.heal(0);
    cluster.heartbeat(1);
    cluster.deliver_all();
    checker.record_state(&cluster);

    let overwritten = cluster.node(0).engine().log().get(LogIndex::new(1)).unwrap();
    assert_eq!(overwritten.term, cluster.node(1).engine().current_term());
    assert_eq!(overwritten.command, bytes::Bytes::from("survivor"));

    // The doomed entry was never committed anywhere.
    for node in cluster.nodes() {
        assert!(node
            .committed()
            .iter()
            .all(|e| e.command != bytes::Bytes::from("doomed")));
    }
    checker.assert_clean();
}

#[test]
fn test_committed_entry_survives_leader_change() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    cluster.submit(0, "durable").unwrap();
    cluster.deliver_all();
    cluster.heartbeat(0);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.node(0).engine().commit_index(), LogIndex::new(1));

    // The old leader drops off; a new one takes over.
    cluster.sever(0);
    cluster.timeout(1);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.leader(), Some(1));

    // Leader completeness: the new leader holds the committed entry.
    let held = cluster.node(1).engine().log().get(LogIndex::new(1)).unwrap();
    assert_eq!(held.command, bytes::Bytes::from("durable"));

    // And it keeps committing on top of it.
    cluster.submit(1, "more").unwrap();
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.node(1).engine().commit_index(), LogIndex::new(2));
    checker.assert_clean();
}

#[test]
fn test_partial_delivery_keeps_invariants() {
    let mut cluster = SimCluster::new(5);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    checker.record_state(&cluster);

    for command in ["a", "b", "c"] {
        cluster.submit(0, command).unwrap();
        // Deliver only a few messages per step, leaving stragglers.
        cluster.deliver(3);
        checker.record_state(&cluster);
    }

    // Lose everything still in flight, then heartbeat-repair.
    cluster.drop_pending();
    for _ in 0..4 {
        cluster.heartbeat(0);
        cluster.deliver_all();
        checker.record_state(&cluster);
    }

    assert_eq!(cluster.node(0).engine().commit_index(), LogIndex::new(3));
    for node in cluster.nodes() {
        assert_eq!(node.engine().commit_index(), LogIndex::new(3));
    }
    checker.assert_clean();
}

#[test]
fn test_commit_index_never_exceeds_own_log() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    for command in ["a", "b", "c", "d"] {
        cluster.submit(0, command).unwrap();
    }
    // Interleave partial delivery with heartbeats carrying commit info.
    for _ in 0..6 {
        cluster.deliver(2);
        cluster.heartbeat(0);
        checker.record_state(&cluster);
    }
    cluster.deliver_all();
    checker.record_state(&cluster);

    checker.assert_clean();
}
