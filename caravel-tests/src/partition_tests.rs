//! Partition scenarios over the deterministic simulator.
//!
//! A three-node cluster with one node severed is the canonical test: the
//! majority side must keep electing and committing, the minority side must
//! fail closed.

use bytes::Bytes;
use caravel_core::{LogIndex, Term};
use caravel_raft::Role;

use crate::cluster::SimCluster;
use crate::properties::PropertyChecker;

#[test]
fn test_majority_side_elects_and_commits() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.sever(0);

    cluster.timeout(1);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.leader(), Some(1));

    cluster.submit(1, "through the partition").unwrap();
    cluster.deliver_all();
    cluster.heartbeat(1);
    cluster.deliver_all();
    checker.record_state(&cluster);

    assert_eq!(cluster.node(1).engine().commit_index(), LogIndex::new(1));
    assert_eq!(cluster.node(2).engine().commit_index(), LogIndex::new(1));
    // The severed node saw none of it.
    assert_eq!(cluster.node(0).engine().commit_index(), LogIndex::ZERO);
    assert!(cluster.node(0).engine().log().is_empty());
    checker.assert_clean();
}

#[test]
fn test_partitioned_node_rejects_clients_and_never_commits() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    cluster.sever(2);

    // The severed follower keeps timing out into doomed candidacies.
    cluster.timeout(2);
    cluster.deliver_all();
    cluster.timeout(2);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.role(2), Role::Candidate);

    // A client talking to it gets a redirect with no usable hint, never
    // an acknowledgment.
    let error = cluster.submit(2, "lost").unwrap_err();
    assert_eq!(error.code(), "ENOTLEADER");
    assert!(error.leader_hint().is_none());
    assert!(cluster.node(2).committed().is_empty());

    // Meanwhile the majority keeps working.
    cluster.submit(0, "kept").unwrap();
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.node(0).engine().commit_index(), LogIndex::new(1));
    checker.assert_clean();
}

#[test]
fn test_healed_node_catches_up() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    cluster.sever(2);
    for command in ["a", "b", "c"] {
        cluster.submit(0, command).unwrap();
        cluster.deliver_all();
    }
    cluster.heartbeat(0);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.node(0).engine().commit_index(), LogIndex::new(3));

    // The partition heals; heartbeats repair the straggler.
    cluster.heal(2);
    cluster.heartbeat(0);
    cluster.deliver_all();
    cluster.heartbeat(0);
    cluster.deliver_all();
    checker.record_state(&cluster);

    assert_eq!(cluster.node(2).engine().commit_index(), LogIndex::new(3));
    assert_eq!(cluster.node(2).committed().len(), 3);
    assert_eq!(
        cluster.node(2).committed()[2].command,
        Bytes::from("c")
    );
    checker.assert_clean();
}

#[test]
fn test_rejoining_node_with_inflated_term_forces_reelection() {
    let mut cluster = SimCluster::new(3);
    let mut checker = PropertyChecker::new();

    cluster.elect(0);
    cluster.submit(0, "committed before").unwrap();
    cluster.deliver_all();
    cluster.heartbeat(0);
    cluster.deliver_all();
    checker.record_state(&cluster);

    // The severed node's term climbs with every failed candidacy.
    cluster.sever(2);
    for _ in 0..3 {
        cluster.timeout(2);
        cluster.deliver_all();
    }
    assert_eq!(cluster.node(2).engine().current_term(), Term::new(4));

    // On heal, its higher term dethrones the leader...
    cluster.heal(2);
    cluster.heartbeat(0);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.role(0), Role::Follower);

    // ...but its stale log cannot win the next election; an up-to-date
    // node does, and the committed entry survives.
    cluster.timeout(2);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_ne!(cluster.leader(), Some(2));

    cluster.timeout(1);
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.leader(), Some(1));
    assert_eq!(
        cluster
            .node(1)
            .engine()
            .log()
            .get(LogIndex::new(1))
            .unwrap()
            .command,
        Bytes::from("committed before")
    );

    cluster.submit(1, "committed after").unwrap();
    cluster.deliver_all();
    checker.record_state(&cluster);
    assert_eq!(cluster.node(1).engine().commit_index(), LogIndex::new(2));
    checker.assert_clean();
}
