//! Membership Directory Tests
//!
//! Exercises the ordering rules the whole engine leans on: incarnation
//! precedence, suspicion and death transitions, refutation idempotence,
//! dead-node retention and identity reclaim.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::directory::{AliveOutcome, DeadOutcome, Directory, SuspectOutcome};
use super::types::{Node, NodeId, NodeState};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn node(name: &str, port: u16, incarnation: u64) -> Node {
    Node::new(NodeId(name.to_string()), addr(port), Vec::new(), incarnation)
}

fn directory() -> Directory {
    Directory::new(node("local", 7000, 1), Duration::ZERO)
}

// ============================================================
// ALIVE CLAIMS
// ============================================================

#[test]
fn test_first_alive_joins() {
    let dir = directory();
    match dir.apply_alive(node("a", 7001, 1)) {
        AliveOutcome::Joined(n) => assert_eq!(n.state, NodeState::Alive),
        other => panic!("expected Joined, got {:?}", other),
    }
    assert_eq!(dir.len(), 2);
}

#[test]
fn test_stale_alive_is_ignored() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 5));

    // Replaying an Alive with incarnation <= recorded never changes state.
    assert!(matches!(dir.apply_alive(node("a", 7001, 5)), AliveOutcome::Ignored));
    assert!(matches!(dir.apply_alive(node("a", 7001, 3)), AliveOutcome::Ignored));
    assert_eq!(dir.get(&NodeId("a".into())).unwrap().incarnation, 5);
}

#[test]
fn test_newer_alive_updates_meta() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));

    let mut updated = node("a", 7001, 2);
    updated.meta = b"zone=eu".to_vec();
    match dir.apply_alive(updated) {
        AliveOutcome::Applied { node, was } => {
            assert_eq!(was, NodeState::Alive);
            assert_eq!(node.meta, b"zone=eu");
            assert_eq!(node.incarnation, 2);
        }
        other => panic!("expected Applied, got {:?}", other),
    }
}

#[test]
fn test_alive_refutes_suspect_with_higher_incarnation() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_suspect(&NodeId("a".into()), 1);
    assert_eq!(dir.get(&NodeId("a".into())).unwrap().state, NodeState::Suspect);

    match dir.apply_alive(node("a", 7001, 2)) {
        AliveOutcome::Applied { node, was } => {
            assert_eq!(was, NodeState::Suspect);
            assert_eq!(node.state, NodeState::Alive);
        }
        other => panic!("expected Applied, got {:?}", other),
    }
}

#[test]
fn test_equal_incarnation_alive_never_unsuspects() {
    // The announcement that carried incarnation 3 may still be circulating
    // when the node gets suspected at 3; its replay must not cancel the
    // suspicion. Only a fresh, higher incarnation refutes.
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_suspect(&NodeId("a".into()), 3);

    assert!(matches!(dir.apply_alive(node("a", 7001, 3)), AliveOutcome::Ignored));
    let recorded = dir.get(&NodeId("a".into())).unwrap();
    assert_eq!(recorded.state, NodeState::Suspect);
    assert_eq!(recorded.incarnation, 3);
}

#[test]
fn test_dead_node_revives_only_with_newer_incarnation() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 2));
    dir.apply_dead(&NodeId("a".into()), 2, &NodeId("local".into()));

    assert!(matches!(dir.apply_alive(node("a", 7001, 1)), AliveOutcome::Ignored));
    match dir.apply_alive(node("a", 7001, 3)) {
        AliveOutcome::Applied { was, node } => {
            assert_eq!(was, NodeState::Dead);
            assert_eq!(node.state, NodeState::Alive);
        }
        other => panic!("expected Applied, got {:?}", other),
    }
}

// ============================================================
// SUSPECT CLAIMS
// ============================================================

#[test]
fn test_suspect_at_current_incarnation_applies() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 4));

    match dir.apply_suspect(&NodeId("a".into()), 4) {
        SuspectOutcome::Suspected(n) => assert_eq!(n.state, NodeState::Suspect),
        other => panic!("expected Suspected, got {:?}", other),
    }
}

#[test]
fn test_stale_suspect_is_ignored() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 4));
    assert!(matches!(
        dir.apply_suspect(&NodeId("a".into()), 3),
        SuspectOutcome::Ignored
    ));
    assert_eq!(dir.get(&NodeId("a".into())).unwrap().state, NodeState::Alive);
}

#[test]
fn test_repeat_suspect_corroborates() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_suspect(&NodeId("a".into()), 1);

    assert!(matches!(
        dir.apply_suspect(&NodeId("a".into()), 1),
        SuspectOutcome::Corroborated(_)
    ));
}

#[test]
fn test_suspect_of_dead_node_is_ignored() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_dead(&NodeId("a".into()), 1, &NodeId("local".into()));
    assert!(matches!(
        dir.apply_suspect(&NodeId("a".into()), 5),
        SuspectOutcome::Ignored
    ));
}

#[test]
fn test_suspect_of_unknown_node_is_ignored() {
    let dir = directory();
    assert!(matches!(
        dir.apply_suspect(&NodeId("ghost".into()), 1),
        SuspectOutcome::Ignored
    ));
}

// ============================================================
// DEAD CLAIMS AND DEPARTURE
// ============================================================

#[test]
fn test_dead_claim_confirms() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    match dir.apply_dead(&NodeId("a".into()), 1, &NodeId("local".into())) {
        DeadOutcome::Confirmed { node, left } => {
            assert!(!left);
            assert_eq!(node.state, NodeState::Dead);
        }
        other => panic!("expected Confirmed, got {:?}", other),
    }
}

#[test]
fn test_self_announced_dead_is_left() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    match dir.apply_dead(&NodeId("a".into()), 2, &NodeId("a".into())) {
        DeadOutcome::Confirmed { node, left } => {
            assert!(left);
            assert_eq!(node.state, NodeState::Left);
        }
        other => panic!("expected Confirmed, got {:?}", other),
    }
}

#[test]
fn test_dead_is_idempotent() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_dead(&NodeId("a".into()), 1, &NodeId("local".into()));
    assert!(matches!(
        dir.apply_dead(&NodeId("a".into()), 5, &NodeId("local".into())),
        DeadOutcome::Ignored
    ));
}

// ============================================================
// CONFLICT AND RECLAIM
// ============================================================

#[test]
fn test_address_conflict_rejected_by_default() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));

    match dir.apply_alive(node("a", 7999, 9)) {
        AliveOutcome::Conflict { existing, candidate } => {
            assert_eq!(existing.addr, addr(7001));
            assert_eq!(candidate.addr, addr(7999));
        }
        other => panic!("expected Conflict, got {:?}", other),
    }
    // Update rejected, original record untouched.
    assert_eq!(dir.get(&NodeId("a".into())).unwrap().addr, addr(7001));
}

#[test]
fn test_dead_name_reclaim_after_window() {
    let dir = Directory::new(node("local", 7000, 1), Duration::from_millis(10));
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_dead(&NodeId("a".into()), 1, &NodeId("local".into()));

    // Within the window the reclaim is still a conflict.
    assert!(matches!(
        dir.apply_alive(node("a", 7999, 1)),
        AliveOutcome::Conflict { .. }
    ));

    std::thread::sleep(Duration::from_millis(20));
    match dir.apply_alive(node("a", 7999, 1)) {
        AliveOutcome::Applied { node, was } => {
            assert_eq!(was, NodeState::Dead);
            assert_eq!(node.addr, addr(7999));
            assert_eq!(node.state, NodeState::Alive);
        }
        other => panic!("expected Applied, got {:?}", other),
    }
}

// ============================================================
// RETENTION, PRUNING, SNAPSHOTS
// ============================================================

#[test]
fn test_prune_only_expired_terminal_nodes() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_alive(node("b", 7002, 1));
    dir.apply_dead(&NodeId("a".into()), 1, &NodeId("local".into()));

    // Fresh dead node survives a long retention window.
    assert!(dir.prune(Duration::from_secs(60)).is_empty());
    assert_eq!(dir.len(), 3);

    std::thread::sleep(Duration::from_millis(15));
    let pruned = dir.prune(Duration::from_millis(5));
    assert_eq!(pruned, vec![NodeId("a".into())]);
    assert_eq!(dir.len(), 2);
}

#[test]
fn test_gossip_candidates_include_recent_dead() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_alive(node("b", 7002, 1));
    dir.apply_dead(&NodeId("b".into()), 1, &NodeId("local".into()));

    let with_dead = dir.gossip_candidates(Duration::from_secs(30));
    assert_eq!(with_dead.len(), 2);

    std::thread::sleep(Duration::from_millis(15));
    let without_dead = dir.gossip_candidates(Duration::from_millis(5));
    assert_eq!(without_dead.len(), 1);
    assert_eq!(without_dead[0].id, NodeId("a".into()));
}

#[test]
fn test_probe_candidates_exclude_self_and_terminal() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_alive(node("b", 7002, 1));
    dir.apply_suspect(&NodeId("a".into()), 1);
    dir.apply_dead(&NodeId("b".into()), 1, &NodeId("local".into()));

    let candidates = dir.probe_candidates();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, NodeId("a".into()));
}

#[test]
fn test_snapshot_is_point_in_time_copy() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));

    let snapshot = dir.snapshot();
    dir.apply_suspect(&NodeId("a".into()), 1);

    let copied = snapshot.iter().find(|n| n.id == NodeId("a".into())).unwrap();
    assert_eq!(copied.state, NodeState::Alive, "snapshot must not alias live records");
}

#[test]
fn test_cluster_size_estimate_ignores_terminal() {
    let dir = directory();
    dir.apply_alive(node("a", 7001, 1));
    dir.apply_alive(node("b", 7002, 1));
    assert_eq!(dir.cluster_size_estimate(), 3);

    dir.apply_dead(&NodeId("b".into()), 1, &NodeId("local".into()));
    assert_eq!(dir.cluster_size_estimate(), 2);
}

#[test]
fn test_serde_skips_state_change() {
    let mut n = node("a", 7001, 7);
    n.state_change = Some(Instant::now());

    let json = serde_json::to_string(&n).expect("serialization failed");
    let restored: Node = serde_json::from_str(&json).expect("deserialization failed");
    assert_eq!(restored.id, n.id);
    assert_eq!(restored.incarnation, 7);
    assert!(restored.state_change.is_none());
}
