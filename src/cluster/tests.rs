//! Cluster Engine Tests
//!
//! End-to-end scenarios over loopback sockets (join, user messages, stream
//! pings, departure) plus handler-level checks of the suspicion and
//! refutation flows that would be too slow or too flaky to drive through
//! real probe timing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::service::ClusterService;
use crate::config::Config;
use crate::delegate::{Delegate, Hooks};
use crate::membership::types::{Node, NodeId, NodeState};

fn test_config(name: &str) -> Config {
    let mut config = Config::local();
    config.name = name.to_string();
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config
}

async fn start_node(name: &str) -> Arc<ClusterService> {
    let service = ClusterService::new(test_config(name))
        .await
        .expect("failed to build node");
    service.start();
    service
}

/// Polls `condition` until it holds or `deadline` elapses.
async fn wait_for<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

fn fake_peer(name: &str, port: u16, incarnation: u64) -> Node {
    Node::new(
        NodeId(name.to_string()),
        format!("127.0.0.1:{}", port).parse().unwrap(),
        Vec::new(),
        incarnation,
    )
}

// ============================================================
// JOIN AND STATE SYNC
// ============================================================

#[tokio::test]
async fn test_two_nodes_converge_after_join() {
    let a = start_node("node-a").await;
    let b = start_node("node-b").await;

    let contacted = b.join(&[a.advertise_addr()]).await.expect("join failed");
    assert_eq!(contacted, 1);

    assert!(
        wait_for(Duration::from_secs(5), || {
            a.members().len() == 2 && b.members().len() == 2
        })
        .await,
        "both nodes should learn about each other"
    );

    let b_on_a = a.members().into_iter().find(|n| n.id.0 == "node-b").unwrap();
    assert_eq!(b_on_a.state, NodeState::Alive);
    assert_eq!(b_on_a.addr, b.advertise_addr());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_against_dead_seed_errors() {
    let a = start_node("lonely").await;
    let unreachable = "127.0.0.1:1".parse().unwrap();
    assert!(a.join(&[unreachable]).await.is_err());
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_tolerates_partial_seed_failure() {
    let a = start_node("seed").await;
    let b = start_node("joiner").await;

    let unreachable = "127.0.0.1:1".parse().unwrap();
    let contacted = b
        .join(&[unreachable, a.advertise_addr()])
        .await
        .expect("one live seed should be enough");
    assert_eq!(contacted, 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ============================================================
// USER MESSAGES
// ============================================================

struct RecordingDelegate {
    received: Mutex<Vec<Vec<u8>>>,
}

impl Delegate for RecordingDelegate {
    fn notify_msg(&self, msg: &[u8]) {
        self.received.lock().unwrap().push(msg.to_vec());
    }
}

#[tokio::test]
async fn test_user_message_reaches_remote_delegate() {
    let recorder = Arc::new(RecordingDelegate { received: Mutex::new(Vec::new()) });
    let hooks = Hooks { delegate: recorder.clone(), ..Hooks::default() };

    let a = ClusterService::with_hooks(test_config("receiver"), hooks)
        .await
        .unwrap();
    a.start();
    let b = start_node("sender").await;

    b.send_user_msg(a.advertise_addr(), b"hello over gossip".to_vec())
        .await
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(3), || {
            recorder
                .received
                .lock()
                .unwrap()
                .contains(&b"hello over gossip".to_vec())
        })
        .await
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ============================================================
// STREAM PING
// ============================================================

#[tokio::test]
async fn test_stream_ping_round_trip() {
    let a = start_node("stream-a").await;
    let b = start_node("stream-b").await;

    let target = Node::new(b.local_id().clone(), b.advertise_addr(), Vec::new(), 1);
    let payload = a.tcp_ping(&target).await.expect("stream ping failed");
    assert!(payload.is_empty(), "no ping delegate, so no ack payload");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stream_ping_rejects_wrong_target() {
    let a = start_node("caller").await;
    let b = start_node("callee").await;

    // The remote drops pings that name someone else.
    let misdirected = Node::new(
        NodeId("somebody-else".into()),
        b.advertise_addr(),
        Vec::new(),
        1,
    );
    assert!(a.tcp_ping(&misdirected).await.is_err());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ============================================================
// SUSPICION AND REFUTATION (handler level)
// ============================================================

#[tokio::test]
async fn test_suspect_claim_starts_a_suspicion() {
    let service = ClusterService::new(test_config("observer")).await.unwrap();
    let peer = fake_peer("flaky", 9001, 1);
    service.handle_alive(peer.clone(), service.vsn());

    service.handle_suspect(peer.id.clone(), 1, NodeId("accuser".into()));

    let recorded = service.directory.get(&peer.id).unwrap();
    assert_eq!(recorded.state, NodeState::Suspect);
    assert!(service.suspicions.contains_key(&peer.id));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refutation_cancels_the_suspicion() {
    let service = ClusterService::new(test_config("observer")).await.unwrap();
    let peer = fake_peer("flaky", 9001, 1);
    service.handle_alive(peer.clone(), service.vsn());
    service.handle_suspect(peer.id.clone(), 1, NodeId("accuser".into()));

    // The suspect re-announces itself at a higher incarnation: the claim
    // applies and the pending timer is torn down.
    let mut refuted = peer.clone();
    refuted.incarnation = 2;
    service.handle_alive(refuted, service.vsn());

    let recorded = service.directory.get(&peer.id).unwrap();
    assert_eq!(recorded.state, NodeState::Alive);
    assert!(!service.suspicions.contains_key(&peer.id));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_suspicion_about_self_is_refuted() {
    let service = ClusterService::new(test_config("accused")).await.unwrap();
    let before = service.local_node().incarnation;

    service.handle_suspect(service.local_id().clone(), before, NodeId("accuser".into()));

    let local = service.local_node();
    assert_eq!(local.state, NodeState::Alive);
    assert!(local.incarnation > before, "refutation must outbid the claim");
    assert!(!service.broadcasts.is_empty(), "the refutation must be re-gossiped");

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_record_of_self_is_outbid() {
    let service = ClusterService::new(test_config("reborn")).await.unwrap();

    // A previous life's record arrives via state sync: our name, our
    // address, but a far higher incarnation than this process has counted
    // to. Without outbidding it, peers would discard every announcement we
    // make from here on.
    let mut previous_life = service.local_node();
    previous_life.incarnation = 40;
    service.handle_alive(previous_life, service.vsn());

    assert!(
        service.local_node().incarnation > 40,
        "the local incarnation must rise above the stale record"
    );
    assert!(!service.broadcasts.is_empty(), "the outbid must be re-announced");

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_own_echo_does_not_trigger_refutation() {
    let service = ClusterService::new(test_config("echoed")).await.unwrap();
    let before = service.local_node().incarnation;

    // Our own announcement coming back around: same incarnation, same meta.
    service.handle_alive(service.local_node(), service.vsn());

    assert_eq!(
        service.local_node().incarnation,
        before,
        "an echo must not start an incarnation race"
    );

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_death_claim_about_self_is_refuted() {
    let service = ClusterService::new(test_config("accused")).await.unwrap();

    service.handle_dead(service.local_id().clone(), 7, NodeId("accuser".into()));

    let local = service.local_node();
    assert_eq!(local.state, NodeState::Alive);
    assert!(local.incarnation > 7);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dead_claim_marks_peer_and_cancels_suspicion() {
    let service = ClusterService::new(test_config("observer")).await.unwrap();
    let peer = fake_peer("goner", 9001, 1);
    service.handle_alive(peer.clone(), service.vsn());
    service.handle_suspect(peer.id.clone(), 1, NodeId("accuser".into()));

    service.handle_dead(peer.id.clone(), 1, NodeId("accuser".into()));

    let recorded = service.directory.get(&peer.id).unwrap();
    assert_eq!(recorded.state, NodeState::Dead);
    assert!(!service.suspicions.contains_key(&peer.id));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_expiry_leaves_newer_suspicion_intact() {
    let service = ClusterService::new(test_config("observer")).await.unwrap();
    let peer = fake_peer("flaky", 9001, 1);
    service.handle_alive(peer.clone(), service.vsn());
    service.handle_suspect(peer.id.clone(), 1, NodeId("accuser".into()));

    // Refutation, then a fresh suspicion at the higher incarnation.
    let mut refuted = peer.clone();
    refuted.incarnation = 2;
    service.handle_alive(refuted, service.vsn());
    service.handle_suspect(peer.id.clone(), 2, NodeId("accuser".into()));

    // The first timer fires late: it must neither kill the node nor evict
    // the newer timer from the table.
    service.finish_suspicion(peer.id.clone(), 1).await;

    assert!(service.suspicions.contains_key(&peer.id));
    let recorded = service.directory.get(&peer.id).unwrap();
    assert_eq!(recorded.state, NodeState::Suspect);
    assert_eq!(recorded.incarnation, 2);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_terminal_records_pruned_without_gossip_ticker() {
    let mut config = test_config("pruner");
    config.gossip_interval = Duration::ZERO;
    config.gossip_to_the_dead_time = Duration::from_millis(200);
    let service = ClusterService::new(config).await.unwrap();
    service.start();

    let peer = fake_peer("bygone", 9001, 1);
    service.handle_alive(peer.clone(), service.vsn());
    service.handle_dead(peer.id.clone(), 1, NodeId("accuser".into()));
    assert!(service.directory.get(&peer.id).is_some());

    assert!(
        wait_for(Duration::from_secs(10), || {
            service.directory.get(&peer.id).is_none()
        })
        .await,
        "retention must be enforced even with gossip disabled"
    );

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_departure_is_recorded_as_left() {
    let service = ClusterService::new(test_config("observer")).await.unwrap();
    let peer = fake_peer("mover", 9001, 3);
    service.handle_alive(peer.clone(), service.vsn());

    // A dead claim naming its own subject as the accuser is a departure.
    service.handle_dead(peer.id.clone(), 3, peer.id.clone());

    let recorded = service.directory.get(&peer.id).unwrap();
    assert_eq!(recorded.state, NodeState::Left);

    service.shutdown().await.unwrap();
}

// ============================================================
// DEPARTURE AND FAILURE END TO END
// ============================================================

#[tokio::test]
async fn test_leave_propagates_as_voluntary_departure() {
    let a = start_node("stayer").await;
    let b = start_node("leaver").await;
    b.join(&[a.advertise_addr()]).await.unwrap();
    assert!(wait_for(Duration::from_secs(5), || a.members().len() == 2).await);

    b.leave().await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || {
            a.members()
                .iter()
                .any(|n| n.id.0 == "leaver" && n.state == NodeState::Left)
        })
        .await,
        "the departure should reach the peer as Left, not Dead"
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_silent_peer_is_eventually_declared_dead() {
    let a = start_node("survivor").await;
    let b = start_node("victim").await;
    b.join(&[a.advertise_addr()]).await.unwrap();
    assert!(wait_for(Duration::from_secs(5), || a.members().len() == 2).await);

    // Kill the victim without a goodbye.
    b.shutdown().await.unwrap();

    assert!(
        wait_for(Duration::from_secs(30), || {
            a.members()
                .iter()
                .any(|n| n.id.0 == "victim" && n.state == NodeState::Dead)
        })
        .await,
        "the silent peer should pass through Suspect into Dead"
    );

    a.shutdown().await.unwrap();
}

// ============================================================
// LOCAL STATE MANAGEMENT
// ============================================================

#[tokio::test]
async fn test_update_node_bumps_incarnation() {
    let service = ClusterService::new(test_config("updater")).await.unwrap();
    let before = service.local_node().incarnation;

    service.update_node().unwrap();

    assert!(service.local_node().incarnation > before);
    assert!(!service.broadcasts.is_empty());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_incompatible_protocol_range_is_dropped() {
    let service = ClusterService::new(test_config("gatekeeper")).await.unwrap();
    let peer = fake_peer("futuristic", 9001, 1);

    let mut vsn = service.vsn();
    vsn.proto_min = 200;
    vsn.proto_max = 201;
    service.handle_alive(peer.clone(), vsn);

    assert!(service.directory.get(&peer.id).is_none());

    service.shutdown().await.unwrap();
}
