//! Failure-detection probe scheduler.
//!
//! Every probe interval one peer is checked: a direct ping first, then (on
//! timeout) indirect pings through random relays pipelined with a fallback
//! stream ping. Only when every channel stays silent for the full round is
//! the peer suspected. Probe cadence and timeouts stretch with the local
//! awareness score so an unhealthy node does not spray false accusations.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::service::{AckInfo, ClusterService};
use crate::membership::directory::SuspectOutcome;
use crate::membership::types::{Node, NodeId};
use crate::protocol::messages::Message;

/// Round-robin probe order, reshuffled each time the member list is
/// exhausted. Guarantees every peer is probed within one full pass.
pub(crate) struct ProbeRotation {
    order: Vec<NodeId>,
    index: usize,
}

impl ProbeRotation {
    pub(crate) fn new() -> Self {
        Self { order: Vec::new(), index: 0 }
    }
}

impl ClusterService {
    pub(crate) async fn probe_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.awareness.scale(self.config.probe_interval);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
            self.prune_directory();
            match self.next_probe_target() {
                Some(node) => self.probe_node(node).await,
                None => trace!("No probe candidates this round"),
            }
        }
    }

    fn next_probe_target(&self) -> Option<Node> {
        let mut rotation = self.rotation.lock().expect("rotation lock poisoned");
        // At most one rebuild per call, or an empty cluster would spin here.
        for _ in 0..2 {
            while rotation.index < rotation.order.len() {
                let id = rotation.order[rotation.index].clone();
                rotation.index += 1;
                // Membership may have changed since the rotation was built.
                if let Some(node) = self.directory.get(&id)
                    && node.is_probeable()
                {
                    return Some(node);
                }
            }
            let mut order: Vec<NodeId> = self
                .directory
                .probe_candidates()
                .into_iter()
                .map(|node| node.id)
                .collect();
            order.shuffle(&mut rand::thread_rng());
            rotation.order = order;
            rotation.index = 0;
            if rotation.order.is_empty() {
                return None;
            }
        }
        None
    }

    /// Runs one full probe of `node`: direct, then indirect plus stream
    /// fallback, then suspicion.
    pub(crate) async fn probe_node(self: &Arc<Self>, node: Node) {
        let seq = self.next_seq();
        // Fan-in channel: the direct ack, any relayed ack and the stream
        // fallback all land here; the first one wins.
        let (tx, mut rx) = mpsc::channel(self.config.indirect_checks.max(1) + 1);
        self.ack_handlers.insert(seq, tx.clone());
        let sent_at = Instant::now();

        let ping = Message::Ping {
            seq,
            from: self.local_id.clone(),
            target: node.id.clone(),
        };
        if let Err(e) = self.send_packet(ping, node.addr).await {
            debug!("Failed to send probe to {}: {:#}", node.id, e);
        }

        let direct_timeout = self.awareness.scale(self.config.probe_timeout);
        if let Ok(Some(ack)) = tokio::time::timeout(direct_timeout, rx.recv()).await {
            self.ack_handlers.remove(&seq);
            self.probe_succeeded(&node, sent_at, ack);
            return;
        }

        // The direct probe timed out. That says as much about us as about the
        // target, so the health score takes the hit before we escalate.
        self.awareness.apply_delta(1);
        trace!("Direct probe of {} timed out, escalating", node.id);

        for peer in self.random_peers(self.config.indirect_checks, &node.id) {
            let relay = Message::IndirectPing {
                seq,
                from: self.local_id.clone(),
                target: node.id.clone(),
                target_addr: node.addr,
            };
            if let Err(e) = self.send_packet(relay, peer.addr).await {
                debug!("Failed to ask {} to relay a probe: {:#}", peer.id, e);
            }
        }

        if !self.config.disable_tcp_pings {
            let service = self.clone();
            let target = node.clone();
            let fallback = tx.clone();
            tokio::spawn(async move {
                match service.tcp_ping(&target).await {
                    Ok(payload) => {
                        let _ = fallback
                            .send(AckInfo { payload, timestamp: Instant::now() })
                            .await;
                    }
                    Err(e) => debug!("Stream fallback ping to {} failed: {:#}", target.id, e),
                }
            });
        }
        drop(tx);

        let round = self.awareness.scale(self.config.probe_interval);
        let remaining = round.saturating_sub(sent_at.elapsed());
        let outcome = tokio::time::timeout(remaining, rx.recv()).await;
        self.ack_handlers.remove(&seq);
        match outcome {
            Ok(Some(ack)) => self.probe_succeeded(&node, sent_at, ack),
            _ => self.suspect_failed_node(&node),
        }
    }

    fn probe_succeeded(&self, node: &Node, sent_at: Instant, ack: AckInfo) {
        self.awareness.apply_delta(-1);
        let rtt = ack.timestamp.saturating_duration_since(sent_at);
        trace!("Probe of {} acked in {:?}", node.id, rtt);
        if let Some(ping) = &self.hooks.ping {
            ping.notify_ping_complete(node, rtt, &ack.payload);
        }
    }

    fn suspect_failed_node(self: &Arc<Self>, node: &Node) {
        match self.directory.apply_suspect(&node.id, node.incarnation) {
            SuspectOutcome::Suspected(suspected) => {
                warn!("Probe of {} failed on every channel, marking Suspect", node.id);
                self.start_suspicion(&suspected, self.local_id.clone());
                self.queue_broadcast(
                    suspected.id.clone(),
                    &Message::Suspect {
                        id: suspected.id.clone(),
                        incarnation: suspected.incarnation,
                        from: self.local_id.clone(),
                    },
                );
            }
            SuspectOutcome::Corroborated(_) | SuspectOutcome::Ignored => {}
        }
    }
}
