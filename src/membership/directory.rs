use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{Node, NodeId, NodeState};

/// Result of applying an Alive claim to the directory.
#[derive(Debug, Clone)]
pub enum AliveOutcome {
    /// First sighting of this node.
    Joined(Node),
    /// A newer claim was applied; `was` is the state it replaced.
    Applied { node: Node, was: NodeState },
    /// Stale or redundant claim. Nothing changed.
    Ignored,
    /// Same name announced from a different address and the reclaim policy
    /// does not permit the takeover.
    Conflict { existing: Node, candidate: Node },
}

/// Result of applying a Suspect claim.
#[derive(Debug, Clone)]
pub enum SuspectOutcome {
    /// The node transitioned Alive -> Suspect at this incarnation.
    Suspected(Node),
    /// The node was already Suspect; the claim corroborates it.
    Corroborated(Node),
    Ignored,
}

/// Result of applying a Dead claim.
#[derive(Debug, Clone)]
pub enum DeadOutcome {
    /// The node was marked Dead, or Left when it announced its own departure.
    Confirmed { node: Node, left: bool },
    Ignored,
}

/// The single source of truth for cluster membership.
///
/// All reads return copies; node records never escape by reference, so every
/// mutation goes through the `apply_*` methods and their ordering rules.
pub struct Directory {
    local_id: NodeId,
    members: DashMap<NodeId, Node>,
    dead_node_reclaim_time: Duration,
}

impl Directory {
    pub fn new(local: Node, dead_node_reclaim_time: Duration) -> Self {
        let members = DashMap::new();
        let local_id = local.id.clone();
        members.insert(local_id.clone(), local);
        Self {
            local_id,
            members,
            dead_node_reclaim_time,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Point-in-time copy of every known record, the local node included.
    pub fn snapshot(&self) -> Vec<Node> {
        self.members
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Non-self nodes the failure detector should probe (Alive or Suspect).
    pub fn probe_candidates(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.key() != &self.local_id && entry.value().is_probeable())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Non-self gossip targets: probeable nodes plus recently dead ones that
    /// still deserve a chance to hear (and refute) their own obituary.
    pub fn gossip_candidates(&self, gossip_to_the_dead: Duration) -> Vec<Node> {
        let now = Instant::now();
        self.members
            .iter()
            .filter(|entry| {
                let node = entry.value();
                if entry.key() == &self.local_id {
                    return false;
                }
                if node.is_probeable() {
                    return true;
                }
                match node.state_change {
                    Some(changed) => now.duration_since(changed) <= gossip_to_the_dead,
                    None => false,
                }
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Estimated cluster size used to scale suspicion and retransmit budgets.
    pub fn cluster_size_estimate(&self) -> usize {
        let n = self
            .members
            .iter()
            .filter(|entry| !entry.value().state.is_terminal())
            .count();
        n.max(1)
    }

    /// Applies an Alive claim for a non-local node.
    ///
    /// Only a strictly newer incarnation overrides recorded state. An equal
    /// incarnation is a replay (possibly of the very announcement that got
    /// the node suspected) and never un-suspects or revives anyone; a live
    /// node refutes by raising its incarnation first.
    pub fn apply_alive(&self, candidate: Node) -> AliveOutcome {
        debug_assert_ne!(candidate.id, self.local_id);

        let Some(mut existing) = self.members.get_mut(&candidate.id) else {
            let mut node = candidate;
            node.state = NodeState::Alive;
            node.state_change = Some(Instant::now());
            info!("Discovered new member {} at {}", node.id, node.addr);
            self.members.insert(node.id.clone(), node.clone());
            return AliveOutcome::Joined(node);
        };

        if existing.addr != candidate.addr {
            if !self.can_reclaim(&existing) {
                warn!(
                    "Conflicting address for {}: have {}, claim from {}",
                    existing.id, existing.addr, candidate.addr
                );
                return AliveOutcome::Conflict {
                    existing: existing.clone(),
                    candidate,
                };
            }
            info!(
                "Dead node {} reclaimed by new address {}",
                existing.id, candidate.addr
            );
            let was = existing.state;
            existing.addr = candidate.addr;
            existing.meta = candidate.meta;
            existing.incarnation = candidate.incarnation;
            existing.state = NodeState::Alive;
            existing.state_change = Some(Instant::now());
            return AliveOutcome::Applied {
                node: existing.clone(),
                was,
            };
        }

        if candidate.incarnation <= existing.incarnation {
            return AliveOutcome::Ignored;
        }

        let was = existing.state;
        existing.incarnation = candidate.incarnation;
        existing.meta = candidate.meta;
        if existing.state != NodeState::Alive {
            info!("Node {} is now Alive (inc={})", existing.id, existing.incarnation);
            existing.state = NodeState::Alive;
            existing.state_change = Some(Instant::now());
        }
        AliveOutcome::Applied {
            node: existing.clone(),
            was,
        }
    }

    /// Applies a Suspect claim for a non-local node. A claim at the recorded
    /// incarnation (or newer) suspects an Alive node; claims about an
    /// already-suspected node corroborate the running suspicion instead.
    pub fn apply_suspect(&self, id: &NodeId, incarnation: u64) -> SuspectOutcome {
        debug_assert_ne!(id, &self.local_id);

        let Some(mut existing) = self.members.get_mut(id) else {
            debug!("Suspect claim for unknown node {}", id);
            return SuspectOutcome::Ignored;
        };

        if incarnation < existing.incarnation {
            return SuspectOutcome::Ignored;
        }
        match existing.state {
            NodeState::Suspect => SuspectOutcome::Corroborated(existing.clone()),
            NodeState::Alive => {
                warn!("Node {} suspected (inc={})", existing.id, incarnation);
                existing.state = NodeState::Suspect;
                existing.incarnation = incarnation;
                existing.state_change = Some(Instant::now());
                SuspectOutcome::Suspected(existing.clone())
            }
            // Dead nodes only come back through a higher-incarnation Alive.
            NodeState::Dead | NodeState::Left => SuspectOutcome::Ignored,
        }
    }

    /// Applies a Dead claim for a non-local node. `from == id` marks a
    /// voluntary departure, recorded as Left.
    pub fn apply_dead(&self, id: &NodeId, incarnation: u64, from: &NodeId) -> DeadOutcome {
        debug_assert_ne!(id, &self.local_id);

        let Some(mut existing) = self.members.get_mut(id) else {
            debug!("Dead claim for unknown node {}", id);
            return DeadOutcome::Ignored;
        };

        if incarnation < existing.incarnation || existing.state.is_terminal() {
            return DeadOutcome::Ignored;
        }

        let left = from == id;
        existing.state = if left { NodeState::Left } else { NodeState::Dead };
        existing.incarnation = incarnation;
        existing.state_change = Some(Instant::now());
        if left {
            info!("Node {} left the cluster (inc={})", existing.id, incarnation);
        } else {
            warn!("Node {} declared Dead (inc={})", existing.id, incarnation);
        }
        DeadOutcome::Confirmed {
            node: existing.clone(),
            left,
        }
    }

    /// Rewrites the local node's record after an incarnation bump (refutation,
    /// metadata update, departure).
    pub fn update_local(&self, incarnation: u64, meta: Vec<u8>, state: NodeState) -> Node {
        let mut local = self
            .members
            .get_mut(&self.local_id)
            .expect("local node record always present");
        local.incarnation = incarnation;
        local.meta = meta;
        if local.state != state {
            local.state = state;
            local.state_change = Some(Instant::now());
        }
        local.clone()
    }

    /// Drops Dead/Left records older than the retention window. Returns the
    /// pruned ids so callers can tear down any per-node resources.
    pub fn prune(&self, retention: Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let mut pruned = Vec::new();
        self.members.retain(|id, node| {
            if id == &self.local_id || !node.state.is_terminal() {
                return true;
            }
            let expired = node
                .state_change
                .map(|changed| now.duration_since(changed) > retention)
                .unwrap_or(true);
            if expired {
                pruned.push(id.clone());
            }
            !expired
        });
        for id in &pruned {
            debug!("Pruned departed node {}", id);
        }
        pruned
    }

    fn can_reclaim(&self, existing: &Node) -> bool {
        if self.dead_node_reclaim_time.is_zero() || !existing.state.is_terminal() {
            return false;
        }
        match existing.state_change {
            Some(changed) => changed.elapsed() > self.dead_node_reclaim_time,
            None => false,
        }
    }

    /// Address lookup used by probe relays.
    pub fn addr_of(&self, id: &NodeId) -> Option<SocketAddr> {
        self.members.get(id).map(|entry| entry.value().addr)
    }
}
