use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    /// Voluntarily departed. Terminal like Dead, but not a failure.
    Left,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Dead | NodeState::Left)
    }
}

/// One member of the cluster.
///
/// `incarnation` is owned exclusively by the node it describes: only that node
/// may raise it, which is how a live node refutes a false Suspect or Dead
/// claim. `state_change` is local bookkeeping and never crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Opaque application metadata supplied by the node's delegate.
    pub meta: Vec<u8>,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub state_change: Option<Instant>,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr, meta: Vec<u8>, incarnation: u64) -> Self {
        Self {
            id,
            addr,
            meta,
            state: NodeState::Alive,
            incarnation,
            state_change: Some(Instant::now()),
        }
    }

    /// Whether the failure detector should still probe this node.
    pub fn is_probeable(&self) -> bool {
        matches!(self.state, NodeState::Alive | NodeState::Suspect)
    }
}
