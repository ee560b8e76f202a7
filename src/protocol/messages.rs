use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::membership::types::{Node, NodeId};

/// Protocol and delegate version sextuple carried on Alive messages so peers
/// can gate compatibility before applying state or handing payloads to their
/// delegates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vsn {
    pub proto_min: u8,
    pub proto_cur: u8,
    pub proto_max: u8,
    pub delegate_min: u8,
    pub delegate_cur: u8,
    pub delegate_max: u8,
}

impl Vsn {
    /// Whether a peer speaking `other` shares at least one protocol version
    /// with us.
    pub fn compatible(&self, other: &Vsn) -> bool {
        other.proto_min <= self.proto_max && other.proto_max >= self.proto_min
    }
}

/// Everything that crosses the gossip wire.
///
/// - `Ping`/`Ack`: direct liveness checks; acks echo the sequence number and
///   may carry a ping-delegate payload for RTT instrumentation.
/// - `IndirectPing`: asks a third node to relay a probe and forward the ack.
/// - `Suspect`/`Alive`/`Dead`: membership state dissemination. A `Dead` whose
///   `from` equals the subject is a voluntary departure.
/// - `User`: opaque application payload for the remote delegate.
/// - `PushPull`: full-state anti-entropy exchange over a stream.
/// - `Compound`/`Compressed`/`Encrypted`: envelopes, see the module docs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Ping {
        seq: u32,
        from: NodeId,
        /// Name the sender believes it is probing; receivers drop mismatches.
        target: NodeId,
    },

    IndirectPing {
        seq: u32,
        from: NodeId,
        target: NodeId,
        target_addr: SocketAddr,
    },

    Ack {
        seq: u32,
        payload: Vec<u8>,
    },

    Suspect {
        id: NodeId,
        incarnation: u64,
        from: NodeId,
    },

    Alive {
        node: Node,
        vsn: Vsn,
    },

    Dead {
        id: NodeId,
        incarnation: u64,
        from: NodeId,
    },

    User(Vec<u8>),

    PushPull {
        join: bool,
        nodes: Vec<Node>,
        user_state: Vec<u8>,
    },

    Compound(Vec<Vec<u8>>),
    Compressed(Vec<u8>),
    Encrypted(Vec<u8>),
}

impl Message {
    /// Short tag for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping { .. } => "ping",
            Message::IndirectPing { .. } => "indirect-ping",
            Message::Ack { .. } => "ack",
            Message::Suspect { .. } => "suspect",
            Message::Alive { .. } => "alive",
            Message::Dead { .. } => "dead",
            Message::User(_) => "user",
            Message::PushPull { .. } => "push-pull",
            Message::Compound(_) => "compound",
            Message::Compressed(_) => "compressed",
            Message::Encrypted(_) => "encrypted",
        }
    }
}
