//! Application Hooks
//!
//! The engine is decoupled from application semantics through this family of
//! capability traits. [`Delegate`] is the main data hook (metadata, user
//! broadcasts, push/pull state); the rest are optional best-effort
//! notification hooks. Every method here may be called from the packet path
//! and therefore must not block; the engine never retries a hook that fails.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::membership::types::Node;

/// Main application hook into the gossip layer. All methods must be
/// thread-safe and non-blocking.
pub trait Delegate: Send + Sync {
    /// Metadata to attach to this node's alive announcements, at most `limit`
    /// bytes.
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    /// Called with each received user payload. The buffer is only valid for
    /// the duration of the call.
    fn notify_msg(&self, _msg: &[u8]) {}

    /// User payloads to piggyback on outgoing gossip. Each buffer costs
    /// `overhead` extra bytes on the wire and the total must stay under
    /// `limit`.
    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }

    /// Application state shipped alongside membership data in a push/pull
    /// exchange. `join` distinguishes the initial join sync.
    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    /// Counterpart of [`Delegate::local_state`]: the remote side's blob after
    /// a push/pull exchange.
    fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}

/// Membership change notifications.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, _node: &Node) {}
    fn notify_leave(&self, _node: &Node) {}
    fn notify_update(&self, _node: &Node) {}
}

/// Fired when a node announces a name we know under a different address.
pub trait ConflictDelegate: Send + Sync {
    fn notify_conflict(&self, _existing: &Node, _other: &Node) {}
}

/// Consulted with the remote membership snapshot before a join-time merge is
/// applied; returning an error aborts the merge.
pub trait MergeDelegate: Send + Sync {
    fn notify_merge(&self, _peers: &[Node]) -> Result<()> {
        Ok(())
    }
}

/// Instruments probe round-trips and contributes an ack payload.
pub trait PingDelegate: Send + Sync {
    /// Payload attached to outgoing acks.
    fn ack_payload(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Called when a probe we initiated completes, with the measured RTT and
    /// the remote ack payload.
    fn notify_ping_complete(&self, _node: &Node, _rtt: Duration, _payload: &[u8]) {}
}

/// Validates alive messages before they are applied; returning an error
/// drops the message.
pub trait AliveDelegate: Send + Sync {
    fn notify_alive(&self, _peer: &Node) -> Result<()> {
        Ok(())
    }
}

/// No-op implementation of every hook; the default wiring.
pub struct NoopDelegate;

impl Delegate for NoopDelegate {}
impl EventDelegate for NoopDelegate {}
impl ConflictDelegate for NoopDelegate {}
impl MergeDelegate for NoopDelegate {}
impl PingDelegate for NoopDelegate {}
impl AliveDelegate for NoopDelegate {}

/// Bundle of hook implementations handed to the engine at construction.
#[derive(Clone)]
pub struct Hooks {
    pub delegate: Arc<dyn Delegate>,
    pub events: Option<Arc<dyn EventDelegate>>,
    pub conflict: Option<Arc<dyn ConflictDelegate>>,
    pub merge: Option<Arc<dyn MergeDelegate>>,
    pub ping: Option<Arc<dyn PingDelegate>>,
    pub alive: Option<Arc<dyn AliveDelegate>>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            delegate: Arc::new(NoopDelegate),
            events: None,
            conflict: None,
            merge: None,
            ping: None,
            alive: None,
        }
    }
}
