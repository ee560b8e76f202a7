//! Membership Directory
//!
//! The authoritative in-memory table of every node this process knows about.
//! All state transitions funnel through [`directory::Directory`], which
//! enforces the protocol's ordering rules so the rest of the engine never has
//! to reason about stale or conflicting claims.
//!
//! ## Core Mechanisms
//! - **Incarnation Numbers**: A per-node logical clock owned by the node
//!   itself. Only a strictly newer incarnation may overwrite recorded state,
//!   regardless of message arrival order.
//! - **Refutation Ordering**: Un-suspecting or reviving a node always takes
//!   a strictly newer incarnation, so a replayed announcement can never undo
//!   a suspicion raised against it. Stale claims are silently discarded,
//!   never errors.
//! - **Dead-Node Retention**: Dead and Left nodes linger for the configured
//!   gossip-to-the-dead window so a falsely declared node can still refute,
//!   then get pruned. `dead_node_reclaim_time` optionally lets a node with a
//!   new address reclaim a long-dead name.

pub mod directory;
pub mod types;

#[cfg(test)]
mod tests;
