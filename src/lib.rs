//! Gossip Cluster Membership Library
//!
//! This library crate implements a gossip-based cluster membership and
//! failure-detection engine. It serves as the foundation for the demo binary
//! (`main.rs`) and for embedding into larger systems through the delegate
//! traits.
//!
//! ## Architecture Modules
//! The engine is composed of loosely coupled subsystems:
//!
//! - **`membership`**: The authoritative member directory. Applies Alive,
//!   Suspect and Dead claims under incarnation-based ordering rules.
//! - **`detector`**: Failure-detection support: the node health (awareness)
//!   score and the corroboration-accelerated suspicion timers.
//! - **`broadcast`**: The transmit-limited queue of pending state changes,
//!   piggybacked onto regular traffic.
//! - **`protocol`**: Wire message definitions plus the compression and
//!   encryption envelope codec.
//! - **`security`**: AES-GCM keyring with rotation support.
//! - **`transport`**: Packet and stream I/O behind a trait, so the engine
//!   never touches sockets directly.
//! - **`delegate`**: Application hook traits (metadata, user payloads,
//!   lifecycle notifications).
//! - **`cluster`**: The running engine that ties it all together: probe
//!   scheduling, gossip, anti-entropy sync and the public API.
//! - **`config`**: Tunables and the `lan`/`wan`/`local` profiles.

pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod delegate;
pub mod detector;
pub mod membership;
pub mod protocol;
pub mod security;
pub mod transport;

pub use cluster::service::ClusterService;
pub use config::Config;
pub use delegate::{
    AliveDelegate, ConflictDelegate, Delegate, EventDelegate, Hooks, MergeDelegate, PingDelegate,
};
pub use membership::types::{Node, NodeId, NodeState};
pub use security::Keyring;
