//! Cluster Engine
//!
//! Ties the subsystems together into a running node. [`service::ClusterService`]
//! owns the membership directory, broadcast queue, awareness score and
//! suspicion table, and drives them from a set of independent periodic loops:
//!
//! - the **probe loop** (failure detection, `probe.rs`),
//! - the **gossip loop** (background dissemination when piggyback traffic is
//!   not enough),
//! - the **push/pull loop** (anti-entropy state sync, `sync.rs`),
//! - the **packet ingest loop** and the **stream accept loop**.
//!
//! The loops coordinate only through the shared structures above; probes to
//! different targets never serialize on each other. Shutdown stops every
//! ticker, cancels all suspicion timers and releases the transport.

pub mod probe;
pub mod service;
pub mod sync;

#[cfg(test)]
mod tests;
