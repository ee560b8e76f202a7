//! Gossip Broadcast Queue
//!
//! Pending state-change messages waiting to be disseminated, each retried a
//! bounded number of times. The queue is drained opportunistically by every
//! outgoing probe and ack (piggyback) and periodically by the gossip ticker,
//! so dissemination costs almost no extra packets in the steady state.
//!
//! ## Core Mechanisms
//! - **Per-name invalidation**: only the freshest state change per node
//!   survives; queueing a newer claim drops the stale one.
//! - **Retransmit scaling**: an entry is dropped after
//!   `ceil(retransmit_mult * ln(n + 1))` transmissions, bounding bandwidth
//!   while keeping propagation probability high as the cluster grows.
//! - **Deterministic selection**: fewest-transmissions first, newest entry
//!   first on ties, greedily packed under the caller's byte budget.

pub mod queue;
