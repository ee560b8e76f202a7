//! Transport Abstraction
//!
//! The engine never touches sockets directly: all packet and stream I/O goes
//! through the [`Transport`] trait. The packet side is best-effort (UDP in
//! the default implementation), the stream side is reliable (TCP) and carries
//! anti-entropy exchanges and fallback pings.
//!
//! [`net::NetTransport`] is the default implementation: one UDP socket and
//! one TCP listener on the same port, with inbound packets buffered on a
//! channel bounded by the configured handoff queue depth.

pub mod net;

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// An inbound packet with receive-side metadata. The timestamp is taken as
/// close to the socket read as possible so probe RTT measurements stay honest.
#[derive(Debug)]
pub struct Packet {
    pub buf: Vec<u8>,
    pub from: SocketAddr,
    pub timestamp: Instant,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves the address this node should advertise to the cluster, given
    /// the operator's configured value (which may be absent).
    fn final_advertise_addr(&self, configured: Option<SocketAddr>) -> Result<SocketAddr>;

    /// Fires a payload at a peer, connectionless and best-effort. Returns the
    /// transmit timestamp for RTT measurement.
    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant>;

    /// Next inbound packet, or `None` once the transport has shut down.
    async fn next_packet(&self) -> Option<Packet>;

    /// Opens a reliable two-way stream to a peer. Used for the expensive,
    /// infrequent operations: state sync and fallback probes.
    async fn dial_timeout(&self, addr: SocketAddr, timeout: Duration) -> Result<TcpStream>;

    /// Next accepted inbound stream, or `None` once the transport has shut
    /// down.
    async fn next_stream(&self) -> Option<TcpStream>;

    /// Releases sockets and background loops. Idempotent.
    async fn shutdown(&self) -> Result<()>;
}
