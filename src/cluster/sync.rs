//! Anti-entropy state sync and stream probes.
//!
//! The stream transport carries two exchanges, both as length-prefixed sealed
//! frames: the full push/pull membership swap and the fallback stream ping
//! used when a peer's packet path looks dead. Push/pull repairs whatever
//! gossip missed; a single exchange bounds how long two partitions can
//! disagree after healing.

use anyhow::{Context, Result, bail};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use super::service::ClusterService;
use crate::membership::types::{Node, NodeState};
use crate::protocol::messages::Message;

/// Upper bound on a single stream frame. A full membership snapshot of a
/// large cluster fits comfortably; anything bigger is hostile or broken.
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

pub(crate) async fn write_frame(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    if buf.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds the stream limit", buf.len());
    }
    stream.write_u32(buf.len() as u32).await?;
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let len = stream.read_u32().await.context("failed to read frame length")? as usize;
    if len > MAX_FRAME_LEN {
        bail!("peer announced an oversized {}-byte frame", len);
    }
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .context("failed to read frame body")?;
    Ok(buf)
}

impl ClusterService {
    pub(crate) async fn push_pull_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.push_pull_interval) => {}
                _ = shutdown.changed() => return,
            }
            let Some(peer) = self.random_peers(1, &self.local_id).into_iter().next() else {
                continue;
            };
            if let Err(e) = self.push_pull_node(peer.addr, false).await {
                debug!("State sync with {} failed: {:#}", peer.id, e);
            }
        }
    }

    /// Dials a peer and swaps full membership snapshots plus delegate state.
    pub(crate) async fn push_pull_node(self: &Arc<Self>, addr: SocketAddr, join: bool) -> Result<()> {
        let timeout = self.config.tcp_timeout;
        let mut stream = self.transport.dial_timeout(addr, timeout).await?;

        let request = Message::PushPull {
            join,
            nodes: self.directory.snapshot(),
            user_state: self.hooks.delegate.local_state(join),
        };
        let buf = self.codec.seal(&request)?;
        tokio::time::timeout(timeout, write_frame(&mut stream, &buf))
            .await
            .context("state push timed out")??;

        let reply = tokio::time::timeout(timeout, read_frame(&mut stream))
            .await
            .context("state pull timed out")??;
        match self.codec.open(&reply)? {
            Message::PushPull { nodes, user_state, .. } => {
                self.merge_remote_state(nodes, &user_state, join)
            }
            other => bail!("expected a push-pull reply, got {}", other.kind()),
        }
    }

    /// Folds a remote membership snapshot into the directory through the
    /// regular claim handlers, so all ordering rules apply unchanged.
    pub(crate) fn merge_remote_state(
        self: &Arc<Self>,
        nodes: Vec<Node>,
        user_state: &[u8],
        join: bool,
    ) -> Result<()> {
        if join
            && let Some(merge) = &self.hooks.merge
        {
            merge
                .notify_merge(&nodes)
                .context("merge vetoed by delegate")?;
        }

        let vsn = self.vsn();
        for node in nodes {
            match node.state {
                NodeState::Alive => self.handle_alive(node, vsn),
                // A remote Dead becomes a local Suspect: the node gets its
                // refutation window with us even if the remote gave up.
                NodeState::Suspect | NodeState::Dead => {
                    if node.id == self.local_id {
                        self.refute(node.incarnation);
                        continue;
                    }
                    if self.directory.get(&node.id).is_none() {
                        let mut candidate = node.clone();
                        candidate.state = NodeState::Alive;
                        self.handle_alive(candidate, vsn);
                    }
                    self.handle_suspect(node.id.clone(), node.incarnation, self.local_id.clone());
                }
                NodeState::Left => {
                    if node.id == self.local_id {
                        self.refute(node.incarnation);
                        continue;
                    }
                    self.handle_dead(node.id.clone(), node.incarnation, node.id.clone());
                }
            }
        }

        self.hooks.delegate.merge_remote_state(user_state, join);
        Ok(())
    }

    /// Reliable liveness check over the stream transport, pipelined with
    /// indirect probes. Returns the remote ack payload.
    pub(crate) async fn tcp_ping(&self, target: &Node) -> Result<Vec<u8>> {
        let timeout = self.config.tcp_timeout;
        let mut stream = self.transport.dial_timeout(target.addr, timeout).await?;

        let seq = self.next_seq();
        let ping = Message::Ping {
            seq,
            from: self.local_id.clone(),
            target: target.id.clone(),
        };
        let buf = self.codec.seal(&ping)?;
        tokio::time::timeout(timeout, write_frame(&mut stream, &buf))
            .await
            .context("stream ping write timed out")??;

        let reply = tokio::time::timeout(timeout, read_frame(&mut stream))
            .await
            .context("stream ping read timed out")??;
        match self.codec.open(&reply)? {
            Message::Ack { seq: ack_seq, payload } if ack_seq == seq => Ok(payload),
            Message::Ack { .. } => bail!("stream ack carried the wrong sequence"),
            other => bail!("expected an ack, got {}", other.kind()),
        }
    }

    pub(crate) async fn stream_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                stream = self.transport.next_stream() => {
                    let Some(stream) = stream else { return };
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_stream(stream).await {
                            debug!("Inbound stream failed: {:#}", e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_stream(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let timeout = self.config.tcp_timeout;
        let buf = tokio::time::timeout(timeout, read_frame(&mut stream))
            .await
            .context("inbound stream read timed out")??;
        match self.codec.open(&buf)? {
            Message::PushPull { join, nodes, user_state } => {
                // Reply with our snapshot before merging theirs, so both
                // sides exchange pre-merge views.
                let reply = Message::PushPull {
                    join: false,
                    nodes: self.directory.snapshot(),
                    user_state: self.hooks.delegate.local_state(join),
                };
                let out = self.codec.seal(&reply)?;
                tokio::time::timeout(timeout, write_frame(&mut stream, &out))
                    .await
                    .context("state push timed out")??;
                self.merge_remote_state(nodes, &user_state, join)
            }
            Message::Ping { seq, target, .. } => {
                if target != self.local_id {
                    bail!("stream ping for {} arrived at {}", target, self.local_id);
                }
                let payload = self
                    .hooks
                    .ping
                    .as_ref()
                    .map(|p| p.ack_payload())
                    .unwrap_or_default();
                let out = self.codec.seal(&Message::Ack { seq, payload })?;
                tokio::time::timeout(timeout, write_frame(&mut stream, &out))
                    .await
                    .context("stream ack write timed out")??;
                Ok(())
            }
            other => bail!("unexpected {} message on a stream", other.kind()),
        }
    }
}
