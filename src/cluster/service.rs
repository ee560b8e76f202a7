use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::probe::ProbeRotation;
use crate::broadcast::queue::{BroadcastQueue, retransmit_limit};
use crate::config::{Config, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
use crate::delegate::Hooks;
use crate::detector::awareness::Awareness;
use crate::detector::suspicion::{Suspicion, suspicion_timeout};
use crate::membership::directory::{AliveOutcome, DeadOutcome, Directory, SuspectOutcome};
use crate::membership::types::{Node, NodeId, NodeState};
use crate::protocol::codec::{self, COMPOUND_OVERHEAD, PacketCodec};
use crate::protocol::messages::{Message, Vsn};
use crate::security::Keyring;
use crate::transport::net::NetTransport;
use crate::transport::{Packet, Transport};

/// Maximum bytes of delegate metadata carried on an alive announcement.
pub const META_MAX_SIZE: usize = 512;

/// Bytes reserved per packet for the compression and encryption envelopes.
const ENVELOPE_SLACK: usize = 64;

/// Estimated envelope cost of wrapping a user payload as a user message.
const USER_ENVELOPE: usize = 8;

/// A received probe acknowledgement, routed to whoever is waiting on the
/// sequence number.
pub struct AckInfo {
    pub payload: Vec<u8>,
    pub timestamp: Instant,
}

/// The running gossip engine: one instance per cluster member.
///
/// All state lives behind concurrent structures so the periodic loops and the
/// packet handlers never serialize on a single lock. Construction binds the
/// transport; [`ClusterService::start`] brings the loops up.
pub struct ClusterService {
    pub(crate) config: Config,
    pub(crate) codec: PacketCodec,
    pub(crate) local_id: NodeId,
    pub(crate) advertise_addr: SocketAddr,
    incarnation: AtomicU64,
    pub(crate) directory: Directory,
    pub(crate) awareness: Awareness,
    pub(crate) broadcasts: BroadcastQueue,
    pub(crate) suspicions: DashMap<NodeId, Arc<Suspicion>>,
    pub(crate) ack_handlers: DashMap<u32, mpsc::Sender<AckInfo>>,
    seq: AtomicU32,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) hooks: Hooks,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    pub(crate) rotation: StdMutex<ProbeRotation>,
    leaving: AtomicBool,
}

impl ClusterService {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        Self::with_hooks(config, Hooks::default()).await
    }

    /// Validates the configuration, binds the transport and builds the
    /// engine. No background work starts until [`ClusterService::start`].
    pub async fn with_hooks(config: Config, hooks: Hooks) -> Result<Arc<Self>> {
        config.validate()?;

        let keyring = match (config.keyring.clone(), config.secret_key.clone()) {
            (Some(mut ring), Some(key)) => {
                ring.install(key.clone())?;
                ring.use_key(&key)?;
                Some(ring)
            }
            (Some(ring), None) => Some(ring),
            (None, Some(key)) => Some(Keyring::new(key)?),
            (None, None) => None,
        };
        let codec = PacketCodec {
            compress: config.enable_compression,
            keyring,
            verify_incoming: config.gossip_verify_incoming,
            verify_outgoing: config.gossip_verify_outgoing,
        };

        let transport = Arc::new(
            NetTransport::bind(
                config.bind_addr,
                config.handoff_queue_depth,
                config.udp_buffer_size,
            )
            .await?,
        );
        let advertise_addr = transport.final_advertise_addr(config.advertise_addr)?;

        let meta = hooks.delegate.node_meta(META_MAX_SIZE);
        if meta.len() > META_MAX_SIZE {
            bail!("delegate metadata exceeds {} bytes", META_MAX_SIZE);
        }
        let local_id = NodeId(config.name.clone());
        let local = Node::new(local_id.clone(), advertise_addr, meta, 1);
        let directory = Directory::new(local, config.dead_node_reclaim_time);

        let (shutdown_tx, _) = watch::channel(false);
        let awareness = Awareness::new(config.awareness_max_multiplier);

        Ok(Arc::new(Self {
            codec,
            local_id,
            advertise_addr,
            incarnation: AtomicU64::new(1),
            directory,
            awareness,
            broadcasts: BroadcastQueue::new(),
            suspicions: DashMap::new(),
            ack_handlers: DashMap::new(),
            seq: AtomicU32::new(0),
            transport,
            hooks,
            shutdown_tx,
            tasks: StdMutex::new(Vec::new()),
            rotation: StdMutex::new(ProbeRotation::new()),
            leaving: AtomicBool::new(false),
            config,
        }))
    }

    /// Spawns the background loops: packet ingest, stream accept, probing,
    /// gossip and (unless disabled) periodic anti-entropy sync.
    pub fn start(self: &Arc<Self>) {
        info!(
            "Starting cluster node {} on {} (proto v{})",
            self.local_id, self.advertise_addr, self.config.protocol_version
        );
        self.queue_local_alive();

        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        tasks.push(tokio::spawn(self.clone().packet_loop(self.shutdown_rx())));
        tasks.push(tokio::spawn(self.clone().stream_loop(self.shutdown_rx())));
        tasks.push(tokio::spawn(self.clone().probe_loop(self.shutdown_rx())));
        if !self.config.gossip_interval.is_zero() {
            tasks.push(tokio::spawn(self.clone().gossip_loop(self.shutdown_rx())));
        }
        if !self.config.push_pull_interval.is_zero() {
            tasks.push(tokio::spawn(self.clone().push_pull_loop(self.shutdown_rx())));
        }
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // ------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------

    /// Syncs state with each reachable seed. Returns how many seeds were
    /// contacted; errs only when every seed failed.
    pub async fn join(self: &Arc<Self>, seeds: &[SocketAddr]) -> Result<usize> {
        let mut contacted = 0;
        let mut last_err = None;
        for &seed in seeds {
            match self.push_pull_node(seed, true).await {
                Ok(()) => {
                    debug!("Synced with seed {}", seed);
                    contacted += 1;
                }
                Err(e) => {
                    warn!("Failed to sync with seed {}: {:#}", seed, e);
                    last_err = Some(e);
                }
            }
        }
        if contacted == 0
            && let Some(e) = last_err
        {
            return Err(e.context("unable to reach any seed node"));
        }
        Ok(contacted)
    }

    /// Announces a voluntary departure. The node keeps running (and keeps
    /// refuting nothing) until [`ClusterService::shutdown`]; peers record it
    /// as Left rather than failed.
    pub async fn leave(&self) -> Result<()> {
        if self.leaving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let local = self.local_node();
        self.directory
            .update_local(local.incarnation, local.meta.clone(), NodeState::Left);
        let dead = Message::Dead {
            id: self.local_id.clone(),
            incarnation: local.incarnation,
            from: self.local_id.clone(),
        };
        self.queue_broadcast(self.local_id.clone(), &dead);

        // Push the departure out directly instead of waiting for the ticker.
        for peer in self.random_peers(self.config.gossip_nodes.max(1), &self.local_id) {
            if let Err(e) = self.send_packet(dead.clone(), peer.addr).await {
                debug!("Failed to notify {} of our departure: {:#}", peer.id, e);
            }
        }
        info!("Node {} left the cluster", self.local_id);
        Ok(())
    }

    /// Re-reads delegate metadata and re-announces the local node under a
    /// fresh incarnation.
    pub fn update_node(&self) -> Result<()> {
        let meta = self.hooks.delegate.node_meta(META_MAX_SIZE);
        if meta.len() > META_MAX_SIZE {
            bail!("delegate metadata exceeds {} bytes", META_MAX_SIZE);
        }
        let incarnation = self.next_incarnation();
        let node = self.directory.update_local(incarnation, meta, NodeState::Alive);
        self.queue_broadcast(node.id.clone(), &self.alive_message(node));
        Ok(())
    }

    /// Fires an opaque user payload at a peer, best-effort. The remote
    /// delegate receives it via `notify_msg`.
    pub async fn send_user_msg(&self, addr: SocketAddr, payload: Vec<u8>) -> Result<()> {
        self.send_packet(Message::User(payload), addr).await.map(|_| ())
    }

    /// Point-in-time copy of every known member record.
    pub fn members(&self) -> Vec<Node> {
        self.directory.snapshot()
    }

    pub fn alive_members(&self) -> Vec<Node> {
        self.directory.alive_members()
    }

    pub fn local_node(&self) -> Node {
        self.directory
            .get(&self.local_id)
            .expect("local record always present")
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise_addr
    }

    /// Current local health score, 0 (healthy) up to the configured maximum.
    pub fn health_score(&self) -> usize {
        self.awareness.score()
    }

    /// Stops every loop, cancels pending suspicions and releases the
    /// transport. Does not announce a departure; call
    /// [`ClusterService::leave`] first for a graceful exit.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down cluster node {}", self.local_id);
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
        for entry in self.suspicions.iter() {
            entry.value().cancel();
        }
        self.suspicions.clear();
        self.transport.shutdown().await
    }

    // ------------------------------------------------------------
    // Packet path
    // ------------------------------------------------------------

    pub(crate) async fn packet_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                packet = self.transport.next_packet() => {
                    let Some(packet) = packet else { return };
                    self.handle_packet(packet).await;
                }
            }
        }
    }

    pub(crate) async fn handle_packet(self: &Arc<Self>, packet: Packet) {
        let msg = match self.codec.open(&packet.buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping malformed packet from {}: {:#}", packet.from, e);
                return;
            }
        };
        match msg {
            Message::Compound(parts) => {
                for part in parts {
                    match codec::decode(&part) {
                        Ok(Message::Compound(_)) => {
                            warn!("Dropping nested compound part from {}", packet.from);
                        }
                        Ok(inner) => self.dispatch(inner, packet.from, packet.timestamp).await,
                        Err(e) => {
                            warn!(
                                "Dropping malformed compound part from {}: {:#}",
                                packet.from, e
                            );
                        }
                    }
                }
            }
            other => self.dispatch(other, packet.from, packet.timestamp).await,
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Message, from: SocketAddr, timestamp: Instant) {
        trace!("Handling {} from {}", msg.kind(), from);
        match msg {
            Message::Ping { seq, from: _, target } => self.handle_ping(seq, target, from).await,
            Message::IndirectPing { seq, from: _, target, target_addr } => {
                self.handle_indirect_ping(seq, target, target_addr, from);
            }
            Message::Ack { seq, payload } => self.handle_ack(seq, payload, timestamp).await,
            Message::Suspect { id, incarnation, from } => {
                self.handle_suspect(id, incarnation, from);
            }
            Message::Alive { node, vsn } => self.handle_alive(node, vsn),
            Message::Dead { id, incarnation, from } => self.handle_dead(id, incarnation, from),
            Message::User(payload) => self.hooks.delegate.notify_msg(&payload),
            other => debug!(
                "Ignoring unexpected {} message on the packet transport",
                other.kind()
            ),
        }
    }

    async fn handle_ping(&self, seq: u32, target: NodeId, reply_to: SocketAddr) {
        if target != self.local_id {
            debug!("Ignoring ping meant for {} (we are {})", target, self.local_id);
            return;
        }
        let payload = self
            .hooks
            .ping
            .as_ref()
            .map(|p| p.ack_payload())
            .unwrap_or_default();
        if let Err(e) = self.send_packet(Message::Ack { seq, payload }, reply_to).await {
            warn!("Failed to ack ping from {}: {:#}", reply_to, e);
        }
    }

    /// Relays a probe on behalf of another node and forwards the ack back.
    fn handle_indirect_ping(
        self: &Arc<Self>,
        origin_seq: u32,
        target: NodeId,
        target_addr: SocketAddr,
        reply_to: SocketAddr,
    ) {
        let service = self.clone();
        tokio::spawn(async move {
            let seq = service.next_seq();
            let (tx, mut rx) = mpsc::channel(1);
            service.ack_handlers.insert(seq, tx);

            let ping = Message::Ping {
                seq,
                from: service.local_id.clone(),
                target: target.clone(),
            };
            if let Err(e) = service.send_packet(ping, target_addr).await {
                debug!("Failed to relay probe to {}: {:#}", target, e);
            }

            let wait = service.awareness.scale(service.config.probe_timeout);
            let outcome = tokio::time::timeout(wait, rx.recv()).await;
            service.ack_handlers.remove(&seq);
            if let Ok(Some(ack)) = outcome {
                let relay = Message::Ack { seq: origin_seq, payload: ack.payload };
                if let Err(e) = service.send_packet(relay, reply_to).await {
                    debug!("Failed to forward relayed ack to {}: {:#}", reply_to, e);
                }
            } else {
                debug!("Relayed probe of {} went unanswered", target);
            }
        });
    }

    async fn handle_ack(&self, seq: u32, payload: Vec<u8>, timestamp: Instant) {
        let Some((_, tx)) = self.ack_handlers.remove(&seq) else {
            debug!("Ack for unknown or expired sequence {}", seq);
            return;
        };
        let _ = tx.send(AckInfo { payload, timestamp }).await;
    }

    pub(crate) fn handle_suspect(self: &Arc<Self>, id: NodeId, incarnation: u64, from: NodeId) {
        if id == self.local_id {
            debug!("Refuting suspicion about ourselves (inc={})", incarnation);
            self.refute(incarnation);
            return;
        }
        match self.directory.apply_suspect(&id, incarnation) {
            SuspectOutcome::Suspected(node) => {
                self.start_suspicion(&node, from.clone());
                self.queue_broadcast(
                    node.id.clone(),
                    &Message::Suspect { id: node.id.clone(), incarnation: node.incarnation, from },
                );
            }
            SuspectOutcome::Corroborated(node) => {
                if let Some(suspicion) = self.suspicions.get(&id)
                    && suspicion.confirm(&from)
                {
                    // An independent accuser shortens the timer; re-gossip so
                    // everyone else's timer shortens too.
                    self.queue_broadcast(
                        node.id.clone(),
                        &Message::Suspect { id: node.id.clone(), incarnation, from },
                    );
                }
            }
            SuspectOutcome::Ignored => {}
        }
    }

    pub(crate) fn handle_alive(&self, node: Node, vsn: Vsn) {
        if !self.vsn().compatible(&vsn) {
            debug!("Dropping alive for {} with incompatible protocol range", node.id);
            return;
        }
        if node.id == self.local_id {
            self.handle_local_alive(node);
            return;
        }
        if let Some(gate) = &self.hooks.alive
            && let Err(e) = gate.notify_alive(&node)
        {
            debug!("Alive for {} vetoed by delegate: {:#}", node.id, e);
            return;
        }
        match self.directory.apply_alive(node) {
            AliveOutcome::Joined(node) => {
                self.queue_broadcast(node.id.clone(), &self.alive_message(node.clone()));
                if let Some(events) = &self.hooks.events {
                    events.notify_join(&node);
                }
            }
            AliveOutcome::Applied { node, was } => {
                if was != NodeState::Alive
                    && let Some((_, suspicion)) = self.suspicions.remove(&node.id)
                {
                    debug!("Node {} refuted its suspicion", node.id);
                    suspicion.cancel();
                }
                self.queue_broadcast(node.id.clone(), &self.alive_message(node.clone()));
                if let Some(events) = &self.hooks.events {
                    if was.is_terminal() {
                        events.notify_join(&node);
                    } else if was == NodeState::Alive {
                        events.notify_update(&node);
                    }
                }
            }
            AliveOutcome::Conflict { existing, candidate } => {
                if let Some(conflict) = &self.hooks.conflict {
                    conflict.notify_conflict(&existing, &candidate);
                }
            }
            AliveOutcome::Ignored => {}
        }
    }

    /// An alive claim bearing our own name: an echo of our own announcement,
    /// a leftover record from a previous life, or another node squatting on
    /// our identity.
    fn handle_local_alive(&self, claim: Node) {
        // A departing node no longer defends its identity.
        if self.leaving.load(Ordering::SeqCst) {
            return;
        }
        if claim.addr != self.advertise_addr {
            warn!(
                "Another node claims our name {} from {}",
                self.local_id, claim.addr
            );
            if let Some(conflict) = &self.hooks.conflict {
                let local = self.local_node();
                conflict.notify_conflict(&local, &claim);
            }
            self.refute(claim.incarnation);
            return;
        }

        let local = self.local_node();
        if claim.incarnation < local.incarnation {
            return;
        }
        if claim.incarnation == local.incarnation && claim.meta == local.meta {
            // Our own announcement coming back around.
            return;
        }
        // A record from before a restart, or a diverging claim at our own
        // incarnation. Outbid it or peers will keep discarding our
        // announcements as stale.
        warn!(
            "Outbidding a stale record of ourselves (theirs inc={}, ours inc={})",
            claim.incarnation, local.incarnation
        );
        self.refute(claim.incarnation);
    }

    pub(crate) fn handle_dead(&self, id: NodeId, incarnation: u64, from: NodeId) {
        if id == self.local_id {
            if self.leaving.load(Ordering::SeqCst) && from == self.local_id {
                return;
            }
            warn!("Refuting a death claim about ourselves (inc={})", incarnation);
            self.refute(incarnation);
            return;
        }
        match self.directory.apply_dead(&id, incarnation, &from) {
            DeadOutcome::Confirmed { node, .. } => {
                if let Some((_, suspicion)) = self.suspicions.remove(&id) {
                    suspicion.cancel();
                }
                self.queue_broadcast(
                    id.clone(),
                    &Message::Dead { id: id.clone(), incarnation, from },
                );
                if let Some(events) = &self.hooks.events {
                    events.notify_leave(&node);
                }
            }
            DeadOutcome::Ignored => {}
        }
    }

    // ------------------------------------------------------------
    // Suspicion lifecycle
    // ------------------------------------------------------------

    pub(crate) fn start_suspicion(self: &Arc<Self>, node: &Node, accuser: NodeId) {
        let n = self.directory.cluster_size_estimate();
        // Everyone except us and the suspect could independently corroborate.
        let cap = n.saturating_sub(2);
        let min = suspicion_timeout(self.config.suspicion_mult, n, self.config.probe_interval);
        let max = min * self.config.suspicion_max_timeout_mult;

        let weak = Arc::downgrade(self);
        let id = node.id.clone();
        let incarnation = node.incarnation;
        let suspicion = Suspicion::spawn(incarnation, accuser, cap, min, max, move || async move {
            if let Some(service) = weak.upgrade() {
                service.finish_suspicion(id, incarnation).await;
            }
        });
        if let Some(previous) = self.suspicions.insert(node.id.clone(), suspicion) {
            previous.cancel();
        }
    }

    /// Runs when a suspicion timer expires without refutation. Re-checks the
    /// directory so a refutation that raced the expiry still wins.
    pub(crate) async fn finish_suspicion(&self, id: NodeId, incarnation: u64) {
        // A refute-then-resuspect may have installed a newer timer under the
        // same name; only evict the entry this expiry belongs to.
        self.suspicions
            .remove_if(&id, |_, suspicion| suspicion.incarnation == incarnation);
        match self.directory.apply_dead(&id, incarnation, &self.local_id) {
            DeadOutcome::Confirmed { node, .. } => {
                warn!("Suspicion about {} expired without refutation", id);
                self.queue_broadcast(
                    id.clone(),
                    &Message::Dead {
                        id: id.clone(),
                        incarnation: node.incarnation,
                        from: self.local_id.clone(),
                    },
                );
                if let Some(events) = &self.hooks.events {
                    events.notify_leave(&node);
                }
            }
            DeadOutcome::Ignored => {
                debug!("Expired suspicion about {} was already stale", id);
            }
        }
    }

    /// Raises our incarnation above an observed claim and re-announces
    /// ourselves as alive.
    pub(crate) fn refute(&self, observed: u64) {
        let previous = self
            .incarnation
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.max(observed) + 1)
            })
            .expect("fetch_update closure never returns None");
        let next = previous.max(observed) + 1;
        let meta = self.hooks.delegate.node_meta(META_MAX_SIZE);
        let node = self.directory.update_local(next, meta, NodeState::Alive);
        self.queue_broadcast(node.id.clone(), &self.alive_message(node));
    }

    // ------------------------------------------------------------
    // Gossip
    // ------------------------------------------------------------

    pub(crate) async fn gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.gossip_interval) => {}
                _ = shutdown.changed() => return,
            }
            self.gossip_round().await;
        }
    }

    /// Drops expired terminal records and their per-node resources. Runs on
    /// the probe ticker, which is always active, so retention is enforced
    /// even with the gossip ticker disabled.
    pub(crate) fn prune_directory(&self) {
        // Retention must outlast both obituary gossip and the reclaim window,
        // or a conflicting rejoin could slip past undetected.
        let retention = self
            .config
            .gossip_to_the_dead_time
            .max(self.config.dead_node_reclaim_time);
        for id in self.directory.prune(retention) {
            if let Some((_, suspicion)) = self.suspicions.remove(&id) {
                suspicion.cancel();
            }
            self.broadcasts.invalidate(&id);
        }
    }

    async fn gossip_round(&self) {
        let mut targets = self
            .directory
            .gossip_candidates(self.config.gossip_to_the_dead_time);
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(self.config.gossip_nodes);

        for target in targets {
            let budget = self.config.udp_buffer_size.saturating_sub(ENVELOPE_SLACK);
            let parts = self.gather_piggyback(budget);
            if parts.is_empty() {
                return;
            }
            let buf = match self.codec.seal(&Message::Compound(parts)) {
                Ok(buf) => buf,
                Err(e) => {
                    error!("Failed to seal gossip packet: {:#}", e);
                    return;
                }
            };
            if let Err(e) = self.transport.write_to(&buf, target.addr).await {
                debug!("Gossip to {} failed: {:#}", target.id, e);
            }
        }
    }

    // ------------------------------------------------------------
    // Wire helpers
    // ------------------------------------------------------------

    /// Seals and transmits a message, filling the remaining packet budget
    /// with piggybacked broadcasts.
    pub(crate) async fn send_packet(&self, msg: Message, addr: SocketAddr) -> Result<Instant> {
        let primary = codec::encode(&msg)?;
        let budget = self
            .config
            .udp_buffer_size
            .saturating_sub(primary.len())
            .saturating_sub(ENVELOPE_SLACK);
        let piggyback = self.gather_piggyback(budget);
        let buf = match codec::with_piggyback(primary, piggyback) {
            Some(compound) => self.codec.seal(&compound)?,
            None => self.codec.seal(&msg)?,
        };
        self.transport
            .write_to(&buf, addr)
            .await
            .with_context(|| format!("failed to send {} to {}", msg.kind(), addr))
    }

    /// Drains pending broadcasts (engine first, then delegate payloads) into
    /// encoded compound parts fitting `budget` bytes.
    fn gather_piggyback(&self, budget: usize) -> Vec<Vec<u8>> {
        if budget <= COMPOUND_OVERHEAD {
            return Vec::new();
        }
        let cap = retransmit_limit(
            self.config.retransmit_mult,
            self.directory.cluster_size_estimate(),
        );
        let mut parts = self.broadcasts.get_broadcasts(COMPOUND_OVERHEAD, budget, cap);
        let mut used: usize = parts.iter().map(|p| p.len() + COMPOUND_OVERHEAD).sum();

        let remaining = budget.saturating_sub(used);
        if remaining > COMPOUND_OVERHEAD + USER_ENVELOPE {
            let payloads = self
                .hooks
                .delegate
                .get_broadcasts(COMPOUND_OVERHEAD + USER_ENVELOPE, remaining);
            for payload in payloads {
                match codec::encode(&Message::User(payload)) {
                    Ok(part) if used + part.len() + COMPOUND_OVERHEAD <= budget => {
                        used += part.len() + COMPOUND_OVERHEAD;
                        parts.push(part);
                    }
                    Ok(_) => debug!("Skipping user broadcast that exceeds the packet budget"),
                    Err(e) => error!("Failed to encode user broadcast: {:#}", e),
                }
            }
        }
        parts
    }

    fn queue_local_alive(&self) {
        let node = self.local_node();
        self.queue_broadcast(node.id.clone(), &self.alive_message(node));
    }

    pub(crate) fn queue_broadcast(&self, name: NodeId, msg: &Message) {
        match codec::encode(msg) {
            Ok(buf) => self.broadcasts.queue(name, buf),
            Err(e) => error!("Failed to encode {} broadcast: {:#}", msg.kind(), e),
        }
    }

    pub(crate) fn alive_message(&self, node: Node) -> Message {
        Message::Alive { node, vsn: self.vsn() }
    }

    pub(crate) fn vsn(&self) -> Vsn {
        Vsn {
            proto_min: PROTOCOL_VERSION_MIN,
            proto_cur: self.config.protocol_version,
            proto_max: PROTOCOL_VERSION_MAX,
            delegate_min: self.config.delegate_protocol_min,
            delegate_cur: self.config.delegate_protocol_version,
            delegate_max: self.config.delegate_protocol_max,
        }
    }

    pub(crate) fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    fn next_incarnation(&self) -> u64 {
        self.incarnation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Up to `count` random probeable peers, excluding `exclude` and
    /// ourselves.
    pub(crate) fn random_peers(&self, count: usize, exclude: &NodeId) -> Vec<Node> {
        let mut candidates: Vec<Node> = self
            .directory
            .probe_candidates()
            .into_iter()
            .filter(|node| &node.id != exclude)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        candidates
    }
}
