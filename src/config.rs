//! Cluster Configuration
//!
//! Every tunable recognized by the engine, plus three ready-made profiles
//! (`lan`, `wan`, `local`) with conservative defaults. Validation happens once
//! at construction time; anything that would leave the engine in a broken
//! state (bad key length, empty name, zero probe cadence) fails fast here
//! instead of surfacing later as mysterious protocol behavior.

use anyhow::{Result, bail};
use std::net::SocketAddr;
use std::time::Duration;

use crate::security::{Keyring, validate_key_len};

/// Lowest wire protocol version this build can speak.
pub const PROTOCOL_VERSION_MIN: u8 = 1;
/// Highest wire protocol version this build can speak.
pub const PROTOCOL_VERSION_MAX: u8 = 3;

#[derive(Debug, Clone)]
pub struct Config {
    /// Unique name of this node within the cluster.
    pub name: String,

    /// Address the gossip UDP socket and TCP listener bind to.
    /// Port 0 picks a free port.
    pub bind_addr: SocketAddr,

    /// Address advertised to the rest of the cluster. Required when binding
    /// to an unspecified address (0.0.0.0), useful behind NAT.
    pub advertise_addr: Option<SocketAddr>,

    /// Wire protocol version we speak. Must lie within
    /// [`PROTOCOL_VERSION_MIN`], [`PROTOCOL_VERSION_MAX`].
    pub protocol_version: u8,

    /// Timeout for establishing stream connections and for stream reads and
    /// writes (full state sync, fallback TCP pings).
    pub tcp_timeout: Duration,

    /// Number of nodes asked to relay a probe when the direct probe fails.
    pub indirect_checks: usize,

    /// Retransmit budget multiplier: a broadcast is dropped after
    /// `ceil(retransmit_mult * ln(n + 1))` transmissions.
    pub retransmit_mult: u32,

    /// Suspicion timeout multiplier:
    /// `suspicion_timeout = suspicion_mult * ln(n + 1) * probe_interval`.
    pub suspicion_mult: u32,

    /// Upper bound multiplier applied to the suspicion timeout.
    pub suspicion_max_timeout_mult: u32,

    /// Interval between full anti-entropy state exchanges. Zero disables them.
    pub push_pull_interval: Duration,

    /// Interval between failure-detector probe rounds.
    pub probe_interval: Duration,

    /// How long to wait for a direct ack before escalating to indirect and
    /// TCP probes. Should be set near the 99th percentile network RTT.
    pub probe_timeout: Duration,

    /// Disables the fallback TCP ping that is pipelined with indirect probes.
    pub disable_tcp_pings: bool,

    /// Ceiling of the local health score. Probe cadence is stretched by
    /// `(1 + score)` while the node observes its own probes failing.
    pub awareness_max_multiplier: usize,

    /// Interval of the background gossip ticker. Zero disables non-piggyback
    /// gossip entirely.
    pub gossip_interval: Duration,

    /// Number of random peers each gossip tick sends to.
    pub gossip_nodes: usize,

    /// How long dead nodes keep receiving gossip (and stay in the directory)
    /// so a falsely-declared node has a chance to refute.
    pub gossip_to_the_dead_time: Duration,

    /// Reject unencrypted incoming packets even when keys would otherwise be
    /// optional. Used when upshifting a running cluster to encryption.
    pub gossip_verify_incoming: bool,

    /// Enforce encryption of outgoing packets whenever a keyring is present.
    pub gossip_verify_outgoing: bool,

    /// Deflate-compress packets before (optional) encryption.
    pub enable_compression: bool,

    /// Primary encryption key; 16, 24 or 32 bytes selecting AES-128/192/256.
    /// Installed at index 0 of the keyring.
    pub secret_key: Option<Vec<u8>>,

    /// Pre-built keyring. Combined with `secret_key` at startup.
    pub keyring: Option<Keyring>,

    /// Version triple for delegate (application) payloads, carried on alive
    /// messages so peers can gate custom message compatibility.
    pub delegate_protocol_version: u8,
    pub delegate_protocol_min: u8,
    pub delegate_protocol_max: u8,

    /// After a node has been dead this long, a node with the same name but a
    /// different address may reclaim the identity. Zero forbids reclaim.
    pub dead_node_reclaim_time: Duration,

    /// Capacity of the inbound packet queue between the transport and the
    /// message handler.
    pub handoff_queue_depth: usize,

    /// Maximum bytes placed in a single packet. 1400 is safe for most MTUs.
    pub udp_buffer_size: usize,
}

impl Config {
    /// Sane defaults for a LAN environment. Errs on the side of caution:
    /// tuned for convergence over bandwidth.
    pub fn lan() -> Self {
        Self {
            name: uuid::Uuid::new_v4().to_string(),
            bind_addr: "0.0.0.0:7946".parse().unwrap(),
            advertise_addr: None,
            protocol_version: 2,
            tcp_timeout: Duration::from_secs(10),
            indirect_checks: 3,
            retransmit_mult: 4,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            push_pull_interval: Duration::from_secs(30),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            disable_tcp_pings: false,
            awareness_max_multiplier: 8,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead_time: Duration::from_secs(30),
            gossip_verify_incoming: true,
            gossip_verify_outgoing: true,
            enable_compression: true,
            secret_key: None,
            keyring: None,
            delegate_protocol_version: 0,
            delegate_protocol_min: 0,
            delegate_protocol_max: 0,
            dead_node_reclaim_time: Duration::ZERO,
            handoff_queue_depth: 1024,
            udp_buffer_size: 1400,
        }
    }

    /// Like [`Config::lan`] but tuned for WAN latencies: longer timeouts,
    /// less frequent but wider gossip.
    pub fn wan() -> Self {
        let mut config = Self::lan();
        config.tcp_timeout = Duration::from_secs(30);
        config.suspicion_mult = 6;
        config.push_pull_interval = Duration::from_secs(60);
        config.probe_timeout = Duration::from_secs(3);
        config.probe_interval = Duration::from_secs(5);
        config.gossip_nodes = 4;
        config.gossip_interval = Duration::from_millis(500);
        config.gossip_to_the_dead_time = Duration::from_secs(60);
        config
    }

    /// Like [`Config::lan`] but tuned for loopback testing: tight timeouts,
    /// a single indirect check.
    pub fn local() -> Self {
        let mut config = Self::lan();
        config.tcp_timeout = Duration::from_secs(1);
        config.indirect_checks = 1;
        config.retransmit_mult = 2;
        config.suspicion_mult = 3;
        config.push_pull_interval = Duration::from_secs(15);
        config.probe_timeout = Duration::from_millis(200);
        config.probe_interval = Duration::from_secs(1);
        config.gossip_interval = Duration::from_millis(100);
        config.gossip_to_the_dead_time = Duration::from_secs(15);
        config
    }

    /// Whether packets will be encrypted on the wire.
    pub fn encryption_enabled(&self) -> bool {
        self.secret_key.is_some()
            || self.keyring.as_ref().map(|k| !k.is_empty()).unwrap_or(false)
    }

    /// Fail-fast validation of everything that cannot be recovered from at
    /// runtime. Called once during service construction.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("node name must not be empty");
        }
        if self.probe_interval.is_zero() {
            bail!("probe_interval must be non-zero");
        }
        if self.probe_timeout.is_zero() {
            bail!("probe_timeout must be non-zero");
        }
        if self.probe_timeout > self.probe_interval {
            bail!("probe_timeout must not exceed probe_interval");
        }
        if self.protocol_version < PROTOCOL_VERSION_MIN
            || self.protocol_version > PROTOCOL_VERSION_MAX
        {
            bail!(
                "protocol_version {} outside supported range [{}, {}]",
                self.protocol_version,
                PROTOCOL_VERSION_MIN,
                PROTOCOL_VERSION_MAX
            );
        }
        if let Some(key) = &self.secret_key {
            validate_key_len(key)?;
        }
        if self.gossip_nodes == 0 && !self.gossip_interval.is_zero() {
            bail!("gossip_nodes must be at least 1 when gossip is enabled");
        }
        if self.handoff_queue_depth == 0 {
            bail!("handoff_queue_depth must be at least 1");
        }
        if self.udp_buffer_size < 128 {
            bail!("udp_buffer_size too small to carry a probe message");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_validate() {
        Config::lan().validate().expect("lan profile should be valid");
        Config::wan().validate().expect("wan profile should be valid");
        Config::local().validate().expect("local profile should be valid");
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut config = Config::local();
        config.name = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let mut config = Config::local();
        config.secret_key = Some(vec![0u8; 15]);
        assert!(config.validate().is_err());

        config.secret_key = Some(vec![0u8; 32]);
        config.validate().expect("32-byte key should be accepted");
    }

    #[test]
    fn test_probe_timeout_must_fit_interval() {
        let mut config = Config::local();
        config.probe_timeout = Duration::from_secs(5);
        config.probe_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_encryption_enabled_flag() {
        let mut config = Config::local();
        assert!(!config.encryption_enabled());
        config.secret_key = Some(vec![7u8; 16]);
        assert!(config.encryption_enabled());
    }
}
