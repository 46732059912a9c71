//! Node configuration.
//!
//! Supplied fully-formed by the embedding application (settings
//! persistence is out of scope for this crate).

use crate::identity::MacAddr;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration for one overlay node.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Human-readable node name gossiped to peers.
    pub name: String,
    /// Shared network passphrase; every node of one overlay uses the same.
    pub passphrase: String,
    /// Address to bind the transport to.
    pub bind_addr: SocketAddr,
    /// Overlay IPv4 address, if operating in routed mode.
    pub virtual_ip: Option<Ipv4Addr>,
    /// Link-layer address of the virtual adapter, if bridged.
    pub link_addr: Option<MacAddr>,
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// How long to wait for a requested acknowledgement.
    pub ack_timeout: Duration,
    /// Attempts for acked control sends before giving up.
    pub retry_attempts: u32,
    /// Delay between retry attempts.
    pub retry_delay: Duration,
    /// Abort a handshake that has not completed within this window.
    pub handshake_timeout: Duration,
    /// Consecutive ping failures that evict a peer.
    pub max_timeouts: u32,
    /// Interval between full peer-table exchanges.
    pub peer_exchange_interval: Duration,
    /// Re-handshake after this many packets on one session key.
    pub rekey_after: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: String::from("veilmesh-node"),
            passphrase: String::new(),
            bind_addr: "0.0.0.0:0".parse().expect("static addr"),
            virtual_ip: None,
            link_addr: None,
            ping_interval: Duration::from_secs(2),
            ack_timeout: Duration::from_millis(500),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(250),
            handshake_timeout: Duration::from_secs(3),
            max_timeouts: 10,
            peer_exchange_interval: Duration::from_secs(30),
            rekey_after: 1_000_000,
        }
    }
}
