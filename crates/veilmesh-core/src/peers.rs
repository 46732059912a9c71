//! Peer directory and gossip records.
//!
//! The directory is the node's view of every other overlay member: how to
//! reach them (directly or through a relay), their overlay addresses and
//! their liveness counters. Records are merged under a monotonicity rule:
//! an address learned through more relay hops never overwrites one
//! learned through fewer, so gossip echoing stale paths cannot regress a
//! working direct route.

use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::identity::{MacAddr, NodeId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

/// One known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Immutable identity.
    pub id: NodeId,
    /// Gossiped display name.
    pub name: String,
    /// Overlay IPv4 address, when the peer runs routed mode.
    pub virtual_ip: Option<Ipv4Addr>,
    /// Link-layer address of the peer's adapter, when bridged.
    pub link_addr: Option<MacAddr>,
    /// Current best real address.
    pub addr: SocketAddr,
    /// Externally reachable candidate addresses. Grows by union; entries
    /// are only removed explicitly.
    pub direct_addrs: BTreeSet<SocketAddr>,
    /// Relay depth: 0 = direct, n = n hops through `relay_id`.
    pub relays: u8,
    /// First-hop relay when `relays > 0`.
    pub relay_id: Option<NodeId>,
    /// Last measured round-trip time.
    pub rtt: Option<Duration>,
    /// Consecutive failed liveness probes.
    pub timeouts: u32,
}

impl PeerRecord {
    /// Create a record for a peer reached directly at `addr`.
    #[must_use]
    pub fn direct(id: NodeId, name: String, addr: SocketAddr) -> Self {
        Self {
            id,
            name,
            virtual_ip: None,
            link_addr: None,
            addr,
            direct_addrs: BTreeSet::new(),
            relays: 0,
            relay_id: None,
            rtt: None,
            timeouts: 0,
        }
    }

    /// True when the peer is reached without intermediate hops.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.relays == 0
    }

    /// Merge a gossiped view of this peer into the record.
    ///
    /// Address and relay path are taken only when the incoming view is at
    /// most as indirect as the current one (`incoming.relays <= self.relays`).
    /// Direct-address candidates are unioned. Name and overlay addresses
    /// are last-writer-wins, with collisions logged.
    ///
    /// Returns true when any field changed.
    pub fn merge(&mut self, incoming: &PeerAnnouncement, relay_id: Option<NodeId>) -> bool {
        debug_assert_eq!(self.id, incoming.id);
        let mut changed = false;

        if incoming.relays <= self.relays
            && (self.addr != incoming.addr || self.relays != incoming.relays)
        {
            self.addr = incoming.addr;
            self.relays = incoming.relays;
            self.relay_id = if incoming.relays == 0 { None } else { relay_id };
            changed = true;
        }

        let before = self.direct_addrs.len();
        self.direct_addrs.extend(incoming.direct_addrs.iter().copied());
        changed |= self.direct_addrs.len() != before;

        if !incoming.name.is_empty() && self.name != incoming.name {
            self.name = incoming.name.clone();
            changed = true;
        }
        if incoming.virtual_ip.is_some() && self.virtual_ip != incoming.virtual_ip {
            if self.virtual_ip.is_some() {
                warn!(
                    "Virtual IP collision for peer {}: {:?} -> {:?}",
                    self.id, self.virtual_ip, incoming.virtual_ip
                );
            }
            self.virtual_ip = incoming.virtual_ip;
            changed = true;
        }
        if incoming.link_addr.is_some() && self.link_addr != incoming.link_addr {
            if self.link_addr.is_some() {
                warn!(
                    "Link address collision for peer {}: {:?} -> {:?}",
                    self.id, self.link_addr, incoming.link_addr
                );
            }
            self.link_addr = incoming.link_addr;
            changed = true;
        }

        changed
    }

    /// The gossiped projection of this record.
    #[must_use]
    pub fn announcement(&self) -> PeerAnnouncement {
        PeerAnnouncement {
            id: self.id,
            name: self.name.clone(),
            virtual_ip: self.virtual_ip,
            link_addr: self.link_addr,
            addr: self.addr,
            direct_addrs: self.direct_addrs.clone(),
            relays: self.relays,
        }
    }
}

/// Wire form of a peer record, carried by `Register`, `RegisterAck`,
/// `PeerAnnounce` and the peer-exchange payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    /// Peer identity.
    pub id: NodeId,
    /// Display name.
    pub name: String,
    /// Overlay IPv4 address.
    pub virtual_ip: Option<Ipv4Addr>,
    /// Link-layer address.
    pub link_addr: Option<MacAddr>,
    /// Address the sender reaches this peer at.
    pub addr: SocketAddr,
    /// Externally reachable candidates.
    pub direct_addrs: BTreeSet<SocketAddr>,
    /// Relay depth from the sender's point of view.
    pub relays: u8,
}

/// Concurrent peer directory with typed lookups and the link-address
/// fast path.
pub struct PeerDirectory {
    peers: DashMap<NodeId, PeerRecord>,
    // MacAddr -> (addr, id) for bridged-frame forwarding.
    link_map: DashMap<MacAddr, (SocketAddr, NodeId)>,
    events: EventBus,
}

impl PeerDirectory {
    /// Create an empty directory publishing to `events`.
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            peers: DashMap::new(),
            link_map: DashMap::new(),
            events,
        }
    }

    /// Insert a new peer.
    ///
    /// # Errors
    ///
    /// `CoreError::Protocol` when the id is already present (use
    /// [`PeerDirectory::merge`] for updates) or is the broadcast id.
    pub fn add(&self, record: PeerRecord) -> CoreResult<()> {
        if record.id.is_broadcast() {
            return Err(CoreError::Protocol("broadcast id is not a peer".into()));
        }
        if self.peers.contains_key(&record.id) {
            return Err(CoreError::Protocol(format!(
                "duplicate peer id {}",
                record.id
            )));
        }

        debug!(
            "Peer added: {} ({}) at {} relays={}",
            record.id, record.name, record.addr, record.relays
        );
        if let Some(mac) = record.link_addr {
            self.link_map.insert(mac, (record.addr, record.id));
        }
        self.peers.insert(record.id, record.clone());
        self.events.publish(Event::PeerAdded { peer: record });
        Ok(())
    }

    /// Merge a gossiped announcement into an existing record.
    ///
    /// Returns the updated record when anything changed, `None` when the
    /// peer is unknown or the announcement carried no news.
    pub fn merge(&self, incoming: &PeerAnnouncement, via: Option<NodeId>) -> Option<PeerRecord> {
        let mut entry = self.peers.get_mut(&incoming.id)?;
        if !entry.merge(incoming, via) {
            return None;
        }

        let updated = entry.clone();
        drop(entry);

        if let Some(mac) = updated.link_addr {
            self.link_map.insert(mac, (updated.addr, updated.id));
        }
        self.events.publish(Event::PeerChanged {
            peer: updated.clone(),
        });
        Some(updated)
    }

    /// Remove a peer and its link-map entries.
    pub fn remove(&self, id: NodeId) -> Option<PeerRecord> {
        let (_, record) = self.peers.remove(&id)?;
        self.link_map.retain(|_, (_, owner)| *owner != id);
        self.events.publish(Event::PeerRemoved { peer: id });
        Some(record)
    }

    /// Look up by identity.
    #[must_use]
    pub fn by_identity(&self, id: NodeId) -> Option<PeerRecord> {
        self.peers.get(&id).map(|r| r.clone())
    }

    /// Look up by display name (first match).
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<PeerRecord> {
        self.peers
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.clone())
    }

    /// Look up by current or candidate real address.
    #[must_use]
    pub fn by_address(&self, addr: SocketAddr) -> Option<PeerRecord> {
        self.peers
            .iter()
            .find(|r| r.addr == addr || r.direct_addrs.contains(&addr))
            .map(|r| r.clone())
    }

    /// Look up by overlay IPv4 address.
    #[must_use]
    pub fn by_virtual_ip(&self, ip: Ipv4Addr) -> Option<PeerRecord> {
        self.peers
            .iter()
            .find(|r| r.virtual_ip == Some(ip))
            .map(|r| r.clone())
    }

    /// Resolve a link-layer destination to its owning peer.
    #[must_use]
    pub fn by_link_addr(&self, mac: MacAddr) -> Option<(SocketAddr, NodeId)> {
        self.link_map.get(&mac).map(|e| *e.value())
    }

    /// All known peer identities.
    #[must_use]
    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|r| r.id).collect()
    }

    /// Gossip projection of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerAnnouncement> {
        self.peers.iter().map(|r| r.announcement()).collect()
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Record a successful liveness probe.
    pub fn record_rtt(&self, id: NodeId, rtt: Duration) {
        if let Some(mut r) = self.peers.get_mut(&id) {
            r.rtt = Some(rtt);
            r.timeouts = 0;
        }
    }

    /// Record a failed probe; returns the updated consecutive-failure
    /// count (0 when the peer is unknown).
    pub fn record_timeout(&self, id: NodeId) -> u32 {
        match self.peers.get_mut(&id) {
            Some(mut r) => {
                r.timeouts += 1;
                r.timeouts
            }
            None => 0,
        }
    }

    /// Promote a peer to a direct path at `addr` (hole-punch upgrade).
    ///
    /// Returns the updated record when the peer was previously relayed.
    pub fn promote_direct(&self, id: NodeId, addr: SocketAddr) -> Option<PeerRecord> {
        let mut entry = self.peers.get_mut(&id)?;
        if entry.relays == 0 && entry.addr == addr {
            return None;
        }
        entry.addr = addr;
        entry.relays = 0;
        entry.relay_id = None;
        let updated = entry.clone();
        drop(entry);

        if let Some(mac) = updated.link_addr {
            self.link_map.insert(mac, (updated.addr, updated.id));
        }
        self.events.publish(Event::PeerChanged {
            peer: updated.clone(),
        });
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 16])
    }

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    fn record(b: u8, port: u16) -> PeerRecord {
        PeerRecord::direct(id(b), format!("peer-{b}"), addr(port))
    }

    fn directory() -> PeerDirectory {
        PeerDirectory::new(EventBus::new())
    }

    #[test]
    fn test_add_and_lookups() {
        let dir = directory();
        let mut r = record(1, 1000);
        r.virtual_ip = Some(Ipv4Addr::new(10, 99, 0, 1));
        r.link_addr = Some(MacAddr([1, 2, 3, 4, 5, 6]));
        dir.add(r.clone()).unwrap();

        assert_eq!(dir.by_identity(id(1)).unwrap().name, "peer-1");
        assert_eq!(dir.by_name("peer-1").unwrap().id, id(1));
        assert_eq!(dir.by_address(addr(1000)).unwrap().id, id(1));
        assert_eq!(
            dir.by_virtual_ip(Ipv4Addr::new(10, 99, 0, 1)).unwrap().id,
            id(1)
        );
        assert_eq!(
            dir.by_link_addr(MacAddr([1, 2, 3, 4, 5, 6])).unwrap(),
            (addr(1000), id(1))
        );
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let dir = directory();
        dir.add(record(1, 1000)).unwrap();
        assert!(dir.add(record(1, 2000)).is_err());
    }

    #[test]
    fn test_broadcast_id_rejected() {
        let dir = directory();
        let r = PeerRecord::direct(NodeId::BROADCAST, "x".into(), addr(1));
        assert!(dir.add(r).is_err());
    }

    #[test]
    fn test_merge_monotonicity() {
        let dir = directory();
        dir.add(record(1, 1000)).unwrap();

        // A more indirect view must not move the address.
        let mut worse = record(1, 1000).announcement();
        worse.addr = addr(2000);
        worse.relays = 2;
        assert!(dir.merge(&worse, Some(id(9))).is_none());
        assert_eq!(dir.by_identity(id(1)).unwrap().addr, addr(1000));

        // An equally direct view with a new address does.
        let mut better = record(1, 1000).announcement();
        better.addr = addr(3000);
        better.relays = 0;
        assert!(dir.merge(&better, None).is_some());
        assert_eq!(dir.by_identity(id(1)).unwrap().addr, addr(3000));
    }

    #[test]
    fn test_merge_unions_direct_addrs() {
        let dir = directory();
        dir.add(record(1, 1000)).unwrap();

        let mut a = record(1, 1000).announcement();
        a.relays = 5; // address ignored, candidates still collected
        a.direct_addrs.insert(addr(7000));
        dir.merge(&a, Some(id(2)));

        let mut b = record(1, 1000).announcement();
        b.relays = 5;
        b.direct_addrs.insert(addr(8000));
        dir.merge(&b, Some(id(3)));

        let got = dir.by_identity(id(1)).unwrap();
        assert!(got.direct_addrs.contains(&addr(7000)));
        assert!(got.direct_addrs.contains(&addr(8000)));
    }

    #[test]
    fn test_merge_relayed_records_relay_id() {
        let dir = directory();
        let mut relayed = record(1, 1000);
        relayed.relays = 3;
        relayed.relay_id = Some(id(7));
        dir.add(relayed).unwrap();

        let mut closer = record(1, 1000).announcement();
        closer.addr = addr(4000);
        closer.relays = 1;
        let updated = dir.merge(&closer, Some(id(2))).unwrap();
        assert_eq!(updated.relays, 1);
        assert_eq!(updated.relay_id, Some(id(2)));
    }

    #[test]
    fn test_merge_unknown_peer_is_none() {
        let dir = directory();
        assert!(dir.merge(&record(1, 1000).announcement(), None).is_none());
    }

    #[test]
    fn test_remove_clears_link_map() {
        let dir = directory();
        let mut r = record(1, 1000);
        r.link_addr = Some(MacAddr([1; 6]));
        dir.add(r).unwrap();

        dir.remove(id(1)).unwrap();
        assert!(dir.by_identity(id(1)).is_none());
        assert!(dir.by_link_addr(MacAddr([1; 6])).is_none());
    }

    #[test]
    fn test_timeout_counters() {
        let dir = directory();
        dir.add(record(1, 1000)).unwrap();

        assert_eq!(dir.record_timeout(id(1)), 1);
        assert_eq!(dir.record_timeout(id(1)), 2);

        dir.record_rtt(id(1), Duration::from_millis(12));
        let r = dir.by_identity(id(1)).unwrap();
        assert_eq!(r.timeouts, 0);
        assert_eq!(r.rtt, Some(Duration::from_millis(12)));
        assert_eq!(dir.record_timeout(id(2)), 0);
    }

    #[test]
    fn test_promote_direct() {
        let dir = directory();
        let mut r = record(1, 1000);
        r.relays = 2;
        r.relay_id = Some(id(9));
        dir.add(r).unwrap();

        let updated = dir.promote_direct(id(1), addr(5000)).unwrap();
        assert_eq!(updated.relays, 0);
        assert_eq!(updated.relay_id, None);
        assert_eq!(updated.addr, addr(5000));

        // Already direct at that address: no-op.
        assert!(dir.promote_direct(id(1), addr(5000)).is_none());
    }
}
