//! Node assembly.
//!
//! A [`Node`] wires the transport, router, session manager, peer
//! directory, pinger and bootstrap feed into one explicitly constructed
//! context: no globals, everything reachable from the struct. `start`
//! spawns the receive loop and the periodic tasks; `stop` tears them
//! down.

use crate::adapter::VirtualAdapter;
use crate::bootstrap::Bootstrap;
use crate::config::NetworkConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::identity::{MacAddr, NodeId};
use crate::packet::PacketType;
use crate::peers::{PeerAnnouncement, PeerDirectory, PeerRecord};
use crate::pinger::Pinger;
use crate::router::{Destination, HandlerGuard, PacketHandler, Router};
use crate::session::SessionManager;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use veilmesh_crypto::NetworkSecret;
use veilmesh_transport::Transport;

/// Queue depth of the bootstrap candidate channel.
const BOOTSTRAP_QUEUE: usize = 64;

/// Shared state reachable from every task and handler.
struct NodeInner {
    config: NetworkConfig,
    local_id: NodeId,
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionManager>,
    router: Arc<Router>,
    directory: Arc<PeerDirectory>,
    events: EventBus,
    adapter: Option<Arc<dyn VirtualAdapter>>,
}

impl NodeInner {
    /// This node's gossiped self-description.
    fn self_announcement(&self) -> PeerAnnouncement {
        let local_addr = self.transport.local_addr().ok();
        let link_addr = self
            .adapter
            .as_ref()
            .map(|a| a.mac())
            .or(self.config.link_addr);

        let mut direct_addrs = std::collections::BTreeSet::new();
        if let Some(addr) = local_addr {
            direct_addrs.insert(addr);
        }

        PeerAnnouncement {
            id: self.local_id,
            name: self.config.name.clone(),
            virtual_ip: self.config.virtual_ip,
            link_addr,
            // Peers prefer the address they observed; this is a fallback.
            addr: local_addr.unwrap_or_else(|| "0.0.0.0:0".parse().expect("static addr")),
            direct_addrs,
            relays: 0,
        }
    }

    /// Relay depth to `peer`, 0 when unknown.
    fn depth_of(&self, peer: NodeId) -> u8 {
        self.sessions
            .relays_of(peer)
            .or_else(|| self.directory.by_identity(peer).map(|r| r.relays))
            .unwrap_or(0)
    }

    /// Rewrite an announcement received from `src` into this node's
    /// frame of reference: the path runs through `src`, one hop deeper.
    fn viewed_through(
        &self,
        ann: &PeerAnnouncement,
        src: NodeId,
        from: SocketAddr,
    ) -> PeerAnnouncement {
        let via_addr = self.sessions.addr_of(src).unwrap_or(from);
        let depth = self
            .depth_of(src)
            .saturating_add(ann.relays)
            .saturating_add(1);

        let mut direct_addrs = ann.direct_addrs.clone();
        direct_addrs.insert(ann.addr);

        PeerAnnouncement {
            id: ann.id,
            name: ann.name.clone(),
            virtual_ip: ann.virtual_ip,
            link_addr: ann.link_addr,
            addr: via_addr,
            direct_addrs,
            relays: depth,
        }
    }

    /// Upsert the peer that `src` described about itself.
    fn apply_self_description(&self, ann: &PeerAnnouncement, src: NodeId, from: SocketAddr) {
        if ann.id != src {
            warn!("Peer {src} described itself with mismatching id {}", ann.id);
            return;
        }

        let addr = self.sessions.addr_of(src).unwrap_or(from);
        let relays = self.sessions.relays_of(src).unwrap_or(0);

        if self.directory.by_identity(src).is_some() {
            let mut viewed = ann.clone();
            viewed.addr = addr;
            viewed.relays = relays;
            viewed.direct_addrs.insert(ann.addr);
            self.directory.merge(&viewed, None);
            return;
        }

        let mut record = PeerRecord::direct(src, ann.name.clone(), addr);
        record.virtual_ip = ann.virtual_ip;
        record.link_addr = ann.link_addr;
        record.relays = relays;
        record.direct_addrs = ann.direct_addrs.clone();
        record.direct_addrs.insert(ann.addr);
        if let Err(e) = self.directory.add(record) {
            debug!("Registration race for {src}: {e}");
        }
    }

    /// Seal and send one packet to `peer`, renegotiating the session
    /// key when its counter nears exhaustion. Every sealed packet type
    /// goes through here so a session carrying only control traffic
    /// still rekeys.
    async fn send_sealed(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        peer: NodeId,
    ) -> CoreResult<()> {
        let result = self
            .router
            .send(packet_type, payload, Destination::Peer(peer), false)
            .await;

        if self.sessions.needs_rekey(peer) {
            info!("Rekeying session with {peer}");
            let addr = self.sessions.addr_of(peer);
            let depth = self.depth_of(peer);
            self.sessions.reset_for_rekey(peer);
            if let Some(addr) = addr {
                self.contact_relayed(peer, addr, depth).await;
            }
        }
        result
    }

    /// Gossip one record to every connected peer except `except`. The
    /// announcement carries this node's own view; receivers add their
    /// distance to us.
    async fn announce_to_peers(&self, ann: &PeerAnnouncement, except: NodeId) {
        let payload = match bincode::serialize(ann) {
            Ok(p) => p,
            Err(e) => {
                warn!("Announcement encoding failed: {e}");
                return;
            }
        };

        for peer in self.directory.ids() {
            if peer == except || peer == ann.id || !self.sessions.is_open(peer) {
                continue;
            }
            if let Err(e) = self.send_sealed(PacketType::PeerAnnounce, &payload, peer).await {
                debug!("Announce to {peer} failed: {e}");
            }
        }
    }

    /// Start a handshake toward a peer we only know through gossip.
    async fn contact_relayed(&self, peer: NodeId, via: SocketAddr, depth: u8) {
        let Some(hs1) = self.sessions.initiate(peer, via, depth) else {
            return;
        };
        if let Err(e) = self
            .router
            .send(
                PacketType::Handshake1,
                &hs1,
                Destination::Routed { dst: peer, via },
                false,
            )
            .await
        {
            debug!("Handshake toward {peer} via {via} failed to send: {e}");
        }
    }

    /// Seal and send one adapter frame to `peer`.
    async fn send_frame(&self, peer: NodeId, frame: &[u8]) {
        if let Err(e) = self.send_sealed(PacketType::Data, frame, peer).await {
            trace!("Frame to {peer} dropped: {e}");
        }
    }

    /// Route one frame read from the adapter.
    async fn route_adapter_frame(&self, frame: &[u8]) {
        if frame.len() < 14 {
            return;
        }
        let dst_mac = MacAddr(frame[..6].try_into().expect("length"));

        if dst_mac.is_multicast() {
            for peer in self.directory.ids() {
                if self.sessions.is_open(peer) {
                    self.send_frame(peer, frame).await;
                }
            }
            return;
        }

        if let Some((_, peer)) = self.directory.by_link_addr(dst_mac) {
            self.send_frame(peer, frame).await;
            return;
        }

        // Routed mode fallback: resolve IPv4 destinations through the
        // overlay address.
        if frame[12..14] == [0x08, 0x00] && frame.len() >= 34 {
            let ip = std::net::Ipv4Addr::new(frame[30], frame[31], frame[32], frame[33]);
            if let Some(peer) = self.directory.by_virtual_ip(ip) {
                self.send_frame(peer.id, frame).await;
                return;
            }
        }

        trace!("No route for adapter frame to {dst_mac}");
    }
}

/// Reacts to control-plane packets. One instance handles every
/// subscribed type.
struct ControlPlane {
    inner: Arc<NodeInner>,
}

#[async_trait]
impl PacketHandler for ControlPlane {
    async fn handle(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        from: SocketAddr,
        src: NodeId,
    ) -> CoreResult<()> {
        let inner = &self.inner;
        match packet_type {
            PacketType::Greet => {
                match inner.sessions.relays_of(src) {
                    None => {
                        // Unknown sender: open a session toward the
                        // observed address.
                        if let Some(hs1) = inner.sessions.initiate(src, from, 0) {
                            inner
                                .router
                                .send(
                                    PacketType::Handshake1,
                                    &hs1,
                                    Destination::Routed { dst: src, via: from },
                                    false,
                                )
                                .await?;
                        }
                    }
                    Some(depth) if depth > 0 => {
                        // A relayed peer reached us directly: upgrade the
                        // path and greet back so both sides converge.
                        info!("Hole punch from {src}: promoting to direct at {from}");
                        inner.sessions.update_addr(src, from, 0);
                        inner.directory.promote_direct(src, from);
                        inner
                            .router
                            .send(
                                PacketType::Greet,
                                &[],
                                Destination::Routed { dst: src, via: from },
                                false,
                            )
                            .await?;
                    }
                    Some(_) => trace!("Greet from already-direct peer {src}"),
                }
                Ok(())
            }
            PacketType::Handshake1 => {
                let depth = inner.depth_of(src);
                if let Some(hs2) = inner.sessions.handle_handshake1(src, from, payload, depth)? {
                    inner
                        .router
                        .send(
                            PacketType::Handshake2,
                            &hs2,
                            Destination::Routed { dst: src, via: from },
                            false,
                        )
                        .await?;
                }
                Ok(())
            }
            PacketType::Handshake2 => {
                let hs3 = inner.sessions.handle_handshake2(src, from, payload)?;
                inner
                    .router
                    .send(
                        PacketType::Handshake3,
                        &hs3,
                        Destination::Routed { dst: src, via: from },
                        false,
                    )
                    .await?;
                Ok(())
            }
            PacketType::Handshake3 => inner.sessions.handle_handshake3(src, payload),
            PacketType::Register | PacketType::RegisterAck => {
                let ann: PeerAnnouncement = bincode::deserialize(payload)?;
                inner.apply_self_description(&ann, src, from);

                if packet_type == PacketType::Register {
                    let reply = bincode::serialize(&inner.self_announcement())
                        .map_err(CoreError::from)?;
                    if inner.sessions.is_open(src) {
                        inner.send_sealed(PacketType::RegisterAck, &reply, src).await?;
                    } else {
                        inner
                            .router
                            .send(
                                PacketType::RegisterAck,
                                &reply,
                                Destination::Routed { dst: src, via: from },
                                false,
                            )
                            .await?;
                    }
                }
                Ok(())
            }
            PacketType::PeerExchange | PacketType::PeerExchangeAck => {
                let table: Vec<PeerAnnouncement> = bincode::deserialize(payload)?;
                for ann in &table {
                    self.merge_gossip(ann, src, from).await;
                }

                if packet_type == PacketType::PeerExchange {
                    let reply =
                        bincode::serialize(&inner.directory.snapshot()).map_err(CoreError::from)?;
                    inner.send_sealed(PacketType::PeerExchangeAck, &reply, src).await?;
                }
                Ok(())
            }
            PacketType::PeerAnnounce => {
                let ann: PeerAnnouncement = bincode::deserialize(payload)?;
                self.merge_gossip(&ann, src, from).await;
                Ok(())
            }
            // The ack machinery answers; nothing to do here.
            PacketType::Ping => Ok(()),
            PacketType::Data => {
                if let Some(adapter) = &inner.adapter {
                    adapter.write_frame(payload).await?;
                }
                Ok(())
            }
            PacketType::ChatMsg => {
                let text = String::from_utf8_lossy(payload).into_owned();
                inner.events.publish(Event::ChatMessage { from: src, text });
                Ok(())
            }
            t => {
                debug!("Unexpected {t:?} in control plane");
                Ok(())
            }
        }
    }
}

impl ControlPlane {
    /// Merge one gossiped record; unknown peers are added and contacted
    /// through the gossip source.
    async fn merge_gossip(&self, ann: &PeerAnnouncement, src: NodeId, from: SocketAddr) {
        let inner = &self.inner;
        if ann.id == inner.local_id {
            return;
        }
        if ann.id == src {
            inner.apply_self_description(ann, src, from);
            return;
        }

        let viewed = inner.viewed_through(ann, src, from);
        if inner.directory.by_identity(ann.id).is_some() {
            inner.directory.merge(&viewed, Some(src));
            return;
        }

        let mut record = PeerRecord::direct(viewed.id, viewed.name.clone(), viewed.addr);
        record.virtual_ip = viewed.virtual_ip;
        record.link_addr = viewed.link_addr;
        record.direct_addrs = viewed.direct_addrs.clone();
        record.relays = viewed.relays;
        record.relay_id = Some(src);
        if let Err(e) = inner.directory.add(record) {
            debug!("Gossip race for {}: {e}", ann.id);
            return;
        }

        // Establish our own session so relayed traffic stays end-to-end
        // encrypted.
        inner.contact_relayed(viewed.id, viewed.addr, viewed.relays).await;
    }
}

/// One overlay node.
pub struct Node {
    inner: Arc<NodeInner>,
    running: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    guards: std::sync::Mutex<Vec<HandlerGuard>>,
    bootstrap_tx: mpsc::Sender<SocketAddr>,
    bootstrap_rx: std::sync::Mutex<Option<mpsc::Receiver<SocketAddr>>>,
}

impl Node {
    /// Build a node over `transport`.
    ///
    /// # Errors
    ///
    /// `CoreError::Crypto` when the network secret cannot be derived
    /// from the configured passphrase. This is the one fatal startup
    /// failure.
    pub fn new(
        config: NetworkConfig,
        transport: Arc<dyn Transport>,
        adapter: Option<Arc<dyn VirtualAdapter>>,
    ) -> CoreResult<Self> {
        let secret = NetworkSecret::derive(config.passphrase.as_bytes())?;
        let local_id = NodeId::random();
        let events = EventBus::new();

        let sessions = Arc::new(SessionManager::new(
            local_id,
            secret.clone(),
            events.clone(),
            config.handshake_timeout,
            config.rekey_after,
        ));
        let router = Arc::new(Router::new(
            local_id,
            Arc::clone(&transport),
            secret,
            Arc::clone(&sessions),
            config.ack_timeout,
            config.retry_attempts,
            config.retry_delay,
        ));
        let directory = Arc::new(PeerDirectory::new(events.clone()));

        let (bootstrap_tx, bootstrap_rx) = mpsc::channel(BOOTSTRAP_QUEUE);

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                local_id,
                transport,
                sessions,
                router,
                directory,
                events,
                adapter,
            }),
            running: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
            guards: std::sync::Mutex::new(Vec::new()),
            bootstrap_tx,
            bootstrap_rx: std::sync::Mutex::new(Some(bootstrap_rx)),
        })
    }

    /// This node's identity.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.inner.local_id
    }

    /// The transport's bound address.
    ///
    /// # Errors
    ///
    /// Propagates the transport's address lookup failure.
    pub fn local_addr(&self) -> CoreResult<SocketAddr> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Event bus handle.
    #[must_use]
    pub fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// Peer directory handle.
    #[must_use]
    pub fn directory(&self) -> Arc<PeerDirectory> {
        Arc::clone(&self.inner.directory)
    }

    /// Feed for bootstrap candidate addresses.
    #[must_use]
    pub fn bootstrap_sender(&self) -> mpsc::Sender<SocketAddr> {
        self.bootstrap_tx.clone()
    }

    /// Send a chat message to a connected peer.
    ///
    /// # Errors
    ///
    /// `UnknownSession` when no session is open with `peer`.
    pub async fn send_chat(&self, peer: NodeId, text: &str) -> CoreResult<()> {
        self.inner
            .send_sealed(PacketType::ChatMsg, text.as_bytes(), peer)
            .await
    }

    /// Start the node: adapter, receive loop, pinger, gossip and
    /// bootstrap tasks.
    ///
    /// # Errors
    ///
    /// Adapter start/configure failures.
    pub async fn start(&self) -> CoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            "Starting node {} ({})",
            self.inner.local_id, self.inner.config.name
        );

        if let Some(adapter) = &self.inner.adapter {
            adapter.start().await?;
            if let Some(ip) = self.inner.config.virtual_ip {
                adapter
                    .configure(ip, std::net::Ipv4Addr::new(255, 255, 255, 0))
                    .await?;
            }
            adapter.up().await?;
        }

        self.register_handlers();

        let mut tasks = Vec::new();
        tasks.push(self.spawn_recv_loop());
        tasks.push(self.spawn_event_loop());
        tasks.push(self.spawn_exchange_loop());
        tasks.push(self.spawn_pinger());
        tasks.push(self.spawn_bootstrap());
        if self.inner.adapter.is_some() {
            tasks.push(self.spawn_adapter_loop());
        }
        self.tasks.lock().expect("lock poisoned").extend(tasks);
        Ok(())
    }

    /// Stop the node and release its tasks, handlers and transport.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping node {}", self.inner.local_id);

        for task in self.tasks.lock().expect("lock poisoned").drain(..) {
            task.abort();
        }
        self.guards.lock().expect("lock poisoned").clear();

        if let Some(adapter) = &self.inner.adapter {
            let _ = adapter.down().await;
            let _ = adapter.stop().await;
        }
        let _ = self.inner.transport.close().await;
    }

    fn register_handlers(&self) {
        let control: Arc<dyn PacketHandler> = Arc::new(ControlPlane {
            inner: Arc::clone(&self.inner),
        });
        let types = [
            PacketType::Greet,
            PacketType::Handshake1,
            PacketType::Handshake2,
            PacketType::Handshake3,
            PacketType::Register,
            PacketType::RegisterAck,
            PacketType::PeerExchange,
            PacketType::PeerExchangeAck,
            PacketType::PeerAnnounce,
            PacketType::Ping,
            PacketType::Data,
            PacketType::ChatMsg,
        ];

        let mut guards = self.guards.lock().expect("lock poisoned");
        for t in types {
            guards.push(self.inner.router.register_handler(t, Arc::clone(&control)));
        }
    }

    fn spawn_recv_loop(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match inner.transport.recv_from(&mut buf).await {
                    Ok((size, from)) => {
                        if let Err(e) = inner.router.dispatch(&buf[..size], from).await {
                            debug!("Dropped packet from {from}: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("Receive loop ended: {e}");
                        return;
                    }
                }
            }
        })
    }

    /// Reacts to lifecycle events: registration after a session opens,
    /// gossip when the directory changes.
    fn spawn_event_loop(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut events = inner.events.subscribe();
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event loop lagged by {n} events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };

                match event {
                    Event::SessionOpened { peer, .. } => {
                        let Ok(payload) = bincode::serialize(&inner.self_announcement()) else {
                            continue;
                        };
                        if let Err(e) = inner
                            .router
                            .send_with_retry(
                                PacketType::Register,
                                &payload,
                                Destination::Peer(peer),
                            )
                            .await
                        {
                            debug!("Registration with {peer} failed: {e}");
                        }
                    }
                    Event::PeerAdded { peer } => {
                        inner.announce_to_peers(&peer.announcement(), peer.id).await;

                        // Pull the newcomer's view of the mesh.
                        if inner.sessions.is_open(peer.id) {
                            let Ok(payload) = bincode::serialize(&inner.directory.snapshot())
                            else {
                                continue;
                            };
                            if let Err(e) = inner
                                .send_sealed(PacketType::PeerExchange, &payload, peer.id)
                                .await
                            {
                                debug!("Peer exchange with {} failed: {e}", peer.id);
                            }
                        }
                    }
                    Event::PeerChanged { peer } => {
                        inner.announce_to_peers(&peer.announcement(), peer.id).await;
                    }
                    _ => {}
                }
            }
        })
    }

    /// Periodic full-table exchange plus hole-punch greets toward the
    /// direct-address candidates of relayed peers.
    fn spawn_exchange_loop(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.peer_exchange_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly
            // started nodes exchange only after bootstrap had a chance.
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let snapshot = match bincode::serialize(&inner.directory.snapshot()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("Snapshot encoding failed: {e}");
                        continue;
                    }
                };

                for peer in inner.directory.ids() {
                    if !inner.sessions.is_open(peer) {
                        continue;
                    }
                    if let Err(e) = inner
                        .send_sealed(PacketType::PeerExchange, &snapshot, peer)
                        .await
                    {
                        debug!("Periodic exchange with {peer} failed: {e}");
                    }

                    // Try to shorten relayed paths.
                    if let Some(record) = inner.directory.by_identity(peer) {
                        if record.relays > 0 {
                            for addr in &record.direct_addrs {
                                let _ = inner
                                    .router
                                    .send(
                                        PacketType::Greet,
                                        &[],
                                        Destination::Addr(*addr),
                                        false,
                                    )
                                    .await;
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_pinger(&self) -> JoinHandle<()> {
        let pinger = Arc::new(Pinger::new(
            Arc::clone(&self.inner.router),
            Arc::clone(&self.inner.sessions),
            Arc::clone(&self.inner.directory),
            self.inner.config.ping_interval,
            self.inner.config.max_timeouts,
        ));
        tokio::spawn(pinger.run())
    }

    fn spawn_bootstrap(&self) -> JoinHandle<()> {
        let bootstrap = Bootstrap::new(
            Arc::clone(&self.inner.router),
            Arc::clone(&self.inner.directory),
        );
        let rx = self
            .bootstrap_rx
            .lock()
            .expect("lock poisoned")
            .take()
            .unwrap_or_else(|| {
                // start() after stop(): the feed was consumed; recreate a
                // detached receiver that never yields.
                let (_tx, rx) = mpsc::channel(1);
                rx
            });
        tokio::spawn(bootstrap.run(rx))
    }

    fn spawn_adapter_loop(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let Some(adapter) = inner.adapter.clone() else {
                return;
            };
            loop {
                match adapter.read_frame().await {
                    Ok(frame) => inner.route_adapter_frame(&frame).await,
                    Err(e) => {
                        warn!("Adapter read loop ended: {e}");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ChannelAdapter;
    use std::time::Duration;
    use veilmesh_transport::UdpTransport;

    async fn spawn_test_node(
        name: &str,
        passphrase: &str,
        adapter: Option<Arc<dyn VirtualAdapter>>,
    ) -> Node {
        let transport: Arc<dyn Transport> = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
                .await
                .unwrap(),
        );
        let config = NetworkConfig {
            name: name.to_string(),
            passphrase: passphrase.to_string(),
            ping_interval: Duration::from_millis(200),
            ack_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(50),
            peer_exchange_interval: Duration::from_millis(300),
            ..NetworkConfig::default()
        };
        let node = Node::new(config, transport, adapter).unwrap();
        node.start().await.unwrap();
        node
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_two_nodes_discover_each_other() {
        let a = spawn_test_node("a", "net", None).await;
        let b = spawn_test_node("b", "net", None).await;

        a.bootstrap_sender()
            .send(b.local_addr().unwrap())
            .await
            .unwrap();

        wait_for(|| {
            a.directory().by_identity(b.id()).is_some()
                && b.directory().by_identity(a.id()).is_some()
        })
        .await;

        let record = a.directory().by_identity(b.id()).unwrap();
        assert_eq!(record.name, "b");
        assert_eq!(record.relays, 0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_mismatched_passphrases_never_connect() {
        let a = spawn_test_node("a", "net-one", None).await;
        let b = spawn_test_node("b", "net-two", None).await;

        a.bootstrap_sender()
            .send(b.local_addr().unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(a.directory().by_identity(b.id()).is_none());
        assert!(b.directory().by_identity(a.id()).is_none());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_chat_roundtrip() {
        let a = spawn_test_node("a", "net", None).await;
        let b = spawn_test_node("b", "net", None).await;
        let mut b_events = b.events().subscribe();

        a.bootstrap_sender()
            .send(b.local_addr().unwrap())
            .await
            .unwrap();
        wait_for(|| b.directory().by_identity(a.id()).is_some()).await;

        a.send_chat(b.id(), "hello mesh").await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Event::ChatMessage { from, text }) = b_events.recv().await {
                    return (from, text);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, (a.id(), "hello mesh".to_string()));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_adapter_frames_cross_the_overlay() {
        let mac_a = MacAddr([0x02, 0, 0, 0, 0, 0xA]);
        let mac_b = MacAddr([0x02, 0, 0, 0, 0, 0xB]);
        let (adapter_a, _written_a) = ChannelAdapter::new(mac_a, None);
        let (adapter_b, mut written_b) = ChannelAdapter::new(mac_b, None);
        let adapter_a = Arc::new(adapter_a);
        let adapter_b = Arc::new(adapter_b);

        let a = spawn_test_node("a", "net", Some(adapter_a.clone() as _)).await;
        let b = spawn_test_node("b", "net", Some(adapter_b as _)).await;

        a.bootstrap_sender()
            .send(b.local_addr().unwrap())
            .await
            .unwrap();
        wait_for(|| {
            a.directory()
                .by_identity(b.id())
                .is_some_and(|r| r.link_addr == Some(mac_b))
        })
        .await;

        // Ethernet frame addressed to b's adapter.
        let mut frame = Vec::new();
        frame.extend_from_slice(&mac_b.0);
        frame.extend_from_slice(&mac_a.0);
        frame.extend_from_slice(&[0x08, 0x06]); // ARP, routing is by MAC
        frame.extend_from_slice(b"frame body");
        adapter_a.inject(frame.clone()).await.unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(5), written_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, frame);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_chat_only_session_rekeys() {
        async fn spawn_short_rekey(name: &str) -> Node {
            let transport: Arc<dyn Transport> = Arc::new(
                UdpTransport::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
                    .await
                    .unwrap(),
            );
            let config = NetworkConfig {
                name: name.to_string(),
                passphrase: "net".to_string(),
                rekey_after: 3,
                // Keep the periodic tasks quiet so chat is the only
                // sealed traffic after discovery.
                ping_interval: Duration::from_secs(60),
                peer_exchange_interval: Duration::from_secs(60),
                ack_timeout: Duration::from_millis(200),
                retry_delay: Duration::from_millis(50),
                ..NetworkConfig::default()
            };
            let node = Node::new(config, transport, None).unwrap();
            node.start().await.unwrap();
            node
        }

        let a = spawn_short_rekey("a").await;
        let b = spawn_short_rekey("b").await;

        a.bootstrap_sender()
            .send(b.local_addr().unwrap())
            .await
            .unwrap();
        wait_for(|| {
            a.directory().by_identity(b.id()).is_some()
                && b.directory().by_identity(a.id()).is_some()
        })
        .await;

        // Drive sealed control traffic only; the counter threshold must
        // trigger a renegotiation even though no data frame ever flows.
        let mut a_events = a.events().subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                // Sends during the re-handshake window fail; keep going.
                let _ = a.send_chat(b.id(), "tick").await;
                if let Ok(Event::SessionOpened { peer, .. }) = a_events.try_recv() {
                    if peer == b.id() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session never rekeyed");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let a = spawn_test_node("a", "net", None).await;
        a.stop().await;
        a.stop().await;
    }
}
