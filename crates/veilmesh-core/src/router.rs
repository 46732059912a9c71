//! Packet routing, acknowledgements and relay.
//!
//! The router sits between the transport and every other component. On
//! the way out it frames, authenticates (cleartext trailer) or seals
//! (session cipher) packets and optionally awaits an acknowledgement; on
//! the way in it verifies, unseals and fans packets out to registered
//! handlers, forwards traffic addressed to other nodes, and answers ack
//! requests once every handler has succeeded.

use crate::error::{CoreError, CoreResult};
use crate::identity::NodeId;
use crate::packet::{Packet, PacketType, decode_inner, encode_inner};
use crate::session::SessionManager;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use veilmesh_crypto::{CLEAR_MAC_SIZE, CLEAR_NONCE_SIZE, NetworkSecret};
use veilmesh_transport::Transport;

const CLEAR_TRAILER: usize = CLEAR_NONCE_SIZE + CLEAR_MAC_SIZE;

/// Where an outgoing packet goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// A known peer, through its open session.
    Peer(NodeId),
    /// A raw address; only connection-establishment traffic may use this.
    Addr(SocketAddr),
    /// A specific node reached through a forwarding address. Used to
    /// handshake with peers only reachable through a relay; same
    /// cleartext-only restriction as `Addr`.
    Routed {
        /// Final destination identity.
        dst: NodeId,
        /// Address of the next hop.
        via: SocketAddr,
    },
}

/// Receives dispatched packets of a subscribed type.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Handle one packet. Returning an error suppresses the sender's
    /// requested acknowledgement.
    async fn handle(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        from: SocketAddr,
        src: NodeId,
    ) -> CoreResult<()>;
}

type HandlerTable = DashMap<PacketType, Vec<(u64, Arc<dyn PacketHandler>)>>;

/// Unsubscribes its handler when dropped.
pub struct HandlerGuard {
    handlers: Arc<HandlerTable>,
    packet_type: PacketType,
    id: u64,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.handlers.get_mut(&self.packet_type) {
            entry.retain(|(id, _)| *id != self.id);
        }
    }
}

/// The packet router.
pub struct Router {
    local_id: NodeId,
    transport: Arc<dyn Transport>,
    secret: NetworkSecret,
    sessions: Arc<SessionManager>,
    handlers: Arc<HandlerTable>,
    next_handler_id: AtomicU64,
    pending_acks: DashMap<u16, oneshot::Sender<()>>,
    next_ack_id: AtomicU16,
    ack_timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl Router {
    /// Create a router over `transport`.
    #[must_use]
    pub fn new(
        local_id: NodeId,
        transport: Arc<dyn Transport>,
        secret: NetworkSecret,
        sessions: Arc<SessionManager>,
        ack_timeout: Duration,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            local_id,
            transport,
            secret,
            sessions,
            handlers: Arc::new(DashMap::new()),
            next_handler_id: AtomicU64::new(1),
            pending_acks: DashMap::new(),
            next_ack_id: AtomicU16::new(1),
            ack_timeout,
            retry_attempts,
            retry_delay,
        }
    }

    /// This node's identity.
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Subscribe a handler to a packet type.
    ///
    /// Registering the same handler instance twice for one type yields a
    /// single subscription. The returned guard unsubscribes on drop.
    pub fn register_handler(
        &self,
        packet_type: PacketType,
        handler: Arc<dyn PacketHandler>,
    ) -> HandlerGuard {
        let mut entry = self.handlers.entry(packet_type).or_default();

        let id = entry
            .iter()
            .find(|(_, h)| Arc::ptr_eq(h, &handler))
            .map(|(id, _)| *id)
            .unwrap_or_else(|| {
                let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
                entry.push((id, handler));
                id
            });
        drop(entry);

        HandlerGuard {
            handlers: Arc::clone(&self.handlers),
            packet_type,
            id,
        }
    }

    fn allocate_ack_id(&self) -> u16 {
        // 0 means "no ack requested"; skip it on wrap.
        loop {
            let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a packet, optionally awaiting an acknowledgement.
    ///
    /// Peer destinations are sealed through the open session;
    /// address destinations are limited to connection-establishment
    /// types and go in cleartext with the network-secret trailer.
    ///
    /// # Errors
    ///
    /// `UnknownSession` when no open session exists for a peer
    /// destination, `UnknownDestination` for an illegal address send,
    /// `Timeout` when a requested acknowledgement does not arrive.
    pub async fn send(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        dest: Destination,
        want_ack: bool,
    ) -> CoreResult<()> {
        let (ack_id, ack_rx) = if want_ack {
            let id = self.allocate_ack_id();
            let (tx, rx) = oneshot::channel();
            self.pending_acks.insert(id, tx);
            (id, Some(rx))
        } else {
            (0, None)
        };

        let result = self.send_framed(packet_type, payload, dest, ack_id).await;
        if let Err(e) = result {
            self.pending_acks.remove(&ack_id);
            return Err(e);
        }

        let Some(rx) = ack_rx else {
            return Ok(());
        };

        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            // Timer fired, or the pending entry was dropped some other
            // way; a late ack now finds no entry and is a no-op.
            _ => {
                self.pending_acks.remove(&ack_id);
                Err(CoreError::Timeout(format!(
                    "no ack for {packet_type:?} (id {ack_id})"
                )))
            }
        }
    }

    async fn send_framed(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        dest: Destination,
        ack_id: u16,
    ) -> CoreResult<()> {
        match dest {
            Destination::Addr(addr) => {
                self.send_clear(packet_type, payload, NodeId::BROADCAST, addr, ack_id)
                    .await
            }
            Destination::Routed { dst, via } => {
                self.send_clear(packet_type, payload, dst, via, ack_id).await
            }
            Destination::Peer(peer) => {
                let addr = self
                    .sessions
                    .addr_of(peer)
                    .ok_or(CoreError::UnknownSession(peer))?;

                let mut packet = Packet::new(PacketType::Encoded, peer, self.local_id, Vec::new());
                packet.ack_id = ack_id;
                let aad = packet.header_bytes();

                let inner = encode_inner(packet_type, payload);
                let (counter, ciphertext) = self.sessions.seal(peer, &inner, &aad)?;

                let mut sealed = Vec::with_capacity(8 + ciphertext.len());
                sealed.extend_from_slice(&counter.to_be_bytes());
                sealed.extend_from_slice(&ciphertext);
                packet.payload = sealed;

                self.transport.send_to(&packet.encode(), addr).await?;
                Ok(())
            }
        }
    }

    async fn send_clear(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        dst: NodeId,
        addr: SocketAddr,
        ack_id: u16,
    ) -> CoreResult<()> {
        if !packet_type.is_clear() && packet_type != PacketType::Ack {
            return Err(CoreError::UnknownDestination(format!(
                "{packet_type:?} cannot be sent outside a session"
            )));
        }
        let mut packet = Packet::new(packet_type, dst, self.local_id, payload.to_vec());
        packet.ack_id = ack_id;

        let mut bytes = packet.encode();
        let trailer = self.secret.clear_tag(&bytes);
        bytes.extend_from_slice(&trailer);

        self.transport.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Send with acknowledgement and bounded retries.
    ///
    /// # Errors
    ///
    /// The last attempt's error once retries are exhausted; permanent
    /// errors are returned immediately.
    pub async fn send_with_retry(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        dest: Destination,
    ) -> CoreResult<()> {
        let mut attempt = 1;
        loop {
            match self.send(packet_type, payload, dest, true).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    debug!("Attempt {attempt} for {packet_type:?} failed: {e}; retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Process one received datagram.
    ///
    /// # Errors
    ///
    /// Protocol/authentication failures; callers log and drop.
    pub async fn dispatch(&self, data: &[u8], from: SocketAddr) -> CoreResult<()> {
        let packet = Packet::decode(data)?;

        if packet.dst != self.local_id && !packet.dst.is_broadcast() {
            return self.relay(data, packet.dst).await;
        }

        match packet.packet_type {
            PacketType::Encoded => {
                if packet.payload.len() < 8 {
                    return Err(CoreError::Protocol("sealed payload too short".into()));
                }
                let counter = u64::from_be_bytes(packet.payload[..8].try_into().expect("length"));
                let aad = packet.header_bytes();
                let inner = self
                    .sessions
                    .open_sealed(packet.src, counter, &packet.payload[8..], &aad)?;
                let (inner_type, inner_payload) = decode_inner(&inner)?;

                trace!("Sealed {inner_type:?} from {} at {from}", packet.src);
                self.deliver(inner_type, &inner_payload, from, packet.src, packet.ack_id, true)
                    .await
            }
            t if t.is_clear() || t == PacketType::Ack => {
                if packet.payload.len() < CLEAR_TRAILER {
                    return Err(CoreError::Protocol("missing cleartext trailer".into()));
                }
                let body_len = data.len() - CLEAR_TRAILER;
                let (body_payload, trailer) =
                    packet.payload.split_at(packet.payload.len() - CLEAR_TRAILER);
                if !self.secret.verify_clear_tag(&data[..body_len], trailer) {
                    return Err(CoreError::Protocol(format!(
                        "bad cleartext mac on {t:?} from {from}"
                    )));
                }

                trace!("Clear {t:?} from {} at {from}", packet.src);
                self.deliver(t, body_payload, from, packet.src, packet.ack_id, false)
                    .await
            }
            t => Err(CoreError::Protocol(format!(
                "{t:?} arrived outside a session"
            ))),
        }
    }

    /// Forward a packet addressed to another node through its session
    /// path, unmodified.
    async fn relay(&self, data: &[u8], dst: NodeId) -> CoreResult<()> {
        let addr = self.sessions.addr_of(dst).ok_or_else(|| {
            CoreError::UnknownDestination(format!("no path to relay target {dst}"))
        })?;
        trace!("Relaying {} bytes toward {dst} via {addr}", data.len());
        self.transport.send_to(data, addr).await?;
        Ok(())
    }

    async fn deliver(
        &self,
        packet_type: PacketType,
        payload: &[u8],
        from: SocketAddr,
        src: NodeId,
        ack_id: u16,
        sealed: bool,
    ) -> CoreResult<()> {
        if packet_type == PacketType::Ack {
            self.resolve_ack(payload);
            return Ok(());
        }

        let handlers: Vec<Arc<dyn PacketHandler>> = self
            .handlers
            .get(&packet_type)
            .map(|e| e.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("No handler for {packet_type:?} from {src}");
            return Ok(());
        }

        for handler in &handlers {
            handler.handle(packet_type, payload, from, src).await?;
        }

        // Every handler succeeded; answer the requested ack on the same
        // kind of path the packet arrived on. Clear acks carry the
        // sender's id so an intermediate relay can forward them back.
        if ack_id != 0 {
            let dest = if sealed && self.sessions.is_open(src) {
                Destination::Peer(src)
            } else if src.is_broadcast() {
                Destination::Addr(from)
            } else {
                Destination::Routed { dst: src, via: from }
            };
            self.send(PacketType::Ack, &ack_id.to_be_bytes(), dest, false)
                .await?;
        }
        Ok(())
    }

    fn resolve_ack(&self, payload: &[u8]) {
        let Ok(bytes) = <[u8; 2]>::try_from(payload) else {
            warn!("Malformed ack payload ({} bytes)", payload.len());
            return;
        };
        let id = u16::from_be_bytes(bytes);
        match self.pending_acks.remove(&id) {
            Some((_, tx)) => {
                // Receiver may have timed out between removal and now.
                let _ = tx.send(());
            }
            None => debug!("Late or unknown ack {id}"),
        }
    }
}
