//! Periodic liveness probing.
//!
//! Every interval, each known peer gets an acked `Ping` with a bounded
//! wait. Success records the round-trip time and clears the failure
//! counter; failure increments it, and a peer past the configured
//! threshold is evicted (session closed, directory entry removed).
//! Probes run as fire-and-forget tasks so a slow peer never stalls
//! dispatch or the probing of other peers.

use crate::identity::NodeId;
use crate::packet::PacketType;
use crate::peers::PeerDirectory;
use crate::router::{Destination, Router};
use crate::session::SessionManager;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Drives the probe loop.
pub struct Pinger {
    router: Arc<Router>,
    sessions: Arc<SessionManager>,
    directory: Arc<PeerDirectory>,
    interval: Duration,
    max_timeouts: u32,
}

impl Pinger {
    /// Create a pinger.
    #[must_use]
    pub fn new(
        router: Arc<Router>,
        sessions: Arc<SessionManager>,
        directory: Arc<PeerDirectory>,
        interval: Duration,
        max_timeouts: u32,
    ) -> Self {
        Self {
            router,
            sessions,
            directory,
            interval,
            max_timeouts,
        }
    }

    /// Run until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for peer in self.directory.ids() {
                let pinger = Arc::clone(&self);
                tokio::spawn(async move {
                    pinger.probe(peer).await;
                });
            }
        }
    }

    /// Probe one peer once.
    pub async fn probe(&self, peer: NodeId) {
        if !self.sessions.is_open(peer) {
            return;
        }

        let started = Instant::now();
        match self
            .router
            .send(PacketType::Ping, &[], Destination::Peer(peer), true)
            .await
        {
            Ok(()) => {
                self.directory.record_rtt(peer, started.elapsed());
            }
            Err(e) => {
                let failures = self.directory.record_timeout(peer);
                debug!("Ping to {peer} failed ({failures} consecutive): {e}");
                if failures > self.max_timeouts {
                    info!("Evicting unresponsive peer {peer}");
                    self.sessions.close(peer);
                    self.directory.remove(peer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::peers::PeerRecord;
    use std::net::SocketAddr;
    use veilmesh_crypto::NetworkSecret;
    use veilmesh_transport::{Transport, UdpTransport};

    async fn harness() -> (Arc<Pinger>, Arc<SessionManager>, Arc<PeerDirectory>, NodeId) {
        let id = NodeId::from_bytes([1; 16]);
        let secret = NetworkSecret::derive(b"net").unwrap();
        let transport: Arc<dyn Transport> = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
                .await
                .unwrap(),
        );
        let events = EventBus::new();
        let sessions = Arc::new(SessionManager::new(
            id,
            secret.clone(),
            events.clone(),
            Duration::from_secs(3),
            1_000_000,
        ));
        let router = Arc::new(Router::new(
            id,
            transport,
            secret,
            Arc::clone(&sessions),
            Duration::from_millis(50),
            1,
            Duration::from_millis(10),
        ));
        let directory = Arc::new(PeerDirectory::new(events));
        let pinger = Arc::new(Pinger::new(
            router,
            Arc::clone(&sessions),
            Arc::clone(&directory),
            Duration::from_millis(100),
            2,
        ));
        (pinger, sessions, directory, id)
    }

    fn open_session_with(sessions: &Arc<SessionManager>, local: NodeId, peer: NodeId) {
        // Complete a real exchange against a scratch manager so the
        // session table holds an open entry for `peer`.
        let secret = NetworkSecret::derive(b"net").unwrap();
        let other = Arc::new(SessionManager::new(
            peer,
            secret,
            EventBus::new(),
            Duration::from_secs(3),
            1_000_000,
        ));
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let hs1 = sessions.initiate(peer, addr, 0).unwrap();
        let hs2 = other
            .handle_handshake1(local, addr, &hs1, 0)
            .unwrap()
            .unwrap();
        let _hs3 = sessions.handle_handshake2(peer, addr, &hs2).unwrap();
    }

    #[tokio::test]
    async fn test_probe_skips_sessionless_peers() {
        let (pinger, _sessions, directory, _id) = harness().await;
        let peer = NodeId::from_bytes([2; 16]);
        directory
            .add(PeerRecord::direct(
                peer,
                "p".into(),
                "127.0.0.1:9".parse().unwrap(),
            ))
            .unwrap();

        pinger.probe(peer).await;
        // No session: no probe, no timeout recorded.
        assert_eq!(directory.by_identity(peer).unwrap().timeouts, 0);
    }

    #[tokio::test]
    async fn test_eviction_after_repeated_failures() {
        let (pinger, sessions, directory, id) = harness().await;
        let peer = NodeId::from_bytes([2; 16]);
        directory
            .add(PeerRecord::direct(
                peer,
                "p".into(),
                "127.0.0.1:9".parse().unwrap(),
            ))
            .unwrap();
        // Session targets a dead address, so every probe times out.
        open_session_with(&sessions, id, peer);

        // max_timeouts = 2: third failure evicts.
        pinger.probe(peer).await;
        pinger.probe(peer).await;
        assert!(directory.by_identity(peer).is_some());

        pinger.probe(peer).await;
        assert!(directory.by_identity(peer).is_none());
        assert!(!sessions.is_open(peer));
    }

    #[tokio::test]
    async fn test_failure_counter_resets_are_visible() {
        let (pinger, sessions, directory, id) = harness().await;
        let peer = NodeId::from_bytes([2; 16]);
        directory
            .add(PeerRecord::direct(
                peer,
                "p".into(),
                "127.0.0.1:9".parse().unwrap(),
            ))
            .unwrap();
        open_session_with(&sessions, id, peer);

        pinger.probe(peer).await;
        assert_eq!(directory.by_identity(peer).unwrap().timeouts, 1);

        // A successful exchange elsewhere resets the counter.
        directory.record_rtt(peer, Duration::from_millis(5));
        assert_eq!(directory.by_identity(peer).unwrap().timeouts, 0);
    }
}
