//! Bootstrap address feed.
//!
//! Candidate `(ip, port)` pairs come from outside the crate (a tracker
//! client, a static list, manual entry) through an mpsc channel. Each
//! candidate that is not already owned by a known peer gets a greeted
//! contact attempt with bounded retries; the greet handler takes over
//! from there (handshake, then registration).

use crate::packet::PacketType;
use crate::peers::PeerDirectory;
use crate::router::{Destination, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Consumes bootstrap candidates and greets them.
pub struct Bootstrap {
    router: Arc<Router>,
    directory: Arc<PeerDirectory>,
}

impl Bootstrap {
    /// Create the bootstrap consumer.
    #[must_use]
    pub fn new(router: Arc<Router>, directory: Arc<PeerDirectory>) -> Self {
        Self { router, directory }
    }

    /// Drain the candidate channel until it closes or the task is
    /// aborted.
    pub async fn run(self, mut candidates: mpsc::Receiver<SocketAddr>) {
        while let Some(addr) = candidates.recv().await {
            self.contact(addr).await;
        }
    }

    /// Attempt contact with one candidate address.
    pub async fn contact(&self, addr: SocketAddr) {
        if let Some(peer) = self.directory.by_address(addr) {
            debug!("Skipping bootstrap candidate {addr}: already peer {}", peer.id);
            return;
        }

        info!("Greeting bootstrap candidate {addr}");
        if let Err(e) = self
            .router
            .send_with_retry(PacketType::Greet, &[], Destination::Addr(addr))
            .await
        {
            debug!("Bootstrap candidate {addr} unreachable: {e}");
        }
    }
}
