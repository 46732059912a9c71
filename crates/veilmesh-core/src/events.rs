//! Node event bus.
//!
//! A `tokio::sync::broadcast` channel carrying lifecycle notifications to
//! any number of observers (tests, UI layers, the node's own gossip
//! reactions). Publishing never blocks; lagging subscribers lose old
//! events rather than stalling dispatch.

use crate::identity::NodeId;
use crate::peers::PeerRecord;
use std::net::SocketAddr;
use tokio::sync::broadcast;

/// Capacity of the broadcast ring.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle events emitted by the node.
#[derive(Debug, Clone)]
pub enum Event {
    /// A handshake completed and an encrypted session is usable.
    SessionOpened {
        /// Peer the session was established with.
        peer: NodeId,
        /// Relay depth of the session path (0 = direct).
        relays: u8,
        /// Address the session currently targets.
        addr: SocketAddr,
    },
    /// A session was closed and its state purged.
    SessionClosed {
        /// Peer whose session closed.
        peer: NodeId,
    },
    /// A previously unknown peer entered the directory.
    PeerAdded {
        /// The new record.
        peer: PeerRecord,
    },
    /// An existing peer record materially changed.
    PeerChanged {
        /// The updated record.
        peer: PeerRecord,
    },
    /// A peer was evicted from the directory.
    PeerRemoved {
        /// Identity of the removed peer.
        peer: NodeId,
    },
    /// A chat message arrived over the overlay.
    ChatMessage {
        /// Sending peer.
        from: NodeId,
        /// Message text.
        text: String,
    },
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: Event) {
        // Err means no subscriber is listening, which is fine.
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
