//! # veilmesh-core
//!
//! Router and session layer of the veilmesh overlay. This crate owns the
//! wire format, the per-peer encrypted session lifecycle, the gossiped
//! peer directory, ack/retry delivery, multi-hop relay and the liveness
//! prober, and assembles them into a [`Node`].
//!
//! Everything outside the overlay itself — tun/tap drivers, trackers,
//! settings, UI — is consumed through narrow seams: the
//! [`VirtualAdapter`] trait, a bootstrap address channel and a
//! [`NetworkConfig`] struct.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod adapter;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod node;
pub mod packet;
pub mod peers;
pub mod pinger;
pub mod router;
pub mod session;

pub use adapter::{ChannelAdapter, VirtualAdapter};
pub use config::NetworkConfig;
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBus};
pub use identity::{MacAddr, NodeId};
pub use node::Node;
pub use packet::{Packet, PacketType};
pub use peers::{PeerDirectory, PeerRecord};
pub use router::{Destination, HandlerGuard, PacketHandler, Router};
pub use session::SessionManager;
