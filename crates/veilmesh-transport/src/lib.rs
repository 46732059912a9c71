//! # veilmesh-transport
//!
//! Network transport layer for the veilmesh overlay.
//!
//! The overlay speaks datagrams. The [`Transport`](transport::Transport)
//! trait abstracts the backend: UDP is the primary transport, and a
//! length-framed TCP backend fills the connection-oriented slot for
//! networks where UDP is filtered.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod tcp;
pub mod transport;
pub mod udp;

pub use tcp::TcpTransport;
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;
