//! Transport trait abstraction for multiple transport backends.
//!
//! The router never touches sockets directly; it sends and receives
//! datagrams through this trait, so a network can run over UDP or a
//! connection-oriented stream backend without the session layer noticing.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Transport layer errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed.
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed.
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connecting to a remote stream endpoint failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Inbound frame exceeded the datagram size limit.
    #[error("Oversized frame: {0} bytes")]
    OversizedFrame(usize),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// Implementations must be safe for concurrent `send_to` calls; the
/// overlay has exactly one receive loop per transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a datagram to a remote address. Returns bytes sent.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram into `buf`, returning its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// The local address this transport is bound to.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport; subsequent operations return `Closed`.
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent.
    pub bytes_sent: u64,
    /// Total bytes received.
    pub bytes_received: u64,
    /// Total datagrams sent.
    pub packets_sent: u64,
    /// Total datagrams received.
    pub packets_received: u64,
    /// Send errors.
    pub send_errors: u64,
    /// Receive errors.
    pub recv_errors: u64,
}
