//! Core error taxonomy.

use crate::identity::NodeId;
use thiserror::Error;
use veilmesh_crypto::CryptoError;
use veilmesh_transport::TransportError;

/// Errors raised by the router/session layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or unauthenticated traffic from the network. Logged and
    /// dropped; never fatal.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// No open session exists for the peer.
    #[error("No open session with peer {0}")]
    UnknownSession(NodeId),

    /// The destination cannot be resolved to an address.
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// Transport-level failure for an individual send or receive.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// An awaited operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Cryptographic failure. Fatal only during startup key derivation;
    /// per-packet failures surface as `Protocol` after logging.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Virtual adapter failure.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Node is not running.
    #[error("Node is shut down")]
    Shutdown,
}

impl CoreError {
    /// Whether retrying the same operation can reasonably succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Protocol(_)
            | Self::UnknownSession(_)
            | Self::UnknownDestination(_)
            | Self::Crypto(_)
            | Self::Adapter(_)
            | Self::Shutdown => false,
        }
    }
}

impl From<bincode::Error> for CoreError {
    fn from(e: bincode::Error) -> Self {
        Self::Protocol(format!("payload encoding: {e}"))
    }
}

/// Convenience alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;
