//! Node and link-layer identities.

use serde::{Deserialize, Serialize};

/// Opaque 16-byte node identity.
///
/// Generated randomly the first time a node starts and stable across
/// reconnects. The all-zero id addresses every node (broadcast) and is
/// never a valid node identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; Self::SIZE]);

impl NodeId {
    /// Identity size in bytes.
    pub const SIZE: usize = 16;

    /// Broadcast/null destination.
    pub const BROADCAST: NodeId = NodeId([0u8; Self::SIZE]);

    /// Generate a fresh random identity.
    #[must_use]
    pub fn random() -> Self {
        use rand::RngCore;

        let mut bytes = [0u8; Self::SIZE];
        // Re-roll the (astronomically unlikely) broadcast id.
        loop {
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            if bytes != [0u8; Self::SIZE] {
                return Self(bytes);
            }
        }
    }

    /// Construct from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw identity bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// True for the all-zero broadcast id.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

/// 48-bit link-layer address for bridged (L2) operation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The all-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    /// True for broadcast and multicast destinations.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl std::fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MacAddr({self})")
    }
}
