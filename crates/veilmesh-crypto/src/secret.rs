//! Network secret derivation.
//!
//! Every node in an overlay network shares one passphrase. It is never
//! sent on the wire; it is stretched into a 32-byte network key with
//! argon2id, and purpose-specific subkeys are derived from that key:
//!
//! - `auth_key` authenticates cleartext control packets (greet and
//!   handshake bootstrap, which exist before any session cipher does)
//! - `mask_key` blinds the ephemeral public keys exchanged during the
//!   handshake, making the exchange password-authenticated

use crate::error::{CryptoError, Result};
use crate::hash::{mac16, Kdf};
use crate::{CLEAR_MAC_SIZE, CLEAR_NONCE_SIZE};
use zeroize::ZeroizeOnDrop;

/// Application salt for passphrase stretching.
///
/// Fixed per protocol version: two nodes can only derive the same network
/// key from the same passphrase.
const SECRET_SALT: &[u8; 16] = b"veilmesh-net-v1\0";

/// Stretched shared network secret and its derived subkeys.
#[derive(Clone, ZeroizeOnDrop)]
pub struct NetworkSecret {
    network_key: [u8; 32],
    auth_key: [u8; 32],
    mask_key: [u8; 32],
}

impl NetworkSecret {
    /// Stretch a shared passphrase into the network secret.
    ///
    /// This is the one startup operation allowed to hard-fail: a node
    /// must not run without a working KDF backend.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SecretDerivation` if argon2 fails.
    pub fn derive(passphrase: &[u8]) -> Result<Self> {
        let mut network_key = [0u8; 32];
        argon2::Argon2::default()
            .hash_password_into(passphrase, SECRET_SALT, &mut network_key)
            .map_err(|e| CryptoError::SecretDerivation(e.to_string()))?;

        let auth_key = Kdf::new("veilmesh/clear-auth").derive_key(&network_key);
        let mask_key = Kdf::new("veilmesh/pake-mask").derive_key(&network_key);

        Ok(Self {
            network_key,
            auth_key,
            mask_key,
        })
    }

    /// Raw 32-byte network key (handshake key-derivation input).
    #[must_use]
    pub fn network_key(&self) -> &[u8; 32] {
        &self.network_key
    }

    /// Key used to blind handshake ephemerals.
    #[must_use]
    pub fn mask_key(&self) -> &[u8; 32] {
        &self.mask_key
    }

    /// Authenticate a cleartext control packet.
    ///
    /// Returns the `[nonce][mac]` trailer to append to the packet.
    #[must_use]
    pub fn clear_tag(&self, packet: &[u8]) -> [u8; CLEAR_NONCE_SIZE + CLEAR_MAC_SIZE] {
        let mut nonce = [0u8; CLEAR_NONCE_SIZE];
        getrandom::getrandom(&mut nonce).expect("CSPRNG failure");

        let mac = mac16(&self.auth_key, &[packet, &nonce]);

        let mut trailer = [0u8; CLEAR_NONCE_SIZE + CLEAR_MAC_SIZE];
        trailer[..CLEAR_NONCE_SIZE].copy_from_slice(&nonce);
        trailer[CLEAR_NONCE_SIZE..].copy_from_slice(&mac);
        trailer
    }

    /// Verify the `[nonce][mac]` trailer of a cleartext control packet.
    #[must_use]
    pub fn verify_clear_tag(&self, packet: &[u8], trailer: &[u8]) -> bool {
        use subtle::ConstantTimeEq;

        if trailer.len() != CLEAR_NONCE_SIZE + CLEAR_MAC_SIZE {
            return false;
        }
        let (nonce, mac) = trailer.split_at(CLEAR_NONCE_SIZE);
        let expected = mac16(&self.auth_key, &[packet, nonce]);
        expected.ct_eq(mac).into()
    }
}

impl std::fmt::Debug for NetworkSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("NetworkSecret(..)")
    }
}
