//! `XChaCha20-Poly1305` AEAD encryption and the per-session cipher.
//!
//! Sealed overlay packets are encrypted with a key pair negotiated by the
//! handshake. Nonces are built from an explicit send counter so that the
//! receiver can reconstruct them from the wire and reject replays.

use crate::error::{CryptoError, Result};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random nonce.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a nonce from a counter value.
    ///
    /// The counter occupies the first 8 bytes (big-endian, matching the
    /// wire), the remaining 16 bytes carry the per-session salt.
    #[must_use]
    pub fn from_counter(counter: u64, salt: &[u8; 16]) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&counter.to_be_bytes());
        bytes[8..].copy_from_slice(salt);
        Self(bytes)
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes). Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with appended authentication tag.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .encrypt(
                nonce.as_generic(),
                chacha20poly1305::aead::Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with associated data.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext_and_tag: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt(
                nonce.as_generic(),
                chacha20poly1305::aead::Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Default number of messages a session may carry in one direction
/// before the session manager is expected to rekey.
pub const DEFAULT_REKEY_AFTER: u64 = 1_000_000;

/// Per-session encryption state.
///
/// Holds directional keys, the explicit send counter carried on the wire
/// and the anti-replay high-water mark for received counters. `seal` and
/// `open` mutate nothing but those counters.
#[derive(ZeroizeOnDrop)]
pub struct SessionCipher {
    send_key: AeadKey,
    recv_key: AeadKey,
    #[zeroize(skip)]
    nonce_salt: [u8; 16],
    #[zeroize(skip)]
    send_counter: u64,
    /// Highest counter accepted from the peer; `None` until the first packet.
    #[zeroize(skip)]
    recv_highest: Option<u64>,
    #[zeroize(skip)]
    rekey_after: u64,
}

impl SessionCipher {
    /// Create a session cipher from negotiated key material.
    #[must_use]
    pub fn new(send_key: AeadKey, recv_key: AeadKey, nonce_salt: [u8; 16]) -> Self {
        Self {
            send_key,
            recv_key,
            nonce_salt,
            send_counter: 0,
            recv_highest: None,
            rekey_after: DEFAULT_REKEY_AFTER,
        }
    }

    /// Override the rekey threshold (tests use tiny values).
    #[must_use]
    pub fn with_rekey_after(mut self, rekey_after: u64) -> Self {
        self.rekey_after = rekey_after;
        self
    }

    /// Encrypt a plaintext, returning the counter used and the ciphertext.
    ///
    /// The counter must travel with the ciphertext; the receiver needs it
    /// to reconstruct the nonce.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::NonceExhausted` once the counter space is
    /// spent, and `CryptoError::EncryptionFailed` on AEAD failure.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(u64, Vec<u8>)> {
        let counter = self.send_counter;
        if counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }

        let nonce = Nonce::from_counter(counter, &self.nonce_salt);
        let ciphertext = self.send_key.encrypt(&nonce, plaintext, aad)?;
        self.send_counter += 1;

        Ok((counter, ciphertext))
    }

    /// Decrypt a ciphertext sealed with the given counter.
    ///
    /// Counters must be strictly increasing; anything at or below the
    /// highest accepted counter is rejected as a replay. Packets lost or
    /// reordered below the high-water mark are dropped here and recovered
    /// by the ack/retry layer above.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::ReplayedCounter` for stale counters and
    /// `CryptoError::DecryptionFailed` on authentication failure.
    pub fn open(&mut self, counter: u64, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if let Some(highest) = self.recv_highest {
            if counter <= highest {
                return Err(CryptoError::ReplayedCounter { counter, highest });
            }
        }

        let nonce = Nonce::from_counter(counter, &self.nonce_salt);
        let plaintext = self.recv_key.decrypt(&nonce, ciphertext, aad)?;

        // Only advance the mark after authentication succeeds, so a
        // forged counter cannot wedge the session.
        self.recv_highest = Some(counter);
        Ok(plaintext)
    }

    /// Current send counter (next counter to be used).
    #[must_use]
    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    /// True once either direction is close enough to the threshold that
    /// the session should be re-established with fresh keys.
    #[must_use]
    pub fn needs_rekey(&self) -> bool {
        self.send_counter >= self.rekey_after
            || self.recv_highest.is_some_and(|h| h >= self.rekey_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn pair() -> (SessionCipher, SessionCipher) {
        let a2b = AeadKey::generate(&mut OsRng);
        let b2a = AeadKey::generate(&mut OsRng);
        let salt = [9u8; 16];
        (
            SessionCipher::new(a2b.clone(), b2a.clone(), salt),
            SessionCipher::new(b2a, a2b, salt),
        )
    }

    #[test]
    fn test_aead_roundtrip() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::generate(&mut OsRng);

        let ct = key.encrypt(&nonce, b"secret message", b"header").unwrap();
        assert_eq!(ct.len(), 14 + TAG_SIZE);

        let pt = key.decrypt(&nonce, &ct, b"header").unwrap();
        assert_eq!(pt, b"secret message");
    }

    #[test]
    fn test_aead_tamper_detection() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::generate(&mut OsRng);

        let mut ct = key.encrypt(&nonce, b"data", b"").unwrap();
        ct[0] ^= 0xFF;
        assert!(key.decrypt(&nonce, &ct, b"").is_err());
    }

    #[test]
    fn test_aead_wrong_aad_fails() {
        let key = AeadKey::generate(&mut OsRng);
        let nonce = Nonce::generate(&mut OsRng);

        let ct = key.encrypt(&nonce, b"data", b"aad1").unwrap();
        assert!(key.decrypt(&nonce, &ct, b"aad2").is_err());
    }

    #[test]
    fn test_nonce_from_counter() {
        let salt = [0x42u8; 16];
        assert_ne!(
            Nonce::from_counter(0, &salt).as_bytes(),
            Nonce::from_counter(1, &salt).as_bytes()
        );
        assert_eq!(
            Nonce::from_counter(7, &salt).as_bytes(),
            Nonce::from_counter(7, &salt).as_bytes()
        );
    }

    #[test]
    fn test_session_roundtrip() {
        let (mut a, mut b) = pair();

        let (c1, ct1) = a.seal(b"hello", b"hdr").unwrap();
        assert_eq!(b.open(c1, &ct1, b"hdr").unwrap(), b"hello");

        let (c2, ct2) = b.seal(b"reply", b"hdr").unwrap();
        assert_eq!(a.open(c2, &ct2, b"hdr").unwrap(), b"reply");
    }

    #[test]
    fn test_session_empty_payload() {
        let (mut a, mut b) = pair();
        let (c, ct) = a.seal(b"", b"").unwrap();
        assert_eq!(b.open(c, &ct, b"").unwrap(), b"");
    }

    #[test]
    fn test_session_counter_advances() {
        let (mut a, _) = pair();
        assert_eq!(a.send_counter(), 0);
        a.seal(b"x", b"").unwrap();
        assert_eq!(a.send_counter(), 1);
        a.seal(b"y", b"").unwrap();
        assert_eq!(a.send_counter(), 2);
    }

    #[test]
    fn test_session_rejects_replay() {
        let (mut a, mut b) = pair();

        let (c, ct) = a.seal(b"once", b"").unwrap();
        b.open(c, &ct, b"").unwrap();

        // Replaying the exact packet fails before any decryption.
        assert!(matches!(
            b.open(c, &ct, b""),
            Err(CryptoError::ReplayedCounter { counter: 0, highest: 0 })
        ));
    }

    #[test]
    fn test_session_rejects_stale_counter() {
        let (mut a, mut b) = pair();

        let (c0, ct0) = a.seal(b"first", b"").unwrap();
        let (c1, ct1) = a.seal(b"second", b"").unwrap();

        // Delivered out of order: newer first, then the old one.
        b.open(c1, &ct1, b"").unwrap();
        assert!(matches!(
            b.open(c0, &ct0, b""),
            Err(CryptoError::ReplayedCounter { .. })
        ));
    }

    #[test]
    fn test_session_failed_auth_does_not_advance_mark() {
        let (mut a, mut b) = pair();

        let (c0, ct0) = a.seal(b"real", b"").unwrap();

        // A forged packet claiming a huge counter must not wedge the session.
        assert!(b.open(999, b"garbage-that-is-long-enough!", b"").is_err());
        assert_eq!(b.open(c0, &ct0, b"").unwrap(), b"real");
    }

    #[test]
    fn test_needs_rekey() {
        let a2b = AeadKey::generate(&mut OsRng);
        let b2a = AeadKey::generate(&mut OsRng);
        let mut cipher = SessionCipher::new(a2b, b2a, [0u8; 16]).with_rekey_after(2);

        assert!(!cipher.needs_rekey());
        cipher.seal(b"1", b"").unwrap();
        assert!(!cipher.needs_rekey());
        cipher.seal(b"2", b"").unwrap();
        assert!(cipher.needs_rekey());
    }
}
