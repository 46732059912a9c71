//! Password-authenticated key exchange.
//!
//! Three messages establish a per-peer session key from the shared
//! network secret without ever transmitting it:
//!
//! ```text
//! Initiator                          Responder
//!     |                                  |
//!     |-- HANDSHAKE1 (nonce, masked e) ->|
//!     |                                  |
//!     |<- HANDSHAKE2 (nonce, masked e,   |
//!     |               confirm_r) --------|
//!     |                                  |
//!     |-- HANDSHAKE3 (confirm_i) ------->|
//!     |                                  |
//!     |        [Session keys match]      |
//! ```
//!
//! Each side sends an ephemeral X25519 public key XOR-masked with a
//! keystream derived from the network secret (EKE-style blinding). Both
//! sides compute the Diffie-Hellman value and mix it with the network
//! key through HKDF. A peer holding the wrong secret unmasks garbage,
//! derives a different key, and fails the confirmation tags carried by
//! HANDSHAKE2 and HANDSHAKE3 — no session opens on a wrong network key.

use crate::aead::AeadKey;
use crate::error::{CryptoError, Result};
use crate::hash::hkdf;
use crate::secret::NetworkSecret;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// First handshake message (initiator -> responder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake1 {
    /// Initiator's random nonce.
    pub nonce: [u8; 16],
    /// Ephemeral X25519 public key, masked under the network secret.
    pub masked_ephemeral: [u8; 32],
    /// Relay depth at which the initiator currently sees the responder.
    pub relays: u8,
}

/// Second handshake message (responder -> initiator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake2 {
    /// Responder's random nonce.
    pub nonce: [u8; 16],
    /// Ephemeral X25519 public key, masked under the network secret.
    pub masked_ephemeral: [u8; 32],
    /// Relay depth at which the responder currently sees the initiator.
    pub relays: u8,
    /// Responder's confirmation tag over the derived session key.
    pub confirm: [u8; 32],
}

/// Third handshake message (initiator -> responder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake3 {
    /// Initiator's confirmation tag over the derived session key.
    pub confirm: [u8; 32],
}

/// Directional key material negotiated by a completed handshake.
pub struct SessionKeys {
    /// Key for sending to the peer.
    pub send_key: AeadKey,
    /// Key for receiving from the peer.
    pub recv_key: AeadKey,
    /// Per-session nonce salt shared by both directions.
    pub nonce_salt: [u8; 16],
}

/// Keystream pad used to blind an ephemeral public key.
fn mask_pad(mask_key: &[u8; 32], label: &[u8], nonce: &[u8; 16]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_keyed(mask_key);
    hasher.update(label);
    hasher.update(nonce);
    let mut pad = [0u8; 32];
    hasher.finalize_xof().fill(&mut pad);
    pad
}

fn apply_mask(bytes: &[u8; 32], pad: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (b, p)) in out.iter_mut().zip(bytes.iter().zip(pad.iter())) {
        *o = b ^ p;
    }
    out
}

/// Derived schedule: directional keys, confirmation key, nonce salt.
struct Schedule {
    key_i2r: [u8; 32],
    key_r2i: [u8; 32],
    confirm_key: [u8; 32],
    nonce_salt: [u8; 16],
}

impl Schedule {
    fn derive(
        secret: &NetworkSecret,
        dh: &[u8; 32],
        nonce_i: &[u8; 16],
        nonce_r: &[u8; 16],
    ) -> Self {
        let mut salt = [0u8; 32];
        salt[..16].copy_from_slice(nonce_i);
        salt[16..].copy_from_slice(nonce_r);

        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(dh);
        ikm[32..].copy_from_slice(secret.network_key());

        let mut okm = [0u8; 112];
        hkdf(&salt, &ikm, b"veilmesh/session-v1", &mut okm);
        ikm.zeroize();

        let mut key_i2r = [0u8; 32];
        let mut key_r2i = [0u8; 32];
        let mut confirm_key = [0u8; 32];
        let mut nonce_salt = [0u8; 16];
        key_i2r.copy_from_slice(&okm[..32]);
        key_r2i.copy_from_slice(&okm[32..64]);
        confirm_key.copy_from_slice(&okm[64..96]);
        nonce_salt.copy_from_slice(&okm[96..112]);
        okm.zeroize();

        Self {
            key_i2r,
            key_r2i,
            confirm_key,
            nonce_salt,
        }
    }

    fn confirm_tag(&self, label: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(&self.confirm_key);
        hasher.update(label);
        *hasher.finalize().as_bytes()
    }

    fn into_keys(self, is_initiator: bool) -> SessionKeys {
        let (send, recv) = if is_initiator {
            (self.key_i2r, self.key_r2i)
        } else {
            (self.key_r2i, self.key_i2r)
        };
        SessionKeys {
            send_key: AeadKey::new(send),
            recv_key: AeadKey::new(recv),
            nonce_salt: self.nonce_salt,
        }
    }
}

const CONFIRM_RESPONDER: &[u8] = b"veilmesh confirm responder";
const CONFIRM_INITIATOR: &[u8] = b"veilmesh confirm initiator";

/// Initiator-side handshake state machine.
pub struct Initiator {
    secret: NetworkSecret,
    ephemeral: StaticSecret,
    nonce: [u8; 16],
    awaiting_response: bool,
}

impl Initiator {
    /// Start a handshake, producing the first message.
    ///
    /// `relays` is the depth at which this node currently sees the peer
    /// (0 for a direct contact attempt).
    #[must_use]
    pub fn new(secret: &NetworkSecret, relays: u8) -> (Self, Handshake1) {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&ephemeral);

        let mut nonce = [0u8; 16];
        getrandom::getrandom(&mut nonce).expect("CSPRNG failure");

        let pad = mask_pad(secret.mask_key(), b"mask-initiator", &nonce);
        let masked_ephemeral = apply_mask(public.as_bytes(), &pad);

        let msg = Handshake1 {
            nonce,
            masked_ephemeral,
            relays,
        };
        let state = Self {
            secret: secret.clone(),
            ephemeral,
            nonce,
            awaiting_response: true,
        };
        (state, msg)
    }

    /// Process the responder's reply.
    ///
    /// Verifies the responder's confirmation tag, derives the session
    /// keys and produces the final message of the exchange.
    ///
    /// # Errors
    ///
    /// `CryptoError::OutOfPhase` if the handshake already completed;
    /// `CryptoError::ConfirmMismatch` when the responder holds a
    /// different network secret.
    pub fn handshake2(&mut self, msg: &Handshake2) -> Result<(SessionKeys, Handshake3)> {
        if !self.awaiting_response {
            return Err(CryptoError::OutOfPhase("initiator already finished"));
        }
        self.awaiting_response = false;

        let pad = mask_pad(self.secret.mask_key(), b"mask-responder", &msg.nonce);
        let peer_public = PublicKey::from(apply_mask(&msg.masked_ephemeral, &pad));

        let dh = self.ephemeral.diffie_hellman(&peer_public);
        let schedule = Schedule::derive(&self.secret, dh.as_bytes(), &self.nonce, &msg.nonce);

        let expected: [u8; 32] = schedule.confirm_tag(CONFIRM_RESPONDER);
        if !bool::from(expected.ct_eq(&msg.confirm)) {
            return Err(CryptoError::ConfirmMismatch);
        }

        let confirm = schedule.confirm_tag(CONFIRM_INITIATOR);
        Ok((schedule.into_keys(true), Handshake3 { confirm }))
    }
}

/// Responder-side handshake phase.
enum ResponderPhase {
    AwaitingInit,
    AwaitingConfirm {
        schedule: Schedule,
    },
    Done,
}

/// Responder-side handshake state machine.
pub struct Responder {
    secret: NetworkSecret,
    phase: ResponderPhase,
}

impl Responder {
    /// Create a responder for one incoming handshake.
    #[must_use]
    pub fn new(secret: &NetworkSecret) -> Self {
        Self {
            secret: secret.clone(),
            phase: ResponderPhase::AwaitingInit,
        }
    }

    /// Process the initiator's opening message and produce the reply.
    ///
    /// `relays` is the depth at which this node currently sees the
    /// initiator. Returns the reply together with the relay depth the
    /// initiator reported.
    ///
    /// # Errors
    ///
    /// `CryptoError::OutOfPhase` if an opening message was already consumed.
    pub fn handshake1(&mut self, msg: &Handshake1, relays: u8) -> Result<(Handshake2, u8)> {
        if !matches!(self.phase, ResponderPhase::AwaitingInit) {
            return Err(CryptoError::OutOfPhase("responder already has an init"));
        }

        let peer_pad = mask_pad(self.secret.mask_key(), b"mask-initiator", &msg.nonce);
        let peer_public = PublicKey::from(apply_mask(&msg.masked_ephemeral, &peer_pad));

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&ephemeral);

        let mut nonce = [0u8; 16];
        getrandom::getrandom(&mut nonce).expect("CSPRNG failure");

        let pad = mask_pad(self.secret.mask_key(), b"mask-responder", &nonce);
        let masked_ephemeral = apply_mask(public.as_bytes(), &pad);

        let dh = ephemeral.diffie_hellman(&peer_public);
        let schedule = Schedule::derive(&self.secret, dh.as_bytes(), &msg.nonce, &nonce);
        let confirm = schedule.confirm_tag(CONFIRM_RESPONDER);

        let reply = Handshake2 {
            nonce,
            masked_ephemeral,
            relays,
            confirm,
        };
        self.phase = ResponderPhase::AwaitingConfirm { schedule };
        Ok((reply, msg.relays))
    }

    /// Process the initiator's confirmation, completing the handshake.
    ///
    /// # Errors
    ///
    /// `CryptoError::OutOfPhase` before HANDSHAKE1 was processed;
    /// `CryptoError::ConfirmMismatch` when the initiator holds a
    /// different network secret.
    pub fn handshake3(&mut self, msg: &Handshake3) -> Result<SessionKeys> {
        let phase = std::mem::replace(&mut self.phase, ResponderPhase::Done);
        let schedule = match phase {
            ResponderPhase::AwaitingConfirm { schedule } => schedule,
            other => {
                self.phase = other;
                return Err(CryptoError::OutOfPhase("responder has no pending confirm"));
            }
        };

        let expected: [u8; 32] = schedule.confirm_tag(CONFIRM_INITIATOR);
        if !bool::from(expected.ct_eq(&msg.confirm)) {
            return Err(CryptoError::ConfirmMismatch);
        }

        Ok(schedule.into_keys(false))
    }

    /// True once HANDSHAKE1 has been consumed and the responder is
    /// waiting only for the final confirmation.
    #[must_use]
    pub fn awaiting_confirm(&self) -> bool {
        matches!(self.phase, ResponderPhase::AwaitingConfirm { .. })
    }
}
