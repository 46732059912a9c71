//! # veilmesh-crypto
//!
//! Cryptographic primitives for the veilmesh overlay network.
//!
//! This crate provides:
//! - BLAKE3 hashing and key derivation (`hash`)
//! - Network-secret stretching and cleartext packet authentication (`secret`)
//! - `XChaCha20-Poly1305` session cipher with counter nonces and
//!   anti-replay enforcement (`aead`)
//! - The three-message password-authenticated key exchange that
//!   establishes per-peer session keys without ever transmitting the
//!   shared network secret (`pake`)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod pake;
pub mod secret;

pub use aead::{AeadKey, Nonce, SessionCipher, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::CryptoError;
pub use pake::{Handshake1, Handshake2, Handshake3, Initiator, Responder, SessionKeys};
pub use secret::NetworkSecret;

/// Size of the cleartext packet authentication tag.
pub const CLEAR_MAC_SIZE: usize = 16;

/// Size of the random nonce attached to cleartext control packets.
pub const CLEAR_NONCE_SIZE: usize = 16;
