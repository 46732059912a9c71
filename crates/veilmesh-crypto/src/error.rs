//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors from cryptographic operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material has the wrong length.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },

    /// AEAD encryption failed.
    #[error("Encryption failed")]
    EncryptionFailed,

    /// AEAD decryption or authentication failed.
    #[error("Decryption failed: authentication error")]
    DecryptionFailed,

    /// A sealed packet carried a counter at or below the highest already seen.
    #[error("Replayed or stale counter: {counter} (highest seen {highest})")]
    ReplayedCounter {
        /// Counter carried by the rejected packet.
        counter: u64,
        /// Highest counter accepted so far.
        highest: u64,
    },

    /// The nonce counter space is exhausted; the session must rekey.
    #[error("Nonce counter exhausted")]
    NonceExhausted,

    /// Handshake message arrived in a phase that cannot accept it.
    #[error("Handshake out of phase: {0}")]
    OutOfPhase(&'static str),

    /// Key-confirmation tag did not match the derived session key.
    ///
    /// This is what a wrong network secret looks like on the wire.
    #[error("Key confirmation failed")]
    ConfirmMismatch,

    /// Passphrase stretching failed (missing or broken KDF backend).
    #[error("Secret derivation failed: {0}")]
    SecretDerivation(String),
}

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
