//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Key material could not be decoded from its text form
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// Peer public key is a low-order point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key confirmation tag did not match the derived keys
    #[error("key confirmation failed")]
    KeyConfirmationFailed,

    /// Nonce overflow (counter exhausted)
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,

    /// Replay attack or retransmission detected (duplicate sequence number)
    #[error("replay detected for sequence {0}")]
    ReplayDetected(u64),
}
