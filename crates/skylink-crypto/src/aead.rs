//! `XChaCha20-Poly1305` AEAD encryption for tunnel frames.
//!
//! Each tunnel direction owns one [`SealingKey`] on the writer side and one
//! [`OpeningKey`] on the reader side. Nonces are never transmitted: both ends
//! rebuild them from the frame sequence number and a per-direction salt.
//!
//! ## Usage
//!
//! ```ignore
//! let (key, salt) = ([7u8; 32], [1u8; 16]);
//! let mut sealer = SealingKey::new(key, salt);
//! let mut opener = OpeningKey::new(key, salt);
//!
//! let (seq, ciphertext) = sealer.seal(b"aad", b"secret")?;
//! let plaintext = opener.open(seq, b"aad", &ciphertext)?;
//! ```

use crate::CryptoError;
use crate::replay::ReplayWindow;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Nonce salt size.
pub const SALT_SIZE: usize = 16;

/// Frames a single direction may seal before the tunnel must be re-established.
pub const MAX_FRAMES_PER_DIRECTION: u64 = 1 << 48;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from a counter value.
    ///
    /// The counter is placed in the first 8 bytes (little-endian),
    /// followed by the 16-byte direction salt.
    #[must_use]
    pub fn from_counter(counter: u64, salt: &[u8; SALT_SIZE]) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..8].copy_from_slice(&counter.to_le_bytes());
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

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with appended authentication tag.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        XChaCha20Poly1305::new((&self.0).into())
            .encrypt(
                nonce.as_generic(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext (tag appended) with associated data.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        XChaCha20Poly1305::new((&self.0).into())
            .decrypt(
                nonce.as_generic(),
                Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Writer half of one tunnel direction.
pub struct SealingKey {
    key: AeadKey,
    salt: [u8; SALT_SIZE],
    next_seq: u64,
}

impl SealingKey {
    /// Create a sealing key starting at sequence 0.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE], salt: [u8; SALT_SIZE]) -> Self {
        Self {
            key: AeadKey::new(key),
            salt,
            next_seq: 0,
        }
    }

    /// Sequence number the next call to [`seal`](Self::seal) will use.
    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Encrypt the next frame.
    ///
    /// `aad` is built by the caller for the sequence returned by
    /// [`next_seq`](Self::next_seq); the sequence is consumed on success.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::NonceOverflow` when the direction is exhausted.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<(u64, Vec<u8>), CryptoError> {
        if self.next_seq >= MAX_FRAMES_PER_DIRECTION {
            return Err(CryptoError::NonceOverflow);
        }

        let seq = self.next_seq;
        let nonce = Nonce::from_counter(seq, &self.salt);
        let ciphertext = self.key.encrypt(&nonce, plaintext, aad)?;
        self.next_seq += 1;
        Ok((seq, ciphertext))
    }
}

/// Reader half of one tunnel direction, with replay protection.
pub struct OpeningKey {
    key: AeadKey,
    salt: [u8; SALT_SIZE],
    window: ReplayWindow,
}

impl OpeningKey {
    /// Create an opening key with an empty replay window.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE], salt: [u8; SALT_SIZE]) -> Self {
        Self {
            key: AeadKey::new(key),
            salt,
            window: ReplayWindow::new(),
        }
    }

    /// Authenticate and decrypt a frame carrying sequence `seq`.
    ///
    /// A sequence is only recorded as seen after it authenticates, so forged
    /// frames cannot burn sequence numbers.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::ReplayDetected` for duplicates and sequences that
    /// fell out of the window, `CryptoError::DecryptionFailed` on tampering.
    pub fn open(&mut self, seq: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if !self.window.check(seq) {
            return Err(CryptoError::ReplayDetected(seq));
        }

        let nonce = Nonce::from_counter(seq, &self.salt);
        let plaintext = self.key.decrypt(&nonce, ciphertext, aad)?;
        self.window.mark(seq);
        Ok(plaintext)
    }
}
