//! X25519 Diffie-Hellman key agreement (RFC 7748).
//!
//! Gateways hold a long-lived [`PrivateKey`] whose public half is published
//! in discovery answers; every tunnel additionally uses a fresh ephemeral key.
//! Public keys travel between clouds as standard base64 text.

use crate::CryptoError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::{CryptoRng, OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 private key (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// X25519 shared secret (32 bytes).
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPublicKey` if the peer key is a low-order point.
    pub fn exchange(&self, peer_public: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&peer_public.0);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(SharedSecret(shared))
    }

    /// Export as bytes.
    ///
    /// # Security
    ///
    /// The returned bytes contain the raw private key. Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Import from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl PublicKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Get bytes as a slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Encode as base64 text, the form carried in connection requests.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.as_bytes())
    }

    /// Decode from base64 text. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyEncoding` for malformed base64 and
    /// `CryptoError::InvalidKeyLength` when the decoded key is not 32 bytes.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD
            .decode(text.trim())
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: crate::X25519_PUBLIC_KEY_SIZE,
                actual: raw.len(),
            })?;
        Ok(Self::from_bytes(bytes))
    }
}

impl SharedSecret {
    /// Get shared secret as bytes.
    ///
    /// Feed through [`crate::kdf`] before using it as a key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// A gateway's long-lived tunnel keypair.
#[derive(Clone)]
pub struct TunnelKeypair {
    private: PrivateKey,
    public: PublicKey,
}

impl TunnelKeypair {
    /// Generate a keypair from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate(&mut OsRng))
    }

    /// Wrap an existing private key.
    #[must_use]
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// The private half.
    #[must_use]
    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// The public half.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }
}

impl std::fmt::Debug for TunnelKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelKeypair")
            .field("public", &self.public.to_base64())
            .finish_non_exhaustive()
    }
}
