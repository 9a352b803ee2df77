//! # SKYLINK Crypto
//!
//! Cryptographic primitives for relay tunnels between clouds.
//!
//! This crate provides:
//! - X25519 gateway keypairs and base64 key transport
//! - A one round-trip tunnel handshake with key confirmation
//! - BLAKE3 key derivation
//! - `XChaCha20-Poly1305` frame sealing with counter nonces
//! - Sliding-window replay protection for retransmitting relays
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | KDF | BLAKE3 `derive_key` | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod handshake;
pub mod kdf;
pub mod replay;
pub mod x25519;

pub use error::CryptoError;
pub use handshake::{InitiatorHandshake, ResponderReply, Role, SESSION_ID_SIZE, TunnelKeys};
pub use x25519::{PublicKey, TunnelKeypair};

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;
