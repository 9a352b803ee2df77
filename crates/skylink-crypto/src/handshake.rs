//! One round-trip tunnel handshake.
//!
//! The initiator (consumer-side gateway) already knows the responder's static
//! public key from discovery. It sends a fresh ephemeral key; the responder
//! answers with its own ephemeral key and a key-confirmation tag.
//!
//! ```text
//! Initiator                                   Responder
//!     |-------- Open { e_i } ------------------->|
//!     |                                          |  ee = DH(e_r, e_i)
//!     |                                          |  es = DH(s_r, e_i)
//!     |<------- Accept { e_r, confirm } ---------|
//!  ee = DH(e_i, e_r), es = DH(e_i, s_r)
//!  verify confirm
//! ```
//!
//! Only the holder of the responder's static private key can produce a valid
//! confirmation tag, which authenticates the provider side of the tunnel.

use crate::aead::{KEY_SIZE, OpeningKey, SALT_SIZE, SealingKey};
use crate::kdf::Kdf;
use crate::x25519::{PrivateKey, PublicKey, TunnelKeypair};
use crate::CryptoError;
use rand_core::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Tunnel session identifier size.
pub const SESSION_ID_SIZE: usize = 16;

const INITIATOR_KDF: Kdf = Kdf::new("skylink 2024-03-11 tunnel initiator-to-responder");
const RESPONDER_KDF: Kdf = Kdf::new("skylink 2024-03-11 tunnel responder-to-initiator");
const CONFIRM_KDF: Kdf = Kdf::new("skylink 2024-03-11 tunnel key confirmation");

/// Which end of the tunnel a party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Consumer side, sends `Open`
    Initiator,
    /// Provider side, answers `Accept`
    Responder,
}

/// Key and nonce salt for one direction.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DirectionSecret {
    key: [u8; KEY_SIZE],
    salt: [u8; SALT_SIZE],
}

impl DirectionSecret {
    fn derive(kdf: &Kdf, parts: &[&[u8]]) -> Self {
        let mut okm = [0u8; KEY_SIZE + SALT_SIZE];
        kdf.derive(parts, &mut okm);
        let mut secret = Self {
            key: [0u8; KEY_SIZE],
            salt: [0u8; SALT_SIZE],
        };
        secret.key.copy_from_slice(&okm[..KEY_SIZE]);
        secret.salt.copy_from_slice(&okm[KEY_SIZE..]);
        okm.zeroize();
        secret
    }
}

/// Keys for both directions of an established tunnel.
pub struct TunnelKeys {
    initiator_to_responder: DirectionSecret,
    responder_to_initiator: DirectionSecret,
}

impl TunnelKeys {
    fn derive(
        ee: &[u8; 32],
        es: &[u8; 32],
        session_id: &[u8; SESSION_ID_SIZE],
        initiator_ephemeral: &PublicKey,
        responder_ephemeral: &PublicKey,
        responder_static: &PublicKey,
    ) -> (Self, [u8; 32]) {
        let parts: [&[u8]; 6] = [
            ee,
            es,
            session_id,
            initiator_ephemeral.as_bytes(),
            responder_ephemeral.as_bytes(),
            responder_static.as_bytes(),
        ];
        let keys = Self {
            initiator_to_responder: DirectionSecret::derive(&INITIATOR_KDF, &parts),
            responder_to_initiator: DirectionSecret::derive(&RESPONDER_KDF, &parts),
        };
        (keys, CONFIRM_KDF.derive_key(&parts))
    }

    /// Split into the writer and reader halves for `role`.
    #[must_use]
    pub fn split(self, role: Role) -> (SealingKey, OpeningKey) {
        let (send, recv) = match role {
            Role::Initiator => (&self.initiator_to_responder, &self.responder_to_initiator),
            Role::Responder => (&self.responder_to_initiator, &self.initiator_to_responder),
        };
        (
            SealingKey::new(send.key, send.salt),
            OpeningKey::new(recv.key, recv.salt),
        )
    }
}

/// Initiator state between sending `Open` and receiving `Accept`.
pub struct InitiatorHandshake {
    session_id: [u8; SESSION_ID_SIZE],
    ephemeral: PrivateKey,
    responder_static: PublicKey,
}

impl InitiatorHandshake {
    /// Start a handshake towards a responder whose static key is known.
    #[must_use]
    pub fn new(session_id: [u8; SESSION_ID_SIZE], responder_static: PublicKey) -> Self {
        Self {
            session_id,
            ephemeral: PrivateKey::generate(&mut OsRng),
            responder_static,
        }
    }

    /// Ephemeral public key to announce in `Open`.
    #[must_use]
    pub fn ephemeral_public(&self) -> PublicKey {
        self.ephemeral.public_key()
    }

    /// Complete the handshake with the responder's answer.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPublicKey` for degenerate keys and
    /// `CryptoError::KeyConfirmationFailed` when the responder does not hold
    /// the expected static key.
    pub fn finish(
        self,
        responder_ephemeral: &PublicKey,
        confirmation: &[u8; 32],
    ) -> Result<TunnelKeys, CryptoError> {
        let ee = self.ephemeral.exchange(responder_ephemeral)?;
        let es = self.ephemeral.exchange(&self.responder_static)?;

        let (keys, expected) = TunnelKeys::derive(
            ee.as_bytes(),
            es.as_bytes(),
            &self.session_id,
            &self.ephemeral.public_key(),
            responder_ephemeral,
            &self.responder_static,
        );

        // blake3::Hash equality is constant-time.
        if blake3::Hash::from(expected) != blake3::Hash::from(*confirmation) {
            return Err(CryptoError::KeyConfirmationFailed);
        }
        Ok(keys)
    }
}

/// Responder's answer to an `Open`.
pub struct ResponderReply {
    /// Ephemeral public key to send back
    pub ephemeral_public: PublicKey,
    /// Key-confirmation tag to send back
    pub confirmation: [u8; 32],
    /// Derived tunnel keys
    pub keys: TunnelKeys,
}

/// Run the responder half of the handshake.
///
/// # Errors
///
/// Returns `CryptoError::InvalidPublicKey` if the initiator's key is degenerate.
pub fn respond(
    static_keypair: &TunnelKeypair,
    session_id: &[u8; SESSION_ID_SIZE],
    initiator_ephemeral: &PublicKey,
) -> Result<ResponderReply, CryptoError> {
    let ephemeral = PrivateKey::generate(&mut OsRng);
    let ee = ephemeral.exchange(initiator_ephemeral)?;
    let es = static_keypair.private_key().exchange(initiator_ephemeral)?;
    let ephemeral_public = ephemeral.public_key();

    let (keys, confirmation) = TunnelKeys::derive(
        ee.as_bytes(),
        es.as_bytes(),
        session_id,
        initiator_ephemeral,
        &ephemeral_public,
        &static_keypair.public_key(),
    );

    Ok(ResponderReply {
        ephemeral_public,
        confirmation,
        keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_agrees_on_keys() {
        let responder = TunnelKeypair::generate();
        let session_id = [5u8; SESSION_ID_SIZE];

        let initiator = InitiatorHandshake::new(session_id, responder.public_key());
        let reply = respond(&responder, &session_id, &initiator.ephemeral_public()).unwrap();
        let initiator_keys = initiator
            .finish(&reply.ephemeral_public, &reply.confirmation)
            .unwrap();

        let (mut i_send, mut i_recv) = initiator_keys.split(Role::Initiator);
        let (mut r_send, mut r_recv) = reply.keys.split(Role::Responder);

        let (seq, ct) = i_send.seal(b"", b"to provider").unwrap();
        assert_eq!(r_recv.open(seq, b"", &ct).unwrap(), b"to provider");

        let (seq, ct) = r_send.seal(b"", b"to consumer").unwrap();
        assert_eq!(i_recv.open(seq, b"", &ct).unwrap(), b"to consumer");
    }

    #[test]
    fn test_wrong_static_key_fails_confirmation() {
        let real = TunnelKeypair::generate();
        let impostor = TunnelKeypair::generate();
        let session_id = [1u8; SESSION_ID_SIZE];

        let initiator = InitiatorHandshake::new(session_id, real.public_key());
        let reply = respond(&impostor, &session_id, &initiator.ephemeral_public()).unwrap();

        assert!(matches!(
            initiator.finish(&reply.ephemeral_public, &reply.confirmation),
            Err(CryptoError::KeyConfirmationFailed)
        ));
    }

    #[test]
    fn test_session_id_binds_keys() {
        let responder = TunnelKeypair::generate();
        let initiator = InitiatorHandshake::new([1u8; SESSION_ID_SIZE], responder.public_key());
        let reply = respond(
            &responder,
            &[2u8; SESSION_ID_SIZE],
            &initiator.ephemeral_public(),
        )
        .unwrap();

        assert!(
            initiator
                .finish(&reply.ephemeral_public, &reply.confirmation)
                .is_err()
        );
    }

    #[test]
    fn test_degenerate_ephemeral_rejected() {
        let responder = TunnelKeypair::generate();
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            respond(&responder, &[0u8; SESSION_ID_SIZE], &zero),
            Err(CryptoError::InvalidPublicKey)
        ));
    }
}
