//! Gateway control messages and tunnel data frames.
//!
//! Both travel as bincode inside relay envelope payloads. Control messages
//! are plaintext; tunnel frames carry sealed application bytes.

use crate::error::{Error, Result};
use crate::model::{CloudIdentity, SessionId, SystemDescriptor};
use serde::{Deserialize, Serialize};

/// Size of the additional authenticated data bound to every frame.
pub const FRAME_AAD_SIZE: usize = 16 + 8 + 1;

/// Request to open a tunnel, sent by the consumer side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTunnel {
    /// Tunnel id chosen by the consumer side
    pub session_id: SessionId,
    /// Service the tunnel carries
    pub service_definition: String,
    /// Consumer system
    pub consumer: SystemDescriptor,
    /// Consumer cloud
    pub consumer_cloud: CloudIdentity,
    /// Provider system to dial
    pub provider: SystemDescriptor,
    /// Provider cloud
    pub provider_cloud: CloudIdentity,
    /// Initiator ephemeral X25519 key
    pub ephemeral_public: [u8; 32],
}

/// Gateway control-plane message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Open a tunnel
    Open(OpenTunnel),
    /// Tunnel accepted
    Accept {
        /// Tunnel id from the `Open`
        session_id: SessionId,
        /// Responder ephemeral X25519 key
        ephemeral_public: [u8; 32],
        /// Key-confirmation tag
        confirmation: [u8; 32],
    },
    /// Tunnel refused
    Reject {
        /// Tunnel id from the `Open`
        session_id: SessionId,
        /// Human-readable reason
        reason: String,
    },
}

impl ControlMessage {
    /// Tunnel this message refers to.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            ControlMessage::Open(open) => &open.session_id,
            ControlMessage::Accept { session_id, .. } | ControlMessage::Reject { session_id, .. } => {
                session_id
            }
        }
    }

    /// Encode for an envelope payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from an envelope payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One sealed chunk of tunnel data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelFrame {
    /// Per-direction sequence number
    pub seq: u64,
    /// Last frame of this direction
    pub fin: bool,
    /// Sealed payload; empty plaintext for a bare FIN
    pub ciphertext: Vec<u8>,
}

impl TunnelFrame {
    /// Encode for an envelope payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from an envelope payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Additional authenticated data of a frame: session id, sequence, FIN flag.
#[must_use]
pub fn frame_aad(session_id: &SessionId, seq: u64, fin: bool) -> [u8; FRAME_AAD_SIZE] {
    let mut aad = [0u8; FRAME_AAD_SIZE];
    aad[..16].copy_from_slice(session_id);
    aad[16..24].copy_from_slice(&seq.to_le_bytes());
    aad[24] = u8::from(fin);
    aad
}
