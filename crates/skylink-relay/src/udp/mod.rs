//! Store-and-forward relay over UDP.
//!
//! A small standalone broker: clients register, subscribe to named queues
//! and publish envelopes to them. The server holds envelopes for queues
//! without a consumer and forwards them once one subscribes.
//!
//! ```text
//! Client A              Relay Server              Client B
//!    |--- Register --------->|<-------- Register ------|
//!    |<-- RegisterAck -------|-------- RegisterAck --->|
//!    |                       |<------- Subscribe(q) ---|
//!    |--- Publish(q, env) -->|                         |
//!    |                       |-------- Deliver(q, env)>|
//!    |                       |<------- Unsubscribe(q) -|
//! ```
//!
//! Datagrams are not retransmitted; payloads that need ordering or
//! duplicate suppression carry their own sequence numbers.

pub mod client;
pub mod server;

pub use client::{UdpConnector, UdpSession};
pub use server::{UdpRelayServer, UdpRelayServerConfig};

use crate::protocol::{RelayEnvelope, RelayError, RelayErrorCode};
use serde::{Deserialize, Serialize};

/// Largest encoded frame that fits a single UDP datagram.
pub const MAX_FRAME_SIZE: usize = 65_507;

/// Client identifier announced at registration.
pub type ClientId = [u8; 16];

/// Frames exchanged between relay clients and the relay server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayFrame {
    /// Client registers with relay
    Register {
        /// Random per-connection identifier
        client_id: ClientId,
    },

    /// Relay acknowledges registration
    RegisterAck {
        /// Relay's unique identifier
        relay_id: [u8; 32],
        /// Whether registration succeeded
        success: bool,
        /// Optional error message
        error: Option<String>,
    },

    /// Client becomes the consumer of a queue
    Subscribe {
        /// Queue name
        queue: String,
    },

    /// Client stops consuming a queue
    Unsubscribe {
        /// Queue name
        queue: String,
    },

    /// Client publishes to a queue
    Publish {
        /// Queue name
        queue: String,
        /// Envelope to store or forward
        envelope: RelayEnvelope,
    },

    /// Relay hands an envelope to the queue consumer
    Deliver {
        /// Queue name
        queue: String,
        /// Delivered envelope
        envelope: RelayEnvelope,
    },

    /// Keepalive message (no payload)
    Keepalive,

    /// Client disconnects from relay
    Disconnect,

    /// Relay error response
    Error {
        /// Error code
        code: RelayErrorCode,
        /// Human-readable error message
        message: String,
    },
}

impl RelayFrame {
    /// Serialize frame to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serialize(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Deserialize frame from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        bincode::deserialize(bytes).map_err(|e| RelayError::Deserialization(e.to_string()))
    }

    /// Get the frame type name
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            RelayFrame::Register { .. } => "Register",
            RelayFrame::RegisterAck { .. } => "RegisterAck",
            RelayFrame::Subscribe { .. } => "Subscribe",
            RelayFrame::Unsubscribe { .. } => "Unsubscribe",
            RelayFrame::Publish { .. } => "Publish",
            RelayFrame::Deliver { .. } => "Deliver",
            RelayFrame::Keepalive => "Keepalive",
            RelayFrame::Disconnect => "Disconnect",
            RelayFrame::Error { .. } => "Error",
        }
    }
}
