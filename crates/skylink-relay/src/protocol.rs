//! Relay envelope and error definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Relay identity: unique by `address:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelayKey {
    /// Host name or IP address of the broker
    pub address: String,
    /// Broker port
    pub port: u16,
}

impl RelayKey {
    /// Create a relay key.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for RelayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Message as stored and forwarded by a relay broker.
///
/// The broker never looks inside `payload`: discovery traffic carries
/// plaintext bincode, tunnel traffic carries sealed frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayEnvelope {
    /// Request/reply correlation
    pub correlation_id: u64,
    /// Sending cloud, as `name.operator`
    pub sender: String,
    /// Queue the receiver should answer on
    pub reply_to: Option<String>,
    /// Authentication info of the sender, checked by the receiving cloud
    pub credentials: Option<String>,
    /// Opaque payload
    pub payload: Vec<u8>,
}

impl RelayEnvelope {
    /// Create an envelope with no reply queue and no credentials.
    #[must_use]
    pub fn new(correlation_id: u64, sender: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            correlation_id,
            sender: sender.into(),
            reply_to: None,
            credentials: None,
            payload,
        }
    }

    /// Set the reply queue.
    #[must_use]
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Attach sender credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Option<String>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Serialize envelope to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serialize(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Deserialize envelope from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        bincode::deserialize(bytes).map_err(|e| RelayError::Deserialization(e.to_string()))
    }
}

/// Error codes a relay server reports to its clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorCode {
    /// Client not registered with relay
    NotRegistered = 1,
    /// Rate limit exceeded
    RateLimited = 2,
    /// Invalid message format
    InvalidMessage = 3,
    /// Server at capacity
    ServerFull = 4,
    /// Queue backlog full, message dropped
    QueueFull = 5,
    /// Internal server error
    InternalError = 6,
}

/// Relay errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Connect attempt refused or unanswered
    #[error("cannot connect to relay {relay}: {reason}")]
    ConnectFailed {
        /// Relay that was dialled
        relay: RelayKey,
        /// Underlying cause
        reason: String,
    },

    /// Operation timed out
    #[error("relay operation timed out")]
    Timeout,

    /// Session already closed
    #[error("relay session closed")]
    Closed,

    /// Transport security requested that this connector cannot provide
    #[error("relay {0} requires a secure transport this connector does not support")]
    SecureTransportUnsupported(RelayKey),

    /// Message larger than the transport allows
    #[error("message of {size} bytes exceeds relay limit of {limit} bytes")]
    MessageTooLarge {
        /// Encoded size
        size: usize,
        /// Transport limit
        limit: usize,
    },

    /// Error reported by the relay server
    #[error("relay server error {code:?}: {message}")]
    Server {
        /// Error code
        code: RelayErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}
