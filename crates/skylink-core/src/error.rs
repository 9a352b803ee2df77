//! Error types for SKYLINK core operations
//!
//! Errors are categorized to support retry decisions:
//!
//! - **Transient**: the relay or network may recover (unreachable relay,
//!   timeouts, I/O failures)
//! - **Permanent**: the caller must change something (invalid request,
//!   invalid configuration, no candidates)
//!
//! Per-target failures during a discovery fan-out are not errors: they are
//! carried as [`PollFailure`](crate::model::PollFailure) data inside the
//! result list.

use crate::model::SessionId;
use skylink_crypto::CryptoError;
use skylink_relay::RelayError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in SKYLINK core operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    // ============ Caller Errors ============
    /// Malformed or incomplete request, first violation found
    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ Relay Errors ============
    /// Relay broker could not be reached
    #[error("Relay unreachable: {0}")]
    RelayUnreachable(String),

    /// Relay operation failed after connect
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    // ============ Discovery Errors ============
    /// Discovery produced no successful answer
    #[error("No candidates: no cloud answered the discovery request")]
    NoCandidates,

    /// A discovery poll exceeded its budget
    #[error("Poll timed out: {0}")]
    PollTimeout(Cow<'static, str>),

    // ============ Tunnel Errors ============
    /// Control handshake or protocol failure after the relay connected
    #[error("Tunnel setup failed: {0}")]
    TunnelSetupFailed(Cow<'static, str>),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// No active tunnel with this id
    #[error("Session not found: {}", hex::encode(.0))]
    SessionNotFound(SessionId),

    // ============ I/O Errors ============
    /// Local socket I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true if this error is transient and may succeed on retry
    ///
    /// Transient errors include:
    /// - Unreachable relays (a different relay may work)
    /// - Relay transport failures
    /// - Poll timeouts
    /// - Local I/O failures
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RelayUnreachable(_) | Error::Relay(_) | Error::PollTimeout(_) | Error::Io(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::InvalidConfig(_)
                | Error::InvalidState(_)
                | Error::SessionNotFound(_)
                | Error::NoCandidates
                | Error::Crypto(_)
        )
    }

    /// Create an invalid request error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_request(context: &'static str) -> Self {
        Error::InvalidRequest(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        Error::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a tunnel setup error with static context (zero allocation)
    #[must_use]
    pub const fn tunnel_setup(context: &'static str) -> Self {
        Error::TunnelSetupFailed(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        Error::InvalidState(Cow::Borrowed(context))
    }

    /// Create a poll timeout error with static context (zero allocation)
    #[must_use]
    pub const fn poll_timeout(context: &'static str) -> Self {
        Error::PollTimeout(Cow::Borrowed(context))
    }

    /// Map a relay connect failure to [`Error::RelayUnreachable`].
    #[must_use]
    pub fn unreachable(err: &RelayError) -> Self {
        Error::RelayUnreachable(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias for SKYLINK core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_request("relay is missing");
        assert_eq!(err.to_string(), "Invalid request: relay is missing");

        let err = Error::SessionNotFound([0xab; 16]);
        assert_eq!(
            err.to_string(),
            "Session not found: abababababababababababababababab"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::RelayUnreachable("relay:1".into()).is_transient());
        assert!(Error::poll_timeout("cloud.op").is_transient());
        assert!(Error::Io("reset".into()).is_transient());

        assert!(Error::invalid_request("x").is_permanent());
        assert!(Error::NoCandidates.is_permanent());
        assert!(Error::invalid_config("x").is_permanent());

        let setup = Error::tunnel_setup("rejected");
        assert!(!setup.is_transient());
        assert!(!setup.is_permanent());
    }

    #[test]
    fn test_from_conversions() {
        let err: Error = RelayError::Timeout.into();
        assert!(matches!(err, Error::Relay(RelayError::Timeout)));

        let err: Error = CryptoError::DecryptionFailed.into();
        assert!(matches!(err, Error::Crypto(_)));

        let err: Error = std::io::Error::other("boom").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_unreachable_mapping() {
        let relay_err = RelayError::ConnectFailed {
            relay: skylink_relay::RelayKey::new("10.1.1.1", 5000),
            reason: "refused".into(),
        };
        let err = Error::unreachable(&relay_err);
        assert!(matches!(err, Error::RelayUnreachable(ref m) if m.contains("10.1.1.1:5000")));
    }
}
