//! # SKYLINK Relay
//!
//! Relay broker plumbing shared by the gatekeeper and the gateway.
//!
//! Clouds never talk to each other directly: every request, reply and
//! tunnel frame is an envelope published to a named queue on a relay
//! broker. This crate provides:
//!
//! - [`RelayConnector`] / [`RelaySession`]: the broker abstraction
//! - [`RelaySessionCache`]: one shared session per `address:port`
//! - [`MemoryBroker`]: an in-process broker with fault injection
//! - [`udp`]: a standalone store-and-forward relay server and its client

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod udp;

pub use cache::{RelaySessionCache, SessionLease};
pub use memory::MemoryBroker;
pub use protocol::{RelayEnvelope, RelayError, RelayErrorCode, RelayKey};
pub use session::{RelayConnector, RelaySession, Subscription};
pub use udp::{UdpConnector, UdpRelayServer, UdpRelayServerConfig};

/// Default relay server port
pub const DEFAULT_RELAY_PORT: u16 = 61616;
