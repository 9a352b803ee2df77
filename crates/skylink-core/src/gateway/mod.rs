//! Relay tunnels between a local consumer and a remote provider.
//!
//! The consumer side ([`TunnelBroker`]) validates a
//! [`GatewayConnectionRequest`], sends `Open` to the provider cloud's gateway
//! control queue and, after the key exchange, hands back a [`TunnelStream`].
//! The provider side ([`TunnelResponder`]) answers `Open` requests and
//! bridges each tunnel to the requested provider system.
//!
//! Tunnel data is sealed with XChaCha20-Poly1305 under per-direction keys
//! derived from an X25519 exchange between the consumer's ephemeral key and
//! both the ephemeral and static keys of the provider gateway.

pub mod broker;
pub mod protocol;
pub mod responder;
pub mod tunnel;
pub mod validation;

pub use broker::{ExposedTunnel, TunnelBroker};
pub use protocol::{ControlMessage, OpenTunnel, TunnelFrame};
pub use responder::{IncomingTunnel, TunnelResponder};
pub use tunnel::{ActiveSession, SessionRegistry, TunnelState, TunnelStream};
pub use validation::{GatewayConnectionRequest, RelaySpec, ValidatedRequest};
