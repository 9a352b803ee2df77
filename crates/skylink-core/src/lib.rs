//! # SKYLINK Core
//!
//! Relay-mediated communication between independent clouds.
//!
//! This crate provides:
//! - Global service discovery: bounded fan-out of discovery polls to every
//!   candidate cloud through its relay, aggregated within a deadline
//! - Provider matchmaking over the discovery results
//! - Encrypted tunnels to a chosen remote provider through the same relays
//! - Error types and configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     InterCloudOrchestrator                       │
//! │   (discovery -> authorization -> matchmaking -> store)           │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │   Gatekeeper / Fanout          │   TunnelBroker / Responder     │
//! │   (PollTask per target cloud)  │   (Open/Accept, sealed frames) │
//! ├────────────────────────────────┴────────────────────────────────┤
//! │                       RelaySessionCache                          │
//! │   (one shared session per relay address:port)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod queues;

pub use config::{GatekeeperConfig, GatewayConfig, MatchmakingConfig, SkylinkConfig};
pub use error::{Error, Result};
pub use gatekeeper::{FanoutCoordinator, Gatekeeper, GsdOutcome, PollResponder, PollTask};
pub use gateway::{
    GatewayConnectionRequest, IncomingTunnel, TunnelBroker, TunnelResponder, TunnelState,
    TunnelStream,
};
pub use model::{
    Cloud, CloudIdentity, PollAnswer, PollFailure, PollRequest, PollResult, PreferredProvider,
    Relay, RelayType, ServiceQuery, SessionId, SystemDescriptor,
};
pub use orchestrator::{
    InterCloudOrchestrator, MatchmakingStrategy, ProviderMatchmaker, SelectionOutcome,
};
