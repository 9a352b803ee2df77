//! Clouds, relays and discovery data.

use serde::{Deserialize, Serialize};
use skylink_relay::RelayKey;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tunnel session identifier.
pub type SessionId = [u8; skylink_crypto::SESSION_ID_SIZE];

/// Identity of a cloud: `(name, operator)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CloudIdentity {
    /// Cloud name
    pub name: String,
    /// Operator running the cloud
    pub operator: String,
}

impl CloudIdentity {
    /// Create a cloud identity.
    #[must_use]
    pub fn new(name: impl Into<String>, operator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator: operator.into(),
        }
    }
}

impl fmt::Display for CloudIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.operator)
    }
}

/// What a relay may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayType {
    /// Discovery traffic only
    GatekeeperRelay,
    /// Tunnel traffic only
    GatewayRelay,
    /// Both
    GeneralRelay,
}

impl RelayType {
    /// Upper snake case name, as used in configuration files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RelayType::GatekeeperRelay => "GATEKEEPER_RELAY",
            RelayType::GatewayRelay => "GATEWAY_RELAY",
            RelayType::GeneralRelay => "GENERAL_RELAY",
        }
    }

    /// Whether discovery polls may use this relay.
    #[must_use]
    pub fn carries_discovery(self) -> bool {
        matches!(self, RelayType::GatekeeperRelay | RelayType::GeneralRelay)
    }

    /// Whether tunnels may use this relay.
    #[must_use]
    pub fn carries_tunnels(self) -> bool {
        matches!(self, RelayType::GatewayRelay | RelayType::GeneralRelay)
    }
}

impl fmt::Display for RelayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown relay type string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown relay type '{0}'")]
pub struct UnknownRelayType(pub String);

impl FromStr for RelayType {
    type Err = UnknownRelayType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "GATEKEEPER_RELAY" | "GATEKEEPER" => Ok(RelayType::GatekeeperRelay),
            "GATEWAY_RELAY" | "GATEWAY" => Ok(RelayType::GatewayRelay),
            "GENERAL_RELAY" | "GENERAL" => Ok(RelayType::GeneralRelay),
            _ => Err(UnknownRelayType(s.to_string())),
        }
    }
}

/// A relay broker endpoint, unique by `(address, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Broker host
    pub address: String,
    /// Broker port
    pub port: u16,
    /// Whether the transport to the broker must be secured
    pub secure: bool,
    /// Allowed traffic
    pub relay_type: RelayType,
}

impl Relay {
    /// Create a relay record.
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16, secure: bool, relay_type: RelayType) -> Self {
        Self {
            address: address.into(),
            port,
            secure,
            relay_type,
        }
    }

    /// Cache key of this relay.
    #[must_use]
    pub fn key(&self) -> RelayKey {
        RelayKey::new(self.address.clone(), self.port)
    }
}

/// A remote cloud and the relays it can be reached through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cloud {
    /// Identity of the cloud
    pub identity: CloudIdentity,
    /// Credentials sent with every discovery poll to this cloud
    pub authentication_info: Option<String>,
    /// Whether the cloud requires secure relays
    pub secure: bool,
    /// Relays in preference order
    pub relays: Vec<Relay>,
}

impl Cloud {
    /// Create a cloud with no relays.
    #[must_use]
    pub fn new(identity: CloudIdentity) -> Self {
        Self {
            identity,
            authentication_info: None,
            secure: false,
            relays: Vec::new(),
        }
    }

    /// Add a relay.
    #[must_use]
    pub fn with_relay(mut self, relay: Relay) -> Self {
        self.relays.push(relay);
        self
    }

    /// Set the credentials sent with discovery polls.
    #[must_use]
    pub fn with_authentication_info(mut self, info: impl Into<String>) -> Self {
        self.authentication_info = Some(info.into());
        self
    }

    /// First relay that can carry discovery traffic.
    #[must_use]
    pub fn discovery_relay(&self) -> Option<&Relay> {
        self.relays.iter().find(|r| r.relay_type.carries_discovery())
    }

    /// First relay that can carry tunnel traffic.
    #[must_use]
    pub fn tunnel_relay(&self) -> Option<&Relay> {
        self.relays.iter().find(|r| r.relay_type.carries_tunnels())
    }
}

/// An application system offering or consuming a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemDescriptor {
    /// System name
    pub system_name: String,
    /// Host the system listens on
    pub address: String,
    /// Port the system listens on
    pub port: u16,
    /// Opaque authentication info of the system
    pub authentication_info: Option<String>,
}

impl SystemDescriptor {
    /// Create a system descriptor.
    #[must_use]
    pub fn new(system_name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            system_name: system_name.into(),
            address: address.into(),
            port,
            authentication_info: None,
        }
    }

    /// True when name, address and port are equal.
    #[must_use]
    pub fn same_endpoint(&self, other: &SystemDescriptor) -> bool {
        self.system_name == other.system_name
            && self.address == other.address
            && self.port == other.port
    }
}

/// The service being looked for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceQuery {
    /// Service definition name
    pub service_definition: String,
    /// Acceptable interfaces; empty accepts any
    pub interface_requirements: Vec<String>,
    /// Metadata the provider must carry
    pub metadata_requirements: BTreeMap<String, String>,
}

impl ServiceQuery {
    /// Query for a service by definition only.
    #[must_use]
    pub fn new(service_definition: impl Into<String>) -> Self {
        Self {
            service_definition: service_definition.into(),
            ..Default::default()
        }
    }

    /// Require one of `interface`.
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface_requirements.push(interface.into());
        self
    }
}

/// A discovery query sent to every candidate cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRequest {
    /// Requested service
    pub query: ServiceQuery,
    /// Cloud asking
    pub requester: CloudIdentity,
    /// Whether the requesting cloud runs a gateway
    pub gateway_is_present: bool,
}

impl PollRequest {
    /// Create a poll request.
    #[must_use]
    pub fn new(query: ServiceQuery, requester: CloudIdentity) -> Self {
        Self {
            query,
            requester,
            gateway_is_present: false,
        }
    }

    /// Mark the requesting cloud as running a gateway.
    #[must_use]
    pub fn with_gateway(mut self) -> Self {
        self.gateway_is_present = true;
        self
    }
}

/// A remote cloud's answer to a discovery query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollAnswer {
    /// Answering cloud
    pub provider_cloud: CloudIdentity,
    /// Service definition that was matched
    pub service_definition: String,
    /// Systems offering the service
    pub providers: Vec<SystemDescriptor>,
    /// Interfaces the service is offered on
    pub interfaces: Vec<String>,
    /// Base64 tunnel public key of the provider's gateway, if any
    pub gateway_public_key: Option<String>,
}

impl PollAnswer {
    /// True when `system` is among the offering providers.
    #[must_use]
    pub fn offers(&self, system: &SystemDescriptor) -> bool {
        self.providers.iter().any(|p| p.same_endpoint(system))
    }
}

/// Why a single poll target produced no answer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PollFailure {
    /// No session to the target's relay
    #[error("relay unreachable: {0}")]
    RelayUnreachable(String),
    /// No reply within the budget
    #[error("timed out")]
    Timeout,
    /// The worker pool refused the task
    #[error("rejected: {0}")]
    Rejected(String),
    /// Relay publish/subscribe failed or the reply was undecodable
    #[error("transport error: {0}")]
    Transport(String),
    /// The remote gatekeeper answered with an error
    #[error("remote error: {0}")]
    Remote(String),
}

/// Outcome of polling one target cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    /// Polled cloud
    pub cloud: CloudIdentity,
    /// Answer or failure
    pub outcome: Result<PollAnswer, PollFailure>,
}

impl PollResult {
    /// Successful result.
    #[must_use]
    pub fn success(cloud: CloudIdentity, answer: PollAnswer) -> Self {
        Self {
            cloud,
            outcome: Ok(answer),
        }
    }

    /// Failed result.
    #[must_use]
    pub fn failure(cloud: CloudIdentity, failure: PollFailure) -> Self {
        Self {
            cloud,
            outcome: Err(failure),
        }
    }

    /// True when the target answered.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The answer, if any.
    #[must_use]
    pub fn answer(&self) -> Option<&PollAnswer> {
        self.outcome.as_ref().ok()
    }

    /// The failure, if any.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&PollFailure> {
        self.outcome.as_ref().err()
    }
}

/// A provider the caller would rather use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredProvider {
    /// Provider cloud
    pub cloud: CloudIdentity,
    /// Specific system inside that cloud, if any
    pub system: Option<SystemDescriptor>,
}

impl PreferredProvider {
    /// Prefer any system of `cloud`.
    #[must_use]
    pub fn cloud(cloud: CloudIdentity) -> Self {
        Self { cloud, system: None }
    }

    /// Prefer one system of `cloud`.
    #[must_use]
    pub fn system(cloud: CloudIdentity, system: SystemDescriptor) -> Self {
        Self {
            cloud,
            system: Some(system),
        }
    }

    /// Whether `answer` satisfies this preference.
    #[must_use]
    pub fn matches(&self, answer: &PollAnswer) -> bool {
        if self.cloud != answer.provider_cloud {
            return false;
        }
        match &self.system {
            Some(system) => answer.offers(system),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(cloud: &str, systems: &[(&str, u16)]) -> PollAnswer {
        PollAnswer {
            provider_cloud: CloudIdentity::new(cloud, "op"),
            service_definition: "temperature".into(),
            providers: systems
                .iter()
                .map(|(name, port)| SystemDescriptor::new(*name, "10.0.0.1", *port))
                .collect(),
            interfaces: vec!["HTTP-SECURE-JSON".into()],
            gateway_public_key: None,
        }
    }

    #[test]
    fn test_cloud_identity_display() {
        assert_eq!(CloudIdentity::new("testcloud1", "aitia").to_string(), "testcloud1.aitia");
    }

    #[test]
    fn test_relay_type_parsing() {
        assert_eq!("GATEWAY_RELAY".parse::<RelayType>(), Ok(RelayType::GatewayRelay));
        assert_eq!("general".parse::<RelayType>(), Ok(RelayType::GeneralRelay));
        assert_eq!(
            "gatekeeper-relay".parse::<RelayType>(),
            Ok(RelayType::GatekeeperRelay)
        );
        assert!("".parse::<RelayType>().is_err());
        assert!("MQTT".parse::<RelayType>().is_err());
    }

    #[test]
    fn test_relay_type_capabilities() {
        assert!(RelayType::GatekeeperRelay.carries_discovery());
        assert!(!RelayType::GatekeeperRelay.carries_tunnels());
        assert!(!RelayType::GatewayRelay.carries_discovery());
        assert!(RelayType::GeneralRelay.carries_discovery());
        assert!(RelayType::GeneralRelay.carries_tunnels());
    }

    #[test]
    fn test_cloud_relay_selection() {
        let cloud = Cloud::new(CloudIdentity::new("c", "o"))
            .with_relay(Relay::new("gw", 1, false, RelayType::GatewayRelay))
            .with_relay(Relay::new("gk", 2, false, RelayType::GatekeeperRelay))
            .with_relay(Relay::new("any", 3, false, RelayType::GeneralRelay));

        assert_eq!(cloud.discovery_relay().map(|r| r.port), Some(2));
        assert_eq!(cloud.tunnel_relay().map(|r| r.port), Some(1));
        assert!(Cloud::new(CloudIdentity::new("c", "o")).discovery_relay().is_none());
    }

    #[test]
    fn test_preferred_cloud_match() {
        let pref = PreferredProvider::cloud(CloudIdentity::new("b", "op"));
        assert!(pref.matches(&answer("b", &[("sensor", 80)])));
        assert!(!pref.matches(&answer("a", &[("sensor", 80)])));
    }

    #[test]
    fn test_preferred_system_match() {
        let pref = PreferredProvider::system(
            CloudIdentity::new("b", "op"),
            SystemDescriptor::new("sensor", "10.0.0.1", 80),
        );
        assert!(pref.matches(&answer("b", &[("other", 81), ("sensor", 80)])));
        assert!(!pref.matches(&answer("b", &[("sensor", 81)])));
    }

    #[test]
    fn test_poll_result_accessors() {
        let ok = PollResult::success(CloudIdentity::new("a", "op"), answer("a", &[]));
        assert!(ok.is_success());
        assert!(ok.answer().is_some());
        assert!(ok.failure_reason().is_none());

        let failed = PollResult::failure(CloudIdentity::new("a", "op"), PollFailure::Timeout);
        assert!(!failed.is_success());
        assert_eq!(failed.failure_reason(), Some(&PollFailure::Timeout));
    }
}
