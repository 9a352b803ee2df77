//! Tunnel request validation.
//!
//! Requests arrive loosely typed (from configuration files or the control
//! API) and are checked field by field in a fixed order. The first
//! violation is reported.

use crate::error::{Error, Result};
use crate::model::{CloudIdentity, Relay, RelayType, SystemDescriptor};
use serde::{Deserialize, Serialize};
use skylink_crypto::PublicKey;

/// Relay as given in a connection request, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySpec {
    /// Broker host
    pub address: String,
    /// Broker port, checked against 1..=65535
    pub port: u32,
    /// Whether the transport to the broker must be secured
    pub secure: bool,
    /// Relay type name, e.g. `GATEWAY_RELAY`
    pub relay_type: String,
}

impl From<&Relay> for RelaySpec {
    fn from(relay: &Relay) -> Self {
        Self {
            address: relay.address.clone(),
            port: u32::from(relay.port),
            secure: relay.secure,
            relay_type: relay.relay_type.as_str().to_string(),
        }
    }
}

/// Everything needed to open a tunnel to a remote provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConnectionRequest {
    /// Relay both clouds can reach
    pub relay: Option<RelaySpec>,
    /// Local consumer system
    pub consumer: Option<SystemDescriptor>,
    /// Remote provider system
    pub provider: Option<SystemDescriptor>,
    /// Local cloud
    pub consumer_cloud: Option<CloudIdentity>,
    /// Remote cloud
    pub provider_cloud: Option<CloudIdentity>,
    /// Service the tunnel carries
    pub service_definition: String,
    /// Base64 tunnel public key of the provider cloud's gateway
    pub provider_gateway_public_key: String,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    /// Relay to tunnel through
    pub relay: Relay,
    /// Local consumer system
    pub consumer: SystemDescriptor,
    /// Remote provider system
    pub provider: SystemDescriptor,
    /// Local cloud
    pub consumer_cloud: CloudIdentity,
    /// Remote cloud
    pub provider_cloud: CloudIdentity,
    /// Service the tunnel carries
    pub service_definition: String,
    /// Static key of the provider cloud's gateway
    pub provider_key: PublicKey,
}

impl GatewayConnectionRequest {
    /// Check the request and convert it into typed form.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRequest` naming the first violation.
    pub fn validate(&self) -> Result<ValidatedRequest> {
        let relay = validate_relay(self.relay.as_ref())?;
        let consumer = validate_system(self.consumer.as_ref(), "consumer")?;
        let provider = validate_system(self.provider.as_ref(), "provider")?;
        let consumer_cloud = validate_cloud(self.consumer_cloud.as_ref(), "consumer cloud")?;
        let provider_cloud = validate_cloud(self.provider_cloud.as_ref(), "provider cloud")?;

        if self.service_definition.trim().is_empty() {
            return Err(Error::invalid_request("service definition is empty"));
        }

        if self.provider_gateway_public_key.trim().is_empty() {
            return Err(Error::invalid_request("provider gateway public key is empty"));
        }
        let provider_key = PublicKey::from_base64(self.provider_gateway_public_key.trim())
            .map_err(|e| {
                Error::InvalidRequest(format!("provider gateway public key: {e}").into())
            })?;

        Ok(ValidatedRequest {
            relay,
            consumer,
            provider,
            consumer_cloud,
            provider_cloud,
            service_definition: self.service_definition.trim().to_string(),
            provider_key,
        })
    }
}

fn validate_relay(relay: Option<&RelaySpec>) -> Result<Relay> {
    let Some(relay) = relay else {
        return Err(Error::invalid_request("relay is missing"));
    };
    if relay.address.trim().is_empty() {
        return Err(Error::invalid_request("relay address is empty"));
    }
    let port = match u16::try_from(relay.port) {
        Ok(port) if port != 0 => port,
        _ => {
            return Err(Error::InvalidRequest(
                format!("relay port {} is outside 1-65535", relay.port).into(),
            ));
        }
    };
    let relay_type: RelayType = relay
        .relay_type
        .parse()
        .map_err(|e| Error::InvalidRequest(format!("relay type: {e}").into()))?;
    if !relay_type.carries_tunnels() {
        return Err(Error::InvalidRequest(
            format!("relay type {relay_type} cannot carry tunnels").into(),
        ));
    }

    Ok(Relay::new(relay.address.trim(), port, relay.secure, relay_type))
}

fn validate_system(system: Option<&SystemDescriptor>, what: &str) -> Result<SystemDescriptor> {
    let Some(system) = system else {
        return Err(Error::InvalidRequest(format!("{what} is missing").into()));
    };
    if system.system_name.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{what} system name is empty").into()));
    }
    if system.address.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{what} address is empty").into()));
    }
    if system.port == 0 {
        return Err(Error::InvalidRequest(format!("{what} port is invalid").into()));
    }
    Ok(system.clone())
}

fn validate_cloud(cloud: Option<&CloudIdentity>, what: &str) -> Result<CloudIdentity> {
    let Some(cloud) = cloud else {
        return Err(Error::InvalidRequest(format!("{what} is missing").into()));
    };
    if cloud.operator.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{what} operator is empty").into()));
    }
    if cloud.name.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{what} name is empty").into()));
    }
    Ok(cloud.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skylink_crypto::TunnelKeypair;

    fn valid() -> GatewayConnectionRequest {
        GatewayConnectionRequest {
            relay: Some(RelaySpec {
                address: "relay.example".into(),
                port: 61616,
                secure: false,
                relay_type: "GATEWAY_RELAY".into(),
            }),
            consumer: Some(SystemDescriptor::new("client", "127.0.0.1", 9000)),
            provider: Some(SystemDescriptor::new("sensor", "10.0.0.7", 8443)),
            consumer_cloud: Some(CloudIdentity::new("testcloud1", "aitia")),
            provider_cloud: Some(CloudIdentity::new("testcloud2", "elte")),
            service_definition: "temperature".into(),
            provider_gateway_public_key: TunnelKeypair::generate().public_key().to_base64(),
        }
    }

    fn violation(request: &GatewayConnectionRequest) -> String {
        match request.validate() {
            Err(Error::InvalidRequest(msg)) => msg.into_owned(),
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_request() {
        let validated = valid().validate().unwrap();
        assert_eq!(validated.relay.port, 61616);
        assert_eq!(validated.relay.relay_type, RelayType::GatewayRelay);
        assert_eq!(validated.provider_cloud.name, "testcloud2");
    }

    #[test]
    fn test_missing_relay_reported_first() {
        let mut request = valid();
        request.relay = None;
        request.consumer = None;
        assert_eq!(violation(&request), "relay is missing");
    }

    #[test]
    fn test_relay_checks() {
        let mut request = valid();
        request.relay.as_mut().unwrap().address = " ".into();
        assert_eq!(violation(&request), "relay address is empty");

        let mut request = valid();
        request.relay.as_mut().unwrap().port = 0;
        assert!(violation(&request).contains("outside 1-65535"));

        let mut request = valid();
        request.relay.as_mut().unwrap().port = 70_000;
        assert!(violation(&request).contains("70000"));

        let mut request = valid();
        request.relay.as_mut().unwrap().port = 65_535;
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_relay_type_checks() {
        for bad in ["", "MQTT", "GATEKEEPER_RELAY"] {
            let mut request = valid();
            request.relay.as_mut().unwrap().relay_type = bad.into();
            assert!(violation(&request).starts_with("relay type"), "{bad}");
        }

        let mut request = valid();
        request.relay.as_mut().unwrap().relay_type = "GENERAL_RELAY".into();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_system_checks() {
        let mut request = valid();
        request.consumer = None;
        request.provider = None;
        assert_eq!(violation(&request), "consumer is missing");

        let mut request = valid();
        request.consumer.as_mut().unwrap().address = String::new();
        assert_eq!(violation(&request), "consumer address is empty");

        let mut request = valid();
        request.provider.as_mut().unwrap().system_name = String::new();
        assert_eq!(violation(&request), "provider system name is empty");

        let mut request = valid();
        request.provider.as_mut().unwrap().port = 0;
        assert_eq!(violation(&request), "provider port is invalid");
    }

    #[test]
    fn test_cloud_checks() {
        let mut request = valid();
        request.consumer_cloud.as_mut().unwrap().operator = String::new();
        request.consumer_cloud.as_mut().unwrap().name = String::new();
        assert_eq!(violation(&request), "consumer cloud operator is empty");

        let mut request = valid();
        request.provider_cloud = None;
        assert_eq!(violation(&request), "provider cloud is missing");
    }

    #[test]
    fn test_service_and_key_checks() {
        let mut request = valid();
        request.service_definition = String::new();
        request.provider_gateway_public_key = String::new();
        assert_eq!(violation(&request), "service definition is empty");

        let mut request = valid();
        request.provider_gateway_public_key = String::new();
        assert_eq!(violation(&request), "provider gateway public key is empty");

        let mut request = valid();
        request.provider_gateway_public_key = "bm90IGEga2V5".into();
        assert!(violation(&request).starts_with("provider gateway public key:"));
    }

    proptest::proptest! {
        /// Whatever is missing, the violation reported is the earliest field
        /// in checking order.
        #[test]
        fn test_first_missing_field_reported(missing in proptest::collection::vec(proptest::bool::ANY, 7)) {
            let mut request = valid();
            let expected = [
                "relay is missing",
                "consumer is missing",
                "provider is missing",
                "consumer cloud is missing",
                "provider cloud is missing",
                "service definition is empty",
                "provider gateway public key is empty",
            ];
            if missing[0] { request.relay = None; }
            if missing[1] { request.consumer = None; }
            if missing[2] { request.provider = None; }
            if missing[3] { request.consumer_cloud = None; }
            if missing[4] { request.provider_cloud = None; }
            if missing[5] { request.service_definition.clear(); }
            if missing[6] { request.provider_gateway_public_key.clear(); }

            match missing.iter().position(|&m| m) {
                Some(first) => proptest::prop_assert_eq!(violation(&request), expected[first]),
                None => proptest::prop_assert!(request.validate().is_ok()),
            }
        }
    }
}
