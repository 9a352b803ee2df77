//! Configuration system for the SKYLINK CLI.

use serde::{Deserialize, Serialize};
use skylink_core::gatekeeper::{ServiceOffer, StaticServiceRegistry};
use skylink_core::{
    Cloud, CloudIdentity, GatekeeperConfig, GatewayConfig, MatchmakingConfig, MatchmakingStrategy,
    Relay, RelayType, SkylinkConfig, SystemDescriptor,
};
use skylink_crypto::TunnelKeypair;
use skylink_crypto::x25519::PrivateKey;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

/// SKYLINK configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// The local cloud
    pub node: NodeConfig,
    /// Relays of the local cloud
    pub relays: Vec<RelayEntry>,
    /// Neighbor clouds polled during discovery
    pub clouds: Vec<CloudEntry>,
    /// Services this cloud offers
    pub services: Vec<ServiceEntry>,
    /// Discovery fan-out
    pub gatekeeper: GatekeeperSection,
    /// Relay tunnels
    pub gateway: GatewaySection,
    /// Provider selection
    pub matchmaking: MatchmakingSection,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local cloud identity and key material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cloud name
    #[serde(default = "default_cloud_name")]
    pub cloud_name: String,
    /// Cloud operator
    #[serde(default = "default_operator")]
    pub operator: String,
    /// Gateway private key file
    #[serde(default = "default_key_path")]
    pub key_file: PathBuf,
    /// Secret other clouds must present with their polls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_info: Option<String>,
}

/// A relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    /// Host name or address
    pub address: String,
    /// Port
    pub port: u16,
    /// Whether the relay transport is secured
    #[serde(default)]
    pub secure: bool,
    /// `GATEKEEPER_RELAY`, `GATEWAY_RELAY` or `GENERAL_RELAY`
    #[serde(rename = "type", default = "default_relay_type")]
    pub relay_type: String,
}

/// A neighbor cloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudEntry {
    /// Cloud name
    pub name: String,
    /// Cloud operator
    pub operator: String,
    /// Secret presented with polls to this cloud
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication_info: Option<String>,
    /// Whether the cloud requires secure transport
    #[serde(default)]
    pub secure: bool,
    /// Relays the cloud can be reached through
    #[serde(default)]
    pub relays: Vec<RelayEntry>,
}

/// A service offered by the local cloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Service definition
    pub definition: String,
    /// Interfaces the service is offered on
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Service metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Systems providing the service
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

/// A provider system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// System name
    pub system_name: String,
    /// Address
    pub address: String,
    /// Port
    pub port: u16,
}

/// Discovery fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperSection {
    /// Concurrent poll workers
    pub max_pool_size: usize,
    /// Poll tasks that may wait for a worker
    pub queue_capacity: usize,
    /// Single poll budget in seconds
    pub poll_timeout_secs: u64,
    /// Whole fan-out budget in seconds
    pub fanout_deadline_secs: u64,
}

/// Tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Open/Accept budget in seconds
    pub handshake_timeout_secs: u64,
    /// Idle timeout in seconds
    pub socket_timeout_secs: u64,
    /// Plaintext bytes per frame
    pub chunk_size: usize,
    /// Address local tunnel ports are bound on
    pub bind_address: IpAddr,
    /// Lowest local tunnel port
    pub port_min: u16,
    /// Highest local tunnel port
    pub port_max: u16,
    /// Refuse relays not flagged secure
    pub require_secure_relay: bool,
}

/// Provider selection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchmakingSection {
    /// `first-match` or `random-fallback`
    pub strategy: MatchmakingStrategy,
    /// Record no selection instead of falling back
    pub store_on_no_match: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_cloud_name() -> String {
    "localcloud".to_string()
}

fn default_operator() -> String {
    "local".to_string()
}

fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".skylink/gateway_key")
}

fn default_relay_type() -> String {
    RelayType::GeneralRelay.as_str().to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cloud_name: default_cloud_name(),
            operator: default_operator(),
            key_file: default_key_path(),
            authentication_info: None,
        }
    }
}

impl Default for GatekeeperSection {
    fn default() -> Self {
        let core = GatekeeperConfig::default();
        Self {
            max_pool_size: core.max_pool_size,
            queue_capacity: core.queue_capacity,
            poll_timeout_secs: core.poll_timeout.as_secs(),
            fanout_deadline_secs: core.fanout_deadline.as_secs(),
        }
    }
}

impl Default for GatewaySection {
    fn default() -> Self {
        let core = GatewayConfig::default();
        Self {
            handshake_timeout_secs: core.handshake_timeout.as_secs(),
            socket_timeout_secs: core.socket_timeout.as_secs(),
            chunk_size: core.chunk_size,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_min: *core.port_range.start(),
            port_max: *core.port_range.end(),
            require_secure_relay: core.require_secure_relay,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RelayEntry {
    /// Convert to a core relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay type is unknown.
    pub fn to_relay(&self) -> anyhow::Result<Relay> {
        let relay_type: RelayType = self.relay_type.parse()?;
        Ok(Relay::new(
            self.address.clone(),
            self.port,
            self.secure,
            relay_type,
        ))
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("skylink/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Identity of the local cloud.
    #[must_use]
    pub fn identity(&self) -> CloudIdentity {
        CloudIdentity::new(&self.node.cloud_name, &self.node.operator)
    }

    /// Relays of the local cloud.
    ///
    /// # Errors
    ///
    /// Returns an error if a relay type is unknown.
    pub fn local_relays(&self) -> anyhow::Result<Vec<Relay>> {
        self.relays.iter().map(RelayEntry::to_relay).collect()
    }

    /// Neighbor clouds as discovery targets.
    ///
    /// # Errors
    ///
    /// Returns an error if a relay type is unknown.
    pub fn clouds(&self) -> anyhow::Result<Vec<Cloud>> {
        self.clouds
            .iter()
            .map(|entry| {
                let mut cloud = Cloud::new(CloudIdentity::new(&entry.name, &entry.operator));
                cloud.secure = entry.secure;
                cloud.authentication_info = entry.authentication_info.clone();
                for relay in &entry.relays {
                    cloud = cloud.with_relay(relay.to_relay()?);
                }
                Ok(cloud)
            })
            .collect()
    }

    /// Registry answering polls for the configured services.
    #[must_use]
    pub fn service_registry(&self) -> StaticServiceRegistry {
        self.services
            .iter()
            .fold(StaticServiceRegistry::new(), |registry, service| {
                registry.with_service(
                    &service.definition,
                    ServiceOffer {
                        providers: service
                            .providers
                            .iter()
                            .map(|p| SystemDescriptor::new(&p.system_name, &p.address, p.port))
                            .collect(),
                        interfaces: service.interfaces.clone(),
                        metadata: service.metadata.clone(),
                    },
                )
            })
    }

    /// Core configuration.
    #[must_use]
    pub fn to_core(&self) -> SkylinkConfig {
        SkylinkConfig {
            gatekeeper: GatekeeperConfig {
                max_pool_size: self.gatekeeper.max_pool_size,
                queue_capacity: self.gatekeeper.queue_capacity,
                poll_timeout: Duration::from_secs(self.gatekeeper.poll_timeout_secs),
                fanout_deadline: Duration::from_secs(self.gatekeeper.fanout_deadline_secs),
            },
            gateway: GatewayConfig {
                handshake_timeout: Duration::from_secs(self.gateway.handshake_timeout_secs),
                socket_timeout: Duration::from_secs(self.gateway.socket_timeout_secs),
                chunk_size: self.gateway.chunk_size,
                bind_address: self.gateway.bind_address,
                port_range: self.gateway.port_min..=self.gateway.port_max,
                require_secure_relay: self.gateway.require_secure_relay,
            },
            matchmaking: MatchmakingConfig {
                strategy: self.matchmaking.strategy,
                store_on_no_match: self.matchmaking.store_on_no_match,
            },
        }
    }

    /// Read the gateway keypair from `node.key_file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or not a 32-byte key.
    pub fn load_keypair(&self) -> anyhow::Result<TunnelKeypair> {
        let bytes = Zeroizing::new(fs::read(&self.node.key_file).map_err(|e| {
            anyhow::anyhow!(
                "cannot read key file {}: {} (run `skylink keygen`)",
                self.node.key_file.display(),
                e
            )
        })?);
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "key file {} must hold exactly 32 bytes",
                self.node.key_file.display()
            )
        })?;
        let key = Zeroizing::new(key);
        Ok(TunnelKeypair::from_private(PrivateKey::from_bytes(*key)))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.cloud_name.trim().is_empty() || self.node.operator.trim().is_empty() {
            anyhow::bail!("node.cloud_name and node.operator must not be empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        for relay in &self.relays {
            validate_relay(relay, "Local relay")?;
        }

        let mut seen = HashSet::new();
        for cloud in &self.clouds {
            if cloud.name.trim().is_empty() || cloud.operator.trim().is_empty() {
                anyhow::bail!("Cloud entries need a name and an operator");
            }
            if !seen.insert((&cloud.name, &cloud.operator)) {
                anyhow::bail!("Cloud {}.{} listed twice", cloud.name, cloud.operator);
            }
            for relay in &cloud.relays {
                validate_relay(relay, &format!("Relay of {}.{}", cloud.name, cloud.operator))?;
            }
        }

        for service in &self.services {
            if service.definition.trim().is_empty() {
                anyhow::bail!("Service entries need a definition");
            }
            for provider in &service.providers {
                if provider.system_name.is_empty() || provider.address.is_empty() || provider.port == 0
                {
                    anyhow::bail!(
                        "Provider '{}' of service '{}' needs a name, address and port",
                        provider.system_name,
                        service.definition
                    );
                }
            }
        }

        self.to_core().validate()?;
        Ok(())
    }
}

fn validate_relay(relay: &RelayEntry, name: &str) -> anyhow::Result<()> {
    let host = &relay.address;
    if host.is_empty() {
        anyhow::bail!("{} has empty address", name);
    }
    if host.contains("..") || host.contains('/') || host.contains('\\') {
        anyhow::bail!("{} '{}' contains invalid characters", name, host);
    }
    if relay.port == 0 {
        anyhow::bail!("{} '{}' has invalid port: 0", name, host);
    }
    relay
        .relay_type
        .parse::<RelayType>()
        .map_err(|e| anyhow::anyhow!("{} '{}': {}", name, host, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[node]
cloud_name = "testcloud1"
operator = "aitia"

[[relays]]
address = "relay.aitia.example"
port = 61616

[[clouds]]
name = "testcloud2"
operator = "elte"
authentication_info = "s3cret"

[[clouds.relays]]
address = "relay.elte.example"
port = 61617
type = "GATEKEEPER_RELAY"

[[services]]
definition = "temperature"
interfaces = ["HTTP-SECURE-JSON"]

[[services.providers]]
system_name = "sensor"
address = "10.0.0.5"
port = 8443

[gateway]
port_min = 9000
port_max = 9010

[matchmaking]
strategy = "random-fallback"
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gatekeeper.max_pool_size, 20);
        assert_eq!(config.gateway.chunk_size, 16 * 1024);
        assert_eq!((config.gateway.port_min, config.gateway.port_max), (8000, 8100));
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sample_parses() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.identity(), CloudIdentity::new("testcloud1", "aitia"));
        let clouds = config.clouds().unwrap();
        assert_eq!(clouds.len(), 1);
        assert_eq!(clouds[0].authentication_info.as_deref(), Some("s3cret"));
        assert_eq!(clouds[0].relays[0].relay_type, RelayType::GatekeeperRelay);
        assert_eq!(
            config.local_relays().unwrap()[0].relay_type,
            RelayType::GeneralRelay
        );

        let core = config.to_core();
        assert_eq!(core.gateway.port_range, 9000..=9010);
        assert_eq!(core.matchmaking.strategy, MatchmakingStrategy::RandomFallback);
        assert_eq!(core.gatekeeper.poll_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validation() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.clouds[0].relays[0].relay_type = "CARRIER_PIGEON".into();
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.clouds.push(config.clouds[0].clone());
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.gateway.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(deserialized.clouds[0].relays, config.clouds[0].relays);
        assert_eq!(deserialized.gateway.port_min, 9000);
        assert_eq!(deserialized.services[0].providers[0].port, 8443);
    }

    #[test]
    fn test_keypair_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.node.key_file = dir.path().join("gateway_key");
        assert!(config.load_keypair().is_err());

        let keypair = TunnelKeypair::generate();
        fs::write(&config.node.key_file, keypair.private_key().to_bytes()).unwrap();
        assert_eq!(
            config.load_keypair().unwrap().public_key(),
            keypair.public_key()
        );

        fs::write(&config.node.key_file, [0u8; 5]).unwrap();
        assert!(config.load_keypair().is_err());
    }
}
