//! Configuration for the gatekeeper, gateway and matchmaking.

use crate::error::{Error, Result};
use crate::orchestrator::MatchmakingStrategy;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Largest tunnel chunk that still fits a relay datagram after sealing.
pub const MAX_CHUNK_SIZE: usize = 60 * 1024;

/// Default worker pool bound for discovery fan-out.
pub const DEFAULT_MAX_POOL_SIZE: usize = 20;

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct SkylinkConfig {
    /// Discovery fan-out
    pub gatekeeper: GatekeeperConfig,
    /// Relay tunnels
    pub gateway: GatewayConfig,
    /// Provider selection
    pub matchmaking: MatchmakingConfig,
}

impl SkylinkConfig {
    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.gatekeeper.validate()?;
        self.gateway.validate()?;
        Ok(())
    }
}

/// Discovery fan-out configuration
#[derive(Debug, Clone)]
pub struct GatekeeperConfig {
    /// Upper bound on concurrent poll workers
    pub max_pool_size: usize,
    /// Poll tasks that may wait for a worker before submissions are rejected
    pub queue_capacity: usize,
    /// Budget of a single poll
    pub poll_timeout: Duration,
    /// Budget of a whole fan-out
    pub fanout_deadline: Duration,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            queue_capacity: 64,
            poll_timeout: Duration::from_secs(5),
            fanout_deadline: Duration::from_secs(10),
        }
    }
}

impl GatekeeperConfig {
    fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(Error::invalid_config("gatekeeper.max_pool_size must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::invalid_config("gatekeeper.queue_capacity must be positive"));
        }
        if self.poll_timeout.is_zero() || self.fanout_deadline.is_zero() {
            return Err(Error::invalid_config("gatekeeper timeouts must be positive"));
        }
        Ok(())
    }
}

/// Tunnel configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Budget for the Open/Accept exchange
    pub handshake_timeout: Duration,
    /// Idle time after which a tunnel is torn down
    pub socket_timeout: Duration,
    /// Largest plaintext carried by one frame
    pub chunk_size: usize,
    /// Address `expose_local` listens on
    pub bind_address: IpAddr,
    /// Local ports `expose_local` may bind
    pub port_range: RangeInclusive<u16>,
    /// Refuse relays that are not flagged secure
    pub require_secure_relay: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            socket_timeout: Duration::from_secs(60),
            chunk_size: 16 * 1024,
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: 8000..=8100,
            require_secure_relay: false,
        }
    }
}

impl GatewayConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(
                format!("gateway.chunk_size must be in 1..={MAX_CHUNK_SIZE}").into(),
            ));
        }
        if self.port_range.is_empty() || *self.port_range.start() == 0 {
            return Err(Error::invalid_config(
                "gateway.port_range must be a non-empty range of non-zero ports",
            ));
        }
        if self.handshake_timeout.is_zero() || self.socket_timeout.is_zero() {
            return Err(Error::invalid_config("gateway timeouts must be positive"));
        }
        Ok(())
    }
}

/// Provider selection configuration
#[derive(Debug, Clone, Default)]
pub struct MatchmakingConfig {
    /// Selection policy
    pub strategy: MatchmakingStrategy,
    /// Record "no selection" instead of falling back when nothing preferred answered
    pub store_on_no_match: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SkylinkConfig::default();
        assert_eq!(config.gatekeeper.max_pool_size, 20);
        assert_eq!(config.gatekeeper.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.gateway.chunk_size, 16 * 1024);
        assert_eq!(config.gateway.port_range, 8000..=8100);
        assert!(!config.gateway.require_secure_relay);
        assert_eq!(config.matchmaking.strategy, MatchmakingStrategy::FirstMatch);
        assert!(!config.matchmaking.store_on_no_match);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut config = SkylinkConfig::default();
        config.gatekeeper.max_pool_size = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut config = SkylinkConfig::default();
        config.gateway.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let mut config = SkylinkConfig::default();
        #[allow(clippy::reversed_empty_ranges)]
        {
            config.gateway.port_range = 9000..=8000;
        }
        assert!(config.validate().is_err());

        config.gateway.port_range = 0..=10;
        assert!(config.validate().is_err());
    }
}
