//! Global service discovery across clouds.
//!
//! The [`Gatekeeper`] turns a list of neighbouring clouds into poll targets
//! (one discovery-capable relay per cloud) and runs them through the
//! [`FanoutCoordinator`]. The remote side of every poll is a
//! [`PollResponder`].

pub mod fanout;
pub mod poll;
pub mod pool;

pub use fanout::FanoutCoordinator;
pub use poll::{
    Authenticator, PollReply, PollResponder, PollTask, ServiceDiscovery, ServiceOffer,
    SharedSecret, StaticServiceRegistry,
};
pub use pool::{PoolConfig, PoolError, PoolStats, WorkerPool};

use crate::config::GatekeeperConfig;
use crate::model::{Cloud, PollAnswer, PollFailure, PollRequest, PollResult};
use skylink_relay::RelaySessionCache;
use std::sync::Arc;

/// Aggregated outcome of a global service discovery.
#[derive(Debug, Clone, Default)]
pub struct GsdOutcome {
    /// One result per polled cloud, in completion order
    pub results: Vec<PollResult>,
}

impl GsdOutcome {
    /// Successful answers in result order.
    pub fn answers(&self) -> impl Iterator<Item = &PollAnswer> {
        self.results.iter().filter_map(PollResult::answer)
    }

    /// Number of clouds that answered.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// Number of clouds that did not answer.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    /// True when nobody answered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.success_count() == 0
    }
}

/// Entry point for discovery polls.
pub struct Gatekeeper {
    fanout: FanoutCoordinator,
    config: GatekeeperConfig,
}

impl Gatekeeper {
    /// Gatekeeper dialling relays through `cache`.
    #[must_use]
    pub fn new(cache: Arc<RelaySessionCache>, config: GatekeeperConfig) -> Self {
        Self {
            fanout: FanoutCoordinator::new(cache, config.clone()),
            config,
        }
    }

    /// Poll every cloud for `request` within the configured deadline.
    ///
    /// Clouds without a discovery-capable relay fail immediately with
    /// `RelayUnreachable`.
    pub async fn global_service_discovery(
        &self,
        clouds: &[Cloud],
        request: PollRequest,
    ) -> GsdOutcome {
        let mut results = Vec::new();
        let mut targets = Vec::with_capacity(clouds.len());

        for cloud in clouds {
            match cloud.discovery_relay() {
                Some(relay) => targets.push((cloud.clone(), relay.clone())),
                None => {
                    tracing::warn!("{} has no gatekeeper relay, skipped", cloud.identity);
                    results.push(PollResult::failure(
                        cloud.identity.clone(),
                        PollFailure::RelayUnreachable("no gatekeeper relay configured".into()),
                    ));
                }
            }
        }

        results.extend(
            self.fanout
                .poll(targets, Arc::new(request), self.config.fanout_deadline)
                .await,
        );
        GsdOutcome { results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CloudIdentity, Relay, RelayType, ServiceQuery, SystemDescriptor};
    use skylink_relay::{MemoryBroker, RelayConnector};
    use std::time::Duration;

    #[tokio::test]
    async fn test_global_service_discovery() {
        let broker = MemoryBroker::new();
        let shared = Relay::new("relay", 5000, false, RelayType::GeneralRelay);
        let gateway_only = Relay::new("relay", 6000, false, RelayType::GatewayRelay);

        let provider = Cloud::new(CloudIdentity::new("provider", "elte")).with_relay(shared.clone());
        let unreachable =
            Cloud::new(CloudIdentity::new("lonely", "elte")).with_relay(gateway_only);

        let registry = StaticServiceRegistry::new().with_service(
            "temperature",
            ServiceOffer {
                providers: vec![SystemDescriptor::new("sensor", "10.0.0.7", 8443)],
                interfaces: vec!["HTTP-SECURE-JSON".into()],
                ..Default::default()
            },
        );
        Arc::new(PollResponder::new(provider.identity.clone(), Arc::new(registry)))
            .spawn(broker.connect(&shared.key(), false).await.unwrap());

        let gatekeeper = Gatekeeper::new(
            RelaySessionCache::new(Arc::new(broker.clone())),
            GatekeeperConfig {
                fanout_deadline: Duration::from_secs(2),
                ..Default::default()
            },
        );
        let outcome = gatekeeper
            .global_service_discovery(
                &[provider, unreachable],
                PollRequest::new(
                    ServiceQuery::new("temperature"),
                    CloudIdentity::new("consumer", "aitia"),
                ),
            )
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.success_count(), 1);
        assert_eq!(outcome.failure_count(), 1);
        assert_eq!(outcome.answers().next().unwrap().providers[0].port, 8443);
        assert!(!outcome.is_empty());
    }
}
