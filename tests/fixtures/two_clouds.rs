//! Two-cloud test fixture over a real UDP relay
//!
//! Starts a relay server on loopback, a provider cloud that answers
//! discovery polls and accepts tunnels through it, and hands out the
//! consumer-side pieces:
//!
//! ```no_run
//! use skylink_integration_tests::fixtures::{TwoCloudFixture, echo_server};
//! use skylink_core::SystemDescriptor;
//!
//! # async fn demo() {
//! let port = echo_server().await;
//! let fixture = TwoCloudFixture::start("echo", SystemDescriptor::new("echo", "127.0.0.1", port))
//!     .await
//!     .unwrap();
//! let orchestrator = fixture.orchestrator(std::time::Duration::from_secs(3));
//! // ... discover, select, tunnel ...
//! fixture.shutdown().await;
//! # }
//! ```

use skylink_core::config::{GatekeeperConfig, GatewayConfig, MatchmakingConfig};
use skylink_core::gatekeeper::{ServiceOffer, StaticServiceRegistry};
use skylink_core::gateway::RelaySpec;
use skylink_core::orchestrator::{AllowAll, MemorySelectionStore};
use skylink_core::{
    Cloud, CloudIdentity, Gatekeeper, GatewayConnectionRequest, InterCloudOrchestrator,
    PollResponder, Relay, RelayType, Result, SystemDescriptor, TunnelBroker, TunnelResponder,
};
use skylink_crypto::TunnelKeypair;
use skylink_relay::{RelaySessionCache, SessionLease, UdpConnector, UdpRelayServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A relay, a provider cloud serving one service, and a consumer identity.
pub struct TwoCloudFixture {
    /// Relay server both clouds share
    pub relay_server: Arc<UdpRelayServer>,
    /// The shared relay as clouds describe it
    pub relay: Relay,
    /// Provider cloud as the consumer knows it
    pub provider_cloud: Cloud,
    /// Consumer cloud identity
    pub consumer: CloudIdentity,
    /// Provider gateway keypair
    pub gateway_key: Arc<TunnelKeypair>,
    /// Consumer-side relay sessions
    pub consumer_cache: Arc<RelaySessionCache>,
    provider_cache: Arc<RelaySessionCache>,
    poll_lease: SessionLease,
    tasks: Vec<JoinHandle<()>>,
}

impl TwoCloudFixture {
    /// Start a relay and a provider cloud offering `service` from `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay cannot bind or the provider cannot
    /// reach it.
    pub async fn start(service: &str, provider: SystemDescriptor) -> Result<Self> {
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let relay_server = Arc::new(UdpRelayServer::bind(addr).await?);
        let port = relay_server.local_addr()?.port();
        let runner = Arc::clone(&relay_server);
        let mut tasks = vec![tokio::spawn(async move {
            let _ = runner.run().await;
        })];

        let relay = Relay::new("127.0.0.1", port, false, RelayType::GeneralRelay);
        let identity = CloudIdentity::new("testcloud2", "elte");
        let gateway_key = Arc::new(TunnelKeypair::generate());
        let provider_cache = connector_cache();

        let registry = Arc::new(StaticServiceRegistry::new().with_service(
            service,
            ServiceOffer {
                providers: vec![provider],
                interfaces: vec!["TCP".into()],
                ..Default::default()
            },
        ));
        let poll_lease = provider_cache
            .get_or_create(&relay.address, relay.port, relay.secure)
            .await?;
        let responder = Arc::new(
            PollResponder::new(identity.clone(), registry.clone())
                .with_gateway_key(gateway_key.public_key()),
        );
        let polls = responder.spawn(Arc::clone(poll_lease.session()));
        tasks.push(tokio::spawn(async move {
            let _ = polls.await;
        }));

        let tunnels = TunnelResponder::bind(
            Arc::clone(&provider_cache),
            &relay,
            identity.clone(),
            Arc::clone(&gateway_key),
            registry,
            gateway_config(),
        )
        .await?;
        tasks.push(tokio::spawn(async move {
            let _ = tunnels.run().await;
        }));

        Ok(Self {
            relay_server,
            provider_cloud: Cloud::new(identity).with_relay(relay.clone()),
            relay,
            consumer: CloudIdentity::new("testcloud1", "aitia"),
            gateway_key,
            consumer_cache: connector_cache(),
            provider_cache,
            poll_lease,
            tasks,
        })
    }

    /// Consumer orchestrator over the shared relay.
    #[must_use]
    pub fn orchestrator(&self, fanout_deadline: Duration) -> InterCloudOrchestrator {
        InterCloudOrchestrator::new(
            Arc::new(Gatekeeper::new(
                Arc::clone(&self.consumer_cache),
                GatekeeperConfig {
                    fanout_deadline,
                    ..Default::default()
                },
            )),
            Arc::new(AllowAll),
            Arc::new(MemorySelectionStore::new()),
            MatchmakingConfig::default(),
        )
    }

    /// Consumer tunnel broker.
    #[must_use]
    pub fn broker(&self, config: GatewayConfig) -> TunnelBroker {
        TunnelBroker::new(Arc::clone(&self.consumer_cache), config)
    }

    /// Connection request from the consumer to `provider`.
    #[must_use]
    pub fn connection_request(
        &self,
        service: &str,
        provider: SystemDescriptor,
    ) -> GatewayConnectionRequest {
        GatewayConnectionRequest {
            relay: Some(RelaySpec::from(&self.relay)),
            consumer: Some(SystemDescriptor::new("consumer", "127.0.0.1", 9000)),
            provider: Some(provider),
            consumer_cloud: Some(self.consumer.clone()),
            provider_cloud: Some(self.provider_cloud.identity.clone()),
            service_definition: service.to_string(),
            provider_gateway_public_key: self.gateway_key.public_key().to_base64(),
        }
    }

    /// Stop the provider cloud and the relay.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.poll_lease.release().await;
        self.provider_cache.close_all().await;
        self.consumer_cache.close_all().await;
    }
}

/// Gateway settings for tests: small chunks, short timeouts.
#[must_use]
pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        handshake_timeout: Duration::from_secs(3),
        socket_timeout: Duration::from_secs(10),
        chunk_size: 1024,
        ..Default::default()
    }
}

fn connector_cache() -> Arc<RelaySessionCache> {
    RelaySessionCache::new(Arc::new(
        UdpConnector::new().with_connect_timeout(Duration::from_millis(500)),
    ))
}

/// TCP echo server on loopback; returns its port.
pub async fn echo_server() -> u16 {
    let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
        panic!("cannot bind echo server");
    };
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    port
}
