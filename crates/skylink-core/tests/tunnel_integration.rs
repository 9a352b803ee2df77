//! End-to-end tests: discovery, selection and tunnelling over one relay

use skylink_core::config::{GatekeeperConfig, GatewayConfig, MatchmakingConfig};
use skylink_core::gatekeeper::{PollResponder, ServiceOffer, StaticServiceRegistry};
use skylink_core::gateway::{GatewayConnectionRequest, RelaySpec, TunnelState};
use skylink_core::orchestrator::{AllowAll, MemorySelectionStore};
use skylink_core::{
    Cloud, CloudIdentity, Gatekeeper, InterCloudOrchestrator, PollRequest, PreferredProvider,
    Relay, RelayType, SelectionOutcome, ServiceQuery, SystemDescriptor, TunnelBroker,
    TunnelResponder,
};
use skylink_crypto::TunnelKeypair;
use skylink_relay::{MemoryBroker, RelayConnector, RelaySessionCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn relay() -> Relay {
    Relay::new("relay.example", 61616, false, RelayType::GeneralRelay)
}

fn provider_cloud() -> Cloud {
    Cloud::new(CloudIdentity::new("testcloud2", "elte")).with_relay(relay())
}

fn consumer_cloud() -> CloudIdentity {
    CloudIdentity::new("testcloud1", "aitia")
}

fn cache(memory: &MemoryBroker) -> Arc<RelaySessionCache> {
    RelaySessionCache::new(Arc::new(memory.clone()))
}

fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        handshake_timeout: Duration::from_secs(2),
        socket_timeout: Duration::from_secs(5),
        chunk_size: 1024,
        ..Default::default()
    }
}

fn connection_request(provider: SystemDescriptor, key: String) -> GatewayConnectionRequest {
    GatewayConnectionRequest {
        relay: Some(RelaySpec::from(&relay())),
        consumer: Some(SystemDescriptor::new("client", "127.0.0.1", 9000)),
        provider: Some(provider),
        consumer_cloud: Some(consumer_cloud()),
        provider_cloud: Some(provider_cloud().identity),
        service_definition: "echo".into(),
        provider_gateway_public_key: key,
    }
}

/// Provider cloud: gatekeeper answering polls and gateway accepting tunnels.
async fn start_provider(
    memory: &MemoryBroker,
    provider_system: SystemDescriptor,
) -> (TunnelResponder, Arc<TunnelKeypair>) {
    let keypair = Arc::new(TunnelKeypair::generate());
    let registry = Arc::new(StaticServiceRegistry::new().with_service(
        "echo",
        ServiceOffer {
            providers: vec![provider_system],
            interfaces: vec!["TCP".into()],
            ..Default::default()
        },
    ));
    let session = memory.connect(&relay().key(), false).await.unwrap();
    Arc::new(
        PollResponder::new(provider_cloud().identity, registry.clone())
            .with_gateway_key(keypair.public_key()),
    )
    .spawn(session);

    let responder = TunnelResponder::bind(
        cache(memory),
        &relay(),
        provider_cloud().identity,
        Arc::clone(&keypair),
        registry,
        gateway_config(),
    )
    .await
    .unwrap();
    (responder, keypair)
}

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
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

#[tokio::test]
async fn test_discover_select_then_tunnel() {
    let memory = MemoryBroker::new();
    let sensor = SystemDescriptor::new("echo-provider", "127.0.0.1", 7000);
    let (mut responder, keypair) = start_provider(&memory, sensor.clone()).await;

    let shared_cache = cache(&memory);
    let gatekeeper = Gatekeeper::new(
        Arc::clone(&shared_cache),
        GatekeeperConfig {
            fanout_deadline: Duration::from_secs(2),
            ..Default::default()
        },
    );
    let orchestrator = InterCloudOrchestrator::new(
        Arc::new(gatekeeper),
        Arc::new(AllowAll),
        Arc::new(MemorySelectionStore::new()),
        MatchmakingConfig::default(),
    );
    let outcome = orchestrator
        .orchestrate(
            &[provider_cloud()],
            PollRequest::new(ServiceQuery::new("echo"), consumer_cloud()).with_gateway(),
            &[PreferredProvider::cloud(provider_cloud().identity)],
        )
        .await
        .unwrap();

    let SelectionOutcome::Selected(selection) = outcome else {
        panic!("expected a selection");
    };
    assert_eq!(selection.provider.as_ref(), Some(&sensor));
    let key = selection.answer.gateway_public_key.clone().unwrap();
    assert_eq!(key, keypair.public_key().to_base64());

    let accepting = tokio::spawn(async move { responder.accept().await.unwrap() });
    let broker = TunnelBroker::new(Arc::clone(&shared_cache), gateway_config());
    let mut consumer = broker
        .connect(&connection_request(selection.provider.unwrap(), key))
        .await
        .unwrap();
    let mut incoming = accepting.await.unwrap();
    assert_eq!(incoming.open.provider, sensor);

    consumer.write_all(b"temperature?").await.unwrap();
    let mut buf = [0u8; 12];
    incoming.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"temperature?");

    incoming.stream.write_all(b"21.5C").await.unwrap();
    let mut buf = [0u8; 5];
    consumer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"21.5C");

    // Discovery gave its lease back; only the tunnel holds the relay session.
    assert_eq!(shared_cache.len(), 1);
    assert_eq!(broker.active_sessions().len(), 1);
}

#[tokio::test]
async fn test_round_trip_survives_retransmission() {
    let memory = MemoryBroker::new();
    memory.retransmit_after("gateway.", 3);
    let (mut responder, keypair) =
        start_provider(&memory, SystemDescriptor::new("echo-provider", "127.0.0.1", 7000)).await;

    let echo = tokio::spawn(async move {
        let incoming = responder.accept().await.unwrap();
        let (mut reader, mut writer) = tokio::io::split(incoming.stream);
        tokio::io::copy(&mut reader, &mut writer).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let broker = TunnelBroker::new(cache(&memory), gateway_config());
    let stream = broker
        .connect(&connection_request(
            SystemDescriptor::new("echo-provider", "127.0.0.1", 7000),
            keypair.public_key().to_base64(),
        ))
        .await
        .unwrap();
    let session_id = stream.session_id();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let (mut reader, mut writer) = tokio::io::split(stream);
    let expected = payload.clone();
    let ((), echoed) = tokio::join!(
        async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        },
        async move {
            let mut echoed = Vec::new();
            reader.read_to_end(&mut echoed).await.unwrap();
            echoed
        }
    );
    assert_eq!(echoed.len(), expected.len());
    assert_eq!(echoed, expected);
    echo.await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !broker.active_sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("tunnel {} still registered", hex::encode(session_id)));
}

#[tokio::test]
async fn test_expose_local_bridges_tcp() {
    let memory = MemoryBroker::new();
    let echo_port = echo_server().await;
    let provider_system = SystemDescriptor::new("echo-provider", "127.0.0.1", echo_port);
    let (responder, keypair) = start_provider(&memory, provider_system.clone()).await;
    tokio::spawn(responder.run());

    let broker = TunnelBroker::new(
        cache(&memory),
        GatewayConfig {
            port_range: 18_000..=18_200,
            ..gateway_config()
        },
    );
    let exposed = broker
        .expose_local(&connection_request(
            provider_system,
            keypair.public_key().to_base64(),
        ))
        .await
        .unwrap();
    assert!((18_000..=18_200).contains(&exposed.port));

    let mut client = TcpStream::connect(("127.0.0.1", exposed.port)).await.unwrap();
    client.write_all(b"over the relay").await.unwrap();
    client.shutdown().await.unwrap();
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"over the relay");

    let (up, down) = exposed.join().await.unwrap();
    assert_eq!((up, down), (14, 14));
}

#[tokio::test]
async fn test_provider_gateway_down_is_setup_failure() {
    let memory = MemoryBroker::new();
    let broker = TunnelBroker::new(
        cache(&memory),
        GatewayConfig {
            handshake_timeout: Duration::from_millis(200),
            ..gateway_config()
        },
    );
    let err = broker
        .connect(&connection_request(
            SystemDescriptor::new("echo-provider", "127.0.0.1", 7000),
            TunnelKeypair::generate().public_key().to_base64(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, skylink_core::Error::TunnelSetupFailed(_)));

    memory.set_unreachable("relay.example", 61616);
    let err = broker
        .connect(&connection_request(
            SystemDescriptor::new("echo-provider", "127.0.0.1", 7000),
            TunnelKeypair::generate().public_key().to_base64(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, skylink_core::Error::RelayUnreachable(_)));
}

#[tokio::test]
async fn test_tunnel_fails_when_relay_lost() {
    let memory = MemoryBroker::new();
    let (mut responder, keypair) =
        start_provider(&memory, SystemDescriptor::new("echo-provider", "127.0.0.1", 7000)).await;
    let accepting = tokio::spawn(async move { responder.accept().await.unwrap() });

    let broker = TunnelBroker::new(cache(&memory), gateway_config());
    let stream = broker
        .connect(&connection_request(
            SystemDescriptor::new("echo-provider", "127.0.0.1", 7000),
            keypair.public_key().to_base64(),
        ))
        .await
        .unwrap();
    let _incoming = accepting.await.unwrap();

    memory.sever("relay.example", 61616).await;
    let state = tokio::time::timeout(Duration::from_secs(2), stream.closed())
        .await
        .unwrap();
    assert_eq!(state, TunnelState::Failed);
}
