//! Integration tests for the UDP relay

use skylink_relay::{
    RelayConnector, RelayEnvelope, RelaySession, RelaySessionCache, UdpConnector, UdpRelayServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn start_server() -> (Arc<UdpRelayServer>, u16) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = Arc::new(UdpRelayServer::bind(addr).await.unwrap());
    let port = server.local_addr().unwrap().port();

    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    (server, port)
}

async fn recv(sub: &mut skylink_relay::Subscription) -> RelayEnvelope {
    tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("delivery timed out")
        .expect("subscription ended")
}

#[tokio::test]
async fn test_publish_subscribe_round_trip() {
    let (_server, port) = start_server().await;
    let connector = UdpConnector::new();
    let key = skylink_relay::RelayKey::new("127.0.0.1", port);

    let consumer = connector.connect(&key, false).await.unwrap();
    let producer = connector.connect(&key, false).await.unwrap();

    let mut sub = consumer.subscribe("gatekeeper.requests.b.op").await.unwrap();
    // Give the subscribe frame a moment to land before publishing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    producer
        .publish(
            "gatekeeper.requests.b.op",
            RelayEnvelope::new(1, "a.op", b"poll".to_vec()).with_reply_to("reply.1"),
        )
        .await
        .unwrap();

    let envelope = recv(&mut sub).await;
    assert_eq!(envelope.correlation_id, 1);
    assert_eq!(envelope.reply_to.as_deref(), Some("reply.1"));
    assert_eq!(envelope.payload, b"poll");
}

#[tokio::test]
async fn test_envelopes_held_until_subscribe() {
    let (server, port) = start_server().await;
    let connector = UdpConnector::new();
    let key = skylink_relay::RelayKey::new("127.0.0.1", port);

    let producer = connector.connect(&key, false).await.unwrap();
    for id in 0..3 {
        producer
            .publish("held", RelayEnvelope::new(id, "a.op", vec![]))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.queue_count().await, 1);

    let consumer = connector.connect(&key, false).await.unwrap();
    let mut sub = consumer.subscribe("held").await.unwrap();
    for id in 0..3 {
        assert_eq!(recv(&mut sub).await.correlation_id, id);
    }
}

#[tokio::test]
async fn test_dropped_subscriptions_release_queues() {
    let (server, port) = start_server().await;
    let connector = UdpConnector::new();
    let key = skylink_relay::RelayKey::new("127.0.0.1", port);
    let session = connector.open(&key).await.unwrap();
    let producer = connector.connect(&key, false).await.unwrap();

    for id in 0..200u64 {
        let queue = format!("gatekeeper.reply.{id:016x}");
        let mut sub = session.subscribe(&queue).await.unwrap();
        producer
            .publish(&queue, RelayEnvelope::new(id, "b.op", vec![]))
            .await
            .unwrap();
        assert_eq!(recv(&mut sub).await.correlation_id, id);
    }

    tokio::time::timeout(Duration::from_secs(2), async {
        while server.queue_count().await > 0 || session.subscription_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queues still held after their subscriptions were dropped");
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_resubscribe_survives_stale_drop() {
    let (server, port) = start_server().await;
    let connector = UdpConnector::new();
    let key = skylink_relay::RelayKey::new("127.0.0.1", port);
    let session = connector.open(&key).await.unwrap();
    let producer = connector.connect(&key, false).await.unwrap();

    let stale = session.subscribe("tunnel.data").await.unwrap();
    let mut current = session.subscribe("tunnel.data").await.unwrap();
    drop(stale);
    tokio::time::sleep(Duration::from_millis(50)).await;

    producer
        .publish("tunnel.data", RelayEnvelope::new(5, "b.op", vec![]))
        .await
        .unwrap();
    assert_eq!(recv(&mut current).await.correlation_id, 5);
    assert_eq!(session.subscription_count(), 1);
    assert_eq!(server.queue_count().await, 1);
}

#[tokio::test]
async fn test_disconnect_unregisters_client() {
    let (server, port) = start_server().await;
    let connector = UdpConnector::new();
    let session = connector
        .connect(&skylink_relay::RelayKey::new("127.0.0.1", port), false)
        .await
        .unwrap();
    assert_eq!(server.client_count().await, 1);

    session.close().await;
    assert!(session.is_closed());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.client_count().await, 0);
}

#[tokio::test]
async fn test_cache_over_udp_relay() {
    let (server, port) = start_server().await;
    let cache = RelaySessionCache::new(Arc::new(UdpConnector::new()));

    let a = cache.get_or_create("127.0.0.1", port, false).await.unwrap();
    let b = cache.get_or_create("127.0.0.1", port, false).await.unwrap();
    assert!(Arc::ptr_eq(a.session(), b.session()));
    assert_eq!(server.client_count().await, 1);

    a.release().await;
    b.release().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.client_count().await, 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_nothing_listening_is_unreachable() {
    // Reserve a port, then free it so nothing answers there.
    let port = {
        let reserved = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        reserved.local_addr().unwrap().port()
    };
    let connector = UdpConnector::new().with_connect_timeout(Duration::from_millis(200));
    let result = connector
        .connect(&skylink_relay::RelayKey::new("127.0.0.1", port), false)
        .await;
    assert!(result.is_err());
}
