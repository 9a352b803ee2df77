//! Relay server holding and forwarding queue envelopes.

use super::{ClientId, MAX_FRAME_SIZE, RelayFrame};
use crate::protocol::{RelayEnvelope, RelayError, RelayErrorCode};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};

/// Client connection information
#[derive(Debug, Clone)]
struct ClientConnection {
    client_id: ClientId,
    last_seen: Instant,
}

impl ClientConnection {
    fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            last_seen: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }
}

/// Queue held by the server.
#[derive(Debug)]
struct ServerQueue {
    subscriber: Option<SocketAddr>,
    pending: VecDeque<RelayEnvelope>,
    last_activity: Instant,
}

impl ServerQueue {
    fn new() -> Self {
        Self {
            subscriber: None,
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }
}

/// Simple rate limiter
struct RateLimiter {
    /// Frames per client per window
    limit: usize,
    counts: HashMap<SocketAddr, (Instant, usize)>,
    window: Duration,
}

impl RateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
            window,
        }
    }

    fn check(&mut self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        let entry = self.counts.entry(addr).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            entry.0 = now;
            entry.1 = 0;
        }

        if entry.1 >= self.limit {
            return false;
        }

        entry.1 += 1;
        true
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        self.counts
            .retain(|_, (time, _)| now.duration_since(*time) < self.window * 2);
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct UdpRelayServerConfig {
    /// Maximum number of concurrent clients
    pub max_clients: usize,
    /// Rate limit (publishes per client per second)
    pub rate_limit: usize,
    /// Client timeout duration
    pub client_timeout: Duration,
    /// Cleanup interval
    pub cleanup_interval: Duration,
    /// Envelopes held per queue while it has no consumer
    pub max_pending_per_queue: usize,
    /// How long a queue without a consumer keeps its held envelopes
    pub queue_idle_timeout: Duration,
}

impl Default for UdpRelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            rate_limit: 10_000,
            client_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            max_pending_per_queue: 1024,
            queue_idle_timeout: Duration::from_secs(120),
        }
    }
}

/// Store-and-forward relay server
pub struct UdpRelayServer {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<HashMap<SocketAddr, ClientConnection>>>,
    queues: Arc<Mutex<HashMap<String, ServerQueue>>>,
    rate_limiter: Arc<RwLock<RateLimiter>>,
    config: UdpRelayServerConfig,
    relay_id: [u8; 32],
}

impl UdpRelayServer {
    /// Bind a relay server with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, RelayError> {
        Self::bind_with_config(bind_addr, UdpRelayServerConfig::default()).await
    }

    /// Bind a relay server with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        config: UdpRelayServerConfig,
    ) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(bind_addr).await?;

        let relay_id = {
            let mut id = [0u8; 32];
            use rand::Rng;
            rand::thread_rng().fill(&mut id[..]);
            id
        };

        Ok(Self {
            socket: Arc::new(socket),
            clients: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(Mutex::new(HashMap::new())),
            rate_limiter: Arc::new(RwLock::new(RateLimiter::new(
                config.rate_limit,
                Duration::from_secs(1),
            ))),
            config,
            relay_id,
        })
    }

    /// Address the server is actually bound to.
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the relay server loop.
    ///
    /// # Errors
    ///
    /// Returns error if socket operations fail.
    pub async fn run(&self) -> Result<(), RelayError> {
        tracing::info!(
            "Relay server listening on {} (ID: {})",
            self.local_addr()?,
            hex::encode(&self.relay_id[..8])
        );

        self.spawn_cleanup_task();

        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => match RelayFrame::from_bytes(&buf[..len]) {
                    Ok(frame) => self.handle_frame(frame, from).await,
                    Err(e) => {
                        tracing::debug!("Malformed frame from {}: {}", from, e);
                        self.send_error(from, RelayErrorCode::InvalidMessage, "Malformed frame")
                            .await;
                    }
                },
                Err(e) => {
                    // ICMP errors from departed clients surface here.
                    tracing::trace!("Receive error: {}", e);
                }
            }
        }
    }

    async fn handle_frame(&self, frame: RelayFrame, from: SocketAddr) {
        tracing::trace!("{} from {}", frame.frame_type(), from);

        if let RelayFrame::Register { client_id } = frame {
            self.handle_register(client_id, from).await;
            return;
        }

        if !self.touch(from).await {
            if !matches!(frame, RelayFrame::Disconnect) {
                self.send_error(from, RelayErrorCode::NotRegistered, "Not registered")
                    .await;
            }
            return;
        }

        match frame {
            RelayFrame::Subscribe { queue } => self.handle_subscribe(queue, from).await,
            RelayFrame::Unsubscribe { queue } => self.handle_unsubscribe(&queue, from).await,
            RelayFrame::Publish { queue, envelope } => {
                self.handle_publish(queue, envelope, from).await;
            }
            RelayFrame::Disconnect => self.handle_disconnect(from).await,
            RelayFrame::Keepalive => {}
            _ => {
                // Server-to-client frames are ignored
            }
        }
    }

    async fn handle_register(&self, client_id: ClientId, from: SocketAddr) {
        let mut clients = self.clients.write().await;

        if clients.len() >= self.config.max_clients && !clients.contains_key(&from) {
            drop(clients);
            tracing::warn!("Rejecting {}: server at capacity", from);
            self.send_error(from, RelayErrorCode::ServerFull, "Server at capacity")
                .await;
            return;
        }

        clients.insert(from, ClientConnection::new(client_id));
        drop(clients);
        tracing::debug!("Client {} registered from {}", hex::encode(client_id), from);

        let ack = RelayFrame::RegisterAck {
            relay_id: self.relay_id,
            success: true,
            error: None,
        };
        self.send_frame(&ack, from).await;
    }

    async fn handle_subscribe(&self, queue: String, from: SocketAddr) {
        let backlog: Vec<RelayEnvelope> = {
            let mut queues = self.queues.lock().await;
            let entry = queues.entry(queue.clone()).or_insert_with(ServerQueue::new);
            entry.subscriber = Some(from);
            entry.last_activity = Instant::now();
            entry.pending.drain(..).collect()
        };

        tracing::debug!(
            "{} subscribed to {} ({} held envelope(s))",
            from,
            queue,
            backlog.len()
        );
        for envelope in backlog {
            self.deliver(&queue, envelope, from).await;
        }
    }

    async fn handle_unsubscribe(&self, queue: &str, from: SocketAddr) {
        let mut queues = self.queues.lock().await;
        let Some(entry) = queues.get_mut(queue) else {
            return;
        };
        if entry.subscriber != Some(from) {
            return;
        }
        entry.subscriber = None;
        entry.last_activity = Instant::now();
        if entry.pending.is_empty() {
            queues.remove(queue);
        }
        tracing::debug!("{} unsubscribed from {}", from, queue);
    }

    async fn handle_publish(&self, queue: String, envelope: RelayEnvelope, from: SocketAddr) {
        {
            let mut limiter = self.rate_limiter.write().await;
            if !limiter.check(from) {
                drop(limiter);
                self.send_error(from, RelayErrorCode::RateLimited, "Rate limit exceeded")
                    .await;
                return;
            }
        }

        let target = {
            let mut queues = self.queues.lock().await;
            let entry = queues.entry(queue.clone()).or_insert_with(ServerQueue::new);
            entry.last_activity = Instant::now();
            match entry.subscriber {
                Some(addr) => Some((addr, envelope)),
                None => {
                    if entry.pending.len() >= self.config.max_pending_per_queue {
                        entry.pending.pop_front();
                        tracing::warn!("Queue {} backlog full, dropped oldest envelope", queue);
                    }
                    entry.pending.push_back(envelope);
                    None
                }
            }
        };

        if let Some((addr, envelope)) = target {
            self.deliver(&queue, envelope, addr).await;
        }
    }

    async fn handle_disconnect(&self, from: SocketAddr) {
        let client = self.clients.write().await.remove(&from);
        Self::drop_subscriptions(&self.queues, &[from]).await;
        if let Some(client) = client {
            tracing::debug!("Client {} at {} disconnected", hex::encode(client.client_id), from);
        }
    }

    async fn deliver(&self, queue: &str, envelope: RelayEnvelope, to: SocketAddr) {
        let frame = RelayFrame::Deliver {
            queue: queue.to_string(),
            envelope,
        };
        self.send_frame(&frame, to).await;
    }

    async fn touch(&self, from: SocketAddr) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get_mut(&from) {
            Some(client) => {
                client.touch();
                true
            }
            None => false,
        }
    }

    async fn send_frame(&self, frame: &RelayFrame, to: SocketAddr) {
        match frame.to_bytes() {
            Ok(bytes) if bytes.len() <= MAX_FRAME_SIZE => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    tracing::debug!("Send to {} failed: {}", to, e);
                }
            }
            Ok(bytes) => {
                tracing::warn!("Dropping {} byte {} frame for {}", bytes.len(), frame.frame_type(), to);
            }
            Err(e) => tracing::warn!("Cannot encode {} frame: {}", frame.frame_type(), e),
        }
    }

    async fn send_error(&self, addr: SocketAddr, code: RelayErrorCode, message: &str) {
        let frame = RelayFrame::Error {
            code,
            message: message.to_string(),
        };
        self.send_frame(&frame, addr).await;
    }

    async fn drop_subscriptions(
        queues: &Mutex<HashMap<String, ServerQueue>>,
        gone: &[SocketAddr],
    ) {
        let mut queues = queues.lock().await;
        for queue in queues.values_mut() {
            if queue.subscriber.is_some_and(|addr| gone.contains(&addr)) {
                queue.subscriber = None;
            }
        }
        queues.retain(|_, q| q.subscriber.is_some() || !q.pending.is_empty());
    }

    /// Drop consumerless queues untouched for `idle`; returns how many went.
    fn expire_idle_queues(queues: &mut HashMap<String, ServerQueue>, idle: Duration) -> usize {
        let before = queues.len();
        queues.retain(|_, q| q.subscriber.is_some() || q.last_activity.elapsed() < idle);
        before - queues.len()
    }

    fn spawn_cleanup_task(&self) {
        let clients = self.clients.clone();
        let queues = self.queues.clone();
        let rate_limiter = self.rate_limiter.clone();
        let timeout = self.config.client_timeout;
        let interval = self.config.cleanup_interval;
        let queue_idle = self.config.queue_idle_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                let stale: Vec<SocketAddr> = {
                    let mut clients_guard = clients.write().await;
                    let stale = clients_guard
                        .iter()
                        .filter(|(_, client)| !client.is_alive(timeout))
                        .map(|(addr, _)| *addr)
                        .collect::<Vec<_>>();
                    for addr in &stale {
                        clients_guard.remove(addr);
                    }
                    stale
                };
                if !stale.is_empty() {
                    tracing::debug!("Expired {} stale relay client(s)", stale.len());
                }
                Self::drop_subscriptions(&queues, &stale).await;
                let expired = Self::expire_idle_queues(&mut *queues.lock().await, queue_idle);
                if expired > 0 {
                    tracing::debug!("Expired {} idle queue(s)", expired);
                }

                rate_limiter.write().await.cleanup();
            }
        });
    }

    /// Get number of connected clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Number of queues the server currently tracks.
    pub async fn queue_count(&self) -> usize {
        self.queues.lock().await.len()
    }

    /// Get server relay ID
    #[must_use]
    pub fn relay_id(&self) -> [u8; 32] {
        self.relay_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = UdpRelayServer::bind(addr).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.client_count().await, 0);
        assert_eq!(server.queue_count().await, 0);
    }

    #[tokio::test]
    async fn test_relay_server_custom_config() {
        let config = UdpRelayServerConfig {
            max_clients: 2,
            ..Default::default()
        };
        let server = UdpRelayServer::bind_with_config("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();
        assert_eq!(server.config.max_clients, 2);
    }

    #[test]
    fn test_rate_limiter() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        assert!(limiter.check(addr));
        assert!(limiter.check(addr));
        assert!(limiter.check(addr));
        assert!(!limiter.check(addr));
    }

    #[tokio::test]
    async fn test_drop_subscriptions_prunes_empty_queues() {
        let gone: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let queues = Mutex::new(HashMap::new());
        queues.lock().await.insert(
            "idle".to_string(),
            ServerQueue {
                subscriber: Some(gone),
                ..ServerQueue::new()
            },
        );
        queues.lock().await.insert(
            "held".to_string(),
            ServerQueue {
                subscriber: Some(gone),
                pending: VecDeque::from(vec![RelayEnvelope::new(1, "c.o", vec![])]),
                ..ServerQueue::new()
            },
        );

        UdpRelayServer::drop_subscriptions(&queues, &[gone]).await;

        let queues = queues.lock().await;
        assert!(!queues.contains_key("idle"));
        assert!(queues["held"].subscriber.is_none());
    }

    #[test]
    fn test_idle_queues_expire() {
        let consumer: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let long_ago = Instant::now() - Duration::from_secs(5);
        let mut queues = HashMap::new();
        queues.insert(
            "late.reply".to_string(),
            ServerQueue {
                pending: VecDeque::from(vec![RelayEnvelope::new(1, "c.o", vec![])]),
                last_activity: long_ago,
                ..ServerQueue::new()
            },
        );
        queues.insert(
            "consumed".to_string(),
            ServerQueue {
                subscriber: Some(consumer),
                last_activity: long_ago,
                ..ServerQueue::new()
            },
        );
        queues.insert("fresh".to_string(), ServerQueue::new());

        let expired = UdpRelayServer::expire_idle_queues(&mut queues, Duration::from_secs(2));
        assert_eq!(expired, 1);
        assert!(!queues.contains_key("late.reply"));
        assert!(queues.contains_key("consumed"));
        assert!(queues.contains_key("fresh"));
    }
}
