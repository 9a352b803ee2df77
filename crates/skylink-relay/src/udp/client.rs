//! Relay client: a [`RelaySession`] over a UDP relay server.

use super::{ClientId, MAX_FRAME_SIZE, RelayFrame};
use crate::protocol::{RelayEnvelope, RelayError, RelayKey};
use crate::session::{RelayConnector, RelaySession, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

type Subscribers = Arc<DashMap<String, (u64, mpsc::UnboundedSender<RelayEnvelope>)>>;

/// Opens [`UdpSession`]s.
///
/// UDP relays are plaintext at the transport level, so a connect that
/// demands a secure transport is refused.
#[derive(Debug, Clone)]
pub struct UdpConnector {
    connect_timeout: Duration,
    keepalive_interval: Duration,
}

impl Default for UdpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

impl UdpConnector {
    /// Connector with default timeouts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how long to wait for the registration ack.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the keepalive interval.
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Register with `relay` and start the session's background tasks.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ConnectFailed` if the relay cannot be resolved
    /// or does not acknowledge the registration in time.
    pub async fn open(&self, relay: &RelayKey) -> Result<UdpSession, RelayError> {
        let (socket, client_id) =
            self.register(relay)
                .await
                .map_err(|e| RelayError::ConnectFailed {
                    relay: relay.clone(),
                    reason: e.to_string(),
                })?;
        tracing::debug!("Registered with relay {} as {}", relay, hex::encode(client_id));

        let (unsubscribe_tx, unsubscribe_rx) = mpsc::unbounded_channel();
        let session = UdpSession {
            relay: relay.clone(),
            socket: Arc::new(socket),
            subscribers: Arc::new(DashMap::new()),
            next_token: AtomicU64::new(0),
            unsubscribe_tx,
            closed: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        };
        session.spawn_receiver();
        session.spawn_unsubscriber(unsubscribe_rx);
        session.spawn_keepalive(self.keepalive_interval);
        Ok(session)
    }

    async fn register(&self, relay: &RelayKey) -> Result<(UdpSocket, ClientId), RelayError> {
        let addr = tokio::net::lookup_host((relay.address.as_str(), relay.port))
            .await?
            .next()
            .ok_or_else(|| RelayError::Io(format!("no address for {}", relay.address)))?;

        let bind: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        let client_id: ClientId = rand::random();
        socket
            .send(&RelayFrame::Register { client_id }.to_bytes()?)
            .await?;

        let mut buf = vec![0u8; 65536];
        let len = time::timeout(self.connect_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| RelayError::Timeout)??;

        match RelayFrame::from_bytes(&buf[..len])? {
            RelayFrame::RegisterAck { success: true, .. } => Ok((socket, client_id)),
            RelayFrame::RegisterAck { error, .. } => Err(RelayError::Io(
                error.unwrap_or_else(|| "Registration failed".to_string()),
            )),
            RelayFrame::Error { code, message } => Err(RelayError::Server { code, message }),
            other => Err(RelayError::Deserialization(format!(
                "unexpected {} during registration",
                other.frame_type()
            ))),
        }
    }
}

#[async_trait]
impl RelayConnector for UdpConnector {
    async fn connect(
        &self,
        relay: &RelayKey,
        secure: bool,
    ) -> Result<Arc<dyn RelaySession>, RelayError> {
        if secure {
            return Err(RelayError::SecureTransportUnsupported(relay.clone()));
        }

        Ok(Arc::new(self.open(relay).await?))
    }
}

/// Connection to a UDP relay server.
pub struct UdpSession {
    relay: RelayKey,
    socket: Arc<UdpSocket>,
    subscribers: Subscribers,
    next_token: AtomicU64,
    unsubscribe_tx: mpsc::UnboundedSender<(String, u64)>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpSession {
    /// Queues this session currently consumes.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<(), RelayError> {
        let bytes = frame.to_bytes()?;
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(RelayError::MessageTooLarge {
                size: bytes.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        self.socket.send(&bytes).await?;
        Ok(())
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Route deliveries to their subscriptions until the socket fails.
    fn spawn_receiver(&self) {
        let socket = self.socket.clone();
        let subscribers = self.subscribers.clone();
        let closed = self.closed.clone();
        let relay = self.relay.clone();

        self.track(tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];

            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => match RelayFrame::from_bytes(&buf[..len]) {
                        Ok(RelayFrame::Deliver { queue, envelope }) => {
                            let gone = subscribers
                                .get(&queue)
                                .is_some_and(|entry| entry.1.send(envelope).is_err());
                            if gone {
                                subscribers.remove(&queue);
                            }
                        }
                        Ok(RelayFrame::Error { code, message }) => {
                            tracing::warn!("Relay {} reported {:?}: {}", relay, code, message);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!("Malformed frame from {}: {}", relay, e),
                    },
                    Err(e) => {
                        tracing::warn!("Lost relay {}: {}", relay, e);
                        closed.store(true, Ordering::Release);
                        subscribers.clear();
                        break;
                    }
                }
            }
        }));
    }

    /// Tell the relay about dropped subscriptions. A token that no longer
    /// matches means the queue was subscribed again in the meantime.
    fn spawn_unsubscriber(&self, mut dropped: mpsc::UnboundedReceiver<(String, u64)>) {
        let socket = self.socket.clone();
        let subscribers = self.subscribers.clone();
        let closed = self.closed.clone();
        let relay = self.relay.clone();

        self.track(tokio::spawn(async move {
            while let Some((queue, token)) = dropped.recv().await {
                if subscribers.remove_if(&queue, |_, entry| entry.0 == token).is_none()
                    || closed.load(Ordering::Acquire)
                {
                    continue;
                }
                let sent = match (RelayFrame::Unsubscribe { queue }).to_bytes() {
                    Ok(bytes) => socket.send(&bytes).await.map_err(RelayError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::debug!("Unsubscribe to {} not sent: {}", relay, e);
                }
            }
        }));
    }

    fn spawn_keepalive(&self, interval: Duration) {
        let socket = self.socket.clone();
        let closed = self.closed.clone();

        self.track(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if closed.load(Ordering::Acquire) {
                    break;
                }
                let Ok(bytes) = RelayFrame::Keepalive.to_bytes() else {
                    break;
                };
                if socket.send(&bytes).await.is_err() {
                    closed.store(true, Ordering::Release);
                    break;
                }
            }
        }));
    }
}

impl fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpSession")
            .field("relay", &self.relay)
            .field("subscriptions", &self.subscribers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl RelaySession for UdpSession {
    fn relay(&self) -> &RelayKey {
        &self.relay
    }

    async fn publish(&self, queue: &str, envelope: RelayEnvelope) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.send_frame(&RelayFrame::Publish {
            queue: queue.to_string(),
            envelope,
        })
        .await
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription, RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(queue.to_string(), (token, tx));
        let subscription = Subscription::new(queue, rx).on_release({
            let dropped = self.unsubscribe_tx.clone();
            let queue = queue.to_string();
            move || {
                let _ = dropped.send((queue, token));
            }
        });
        self.send_frame(&RelayFrame::Subscribe {
            queue: queue.to_string(),
        })
        .await?;
        Ok(subscription)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.send_frame(&RelayFrame::Disconnect).await {
            tracing::debug!("Disconnect from {} not sent: {}", self.relay, e);
        }
        self.subscribers.clear();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        tracing::debug!("Relay session to {} closed", self.relay);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}
