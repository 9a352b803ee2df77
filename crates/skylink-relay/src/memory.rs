//! In-process relay broker.
//!
//! Store-and-forward semantics match the UDP relay: each queue has at most
//! one consumer and envelopes published while it has none are held until
//! one subscribes. Dropping a subscription or closing its session removes
//! the queue. Brokers are namespaced by relay key, so two keys never share
//! queues.
//!
//! The broker can inject faults for tests: unreachable relays, slow
//! connects, silent queues, retransmitted envelopes and severed relays.

use crate::protocol::{RelayEnvelope, RelayError, RelayKey};
use crate::session::{RelayConnector, RelaySession, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

type QueueKey = (RelayKey, String);

struct Subscriber {
    token: u64,
    tx: mpsc::UnboundedSender<RelayEnvelope>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<RelayEnvelope>,
    subscriber: Option<Subscriber>,
    published: u64,
    last: Option<RelayEnvelope>,
}

impl QueueState {
    fn deliver(&mut self, envelope: RelayEnvelope) {
        let envelope = match self.subscriber.as_ref() {
            Some(subscriber) => match subscriber.tx.send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            None => envelope,
        };
        self.subscriber = None;
        self.pending.push_back(envelope);
    }

    fn is_held_by(&self, token: u64) -> bool {
        self.subscriber.as_ref().is_some_and(|s| s.token == token)
    }
}

#[derive(Default)]
struct Faults {
    unreachable: HashSet<RelayKey>,
    connect_delay: Duration,
    blackholes: Vec<String>,
    retransmit: Vec<(String, u64)>,
}

#[derive(Default)]
struct BrokerInner {
    queues: DashMap<QueueKey, QueueState>,
    connects: DashMap<RelayKey, usize>,
    faults: Mutex<Faults>,
    sessions: Mutex<Vec<Weak<MemorySession>>>,
    next_session_id: AtomicU64,
    next_token: AtomicU64,
}

impl BrokerInner {
    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, key: &QueueKey, token: u64) {
        if self.queues.remove_if(key, |_, state| state.is_held_by(token)).is_some() {
            tracing::trace!("Queue {} on {} unsubscribed", key.1, key.0);
        }
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse connects to `address:port`.
    pub fn set_unreachable(&self, address: &str, port: u16) {
        self.inner.faults().unreachable.insert(RelayKey::new(address, port));
    }

    /// Accept connects to `address:port` again.
    pub fn set_reachable(&self, address: &str, port: u16) {
        self.inner.faults().unreachable.remove(&RelayKey::new(address, port));
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner.faults().connect_delay = delay;
    }

    /// Silently discard envelopes published to queues starting with `prefix`.
    pub fn blackhole(&self, prefix: impl Into<String>) {
        self.inner.faults().blackholes.push(prefix.into());
    }

    /// On the `nth` publish (1-based) to a queue starting with `prefix`,
    /// deliver the previous envelope of that queue a second time.
    pub fn retransmit_after(&self, prefix: impl Into<String>, nth: u64) {
        self.inner.faults().retransmit.push((prefix.into(), nth));
    }

    /// Number of connect attempts made to `address:port`.
    #[must_use]
    pub fn connect_attempts(&self, address: &str, port: u16) -> usize {
        self.inner
            .connects
            .get(&RelayKey::new(address, port))
            .map_or(0, |count| *count)
    }

    /// Envelopes held for a queue with no consumer yet.
    #[must_use]
    pub fn pending(&self, address: &str, port: u16, queue: &str) -> usize {
        self.inner
            .queues
            .get(&(RelayKey::new(address, port), queue.to_string()))
            .map_or(0, |state| state.pending.len())
    }

    /// Queues the broker tracks for `address:port`.
    #[must_use]
    pub fn queue_count(&self, address: &str, port: u16) -> usize {
        let relay = RelayKey::new(address, port);
        self.inner.queues.iter().filter(|e| e.key().0 == relay).count()
    }

    /// Close every open session to `address:port`, as if the relay went down.
    pub async fn sever(&self, address: &str, port: u16) {
        let key = RelayKey::new(address, port);
        let victims: Vec<Arc<MemorySession>> = {
            let mut sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|session| session.relay == key)
                .collect()
        };
        tracing::debug!("Severing {} session(s) to {}", victims.len(), key);
        for session in victims {
            session.close().await;
        }
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("queues", &self.inner.queues.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RelayConnector for MemoryBroker {
    async fn connect(
        &self,
        relay: &RelayKey,
        _secure: bool,
    ) -> Result<Arc<dyn RelaySession>, RelayError> {
        *self.inner.connects.entry(relay.clone()).or_insert(0) += 1;

        let (delay, unreachable) = {
            let faults = self.inner.faults();
            (faults.connect_delay, faults.unreachable.contains(relay))
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(RelayError::ConnectFailed {
                relay: relay.clone(),
                reason: "connection refused".to_string(),
            });
        }

        let session = Arc::new(MemorySession {
            id: self.inner.next_session_id.fetch_add(1, Ordering::Relaxed),
            relay: relay.clone(),
            broker: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
            subscribed: Arc::new(Mutex::new(HashMap::new())),
        });
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&session));

        tracing::trace!("Memory session {} opened to {}", session.id, relay);
        Ok(session)
    }
}

/// Session on a [`MemoryBroker`].
pub struct MemorySession {
    id: u64,
    relay: RelayKey,
    broker: Arc<BrokerInner>,
    closed: AtomicBool,
    subscribed: Arc<Mutex<HashMap<String, u64>>>,
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("relay", &self.relay)
            .field(
                "subscriptions",
                &self.subscribed.lock().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[async_trait]
impl RelaySession for MemorySession {
    fn relay(&self) -> &RelayKey {
        &self.relay
    }

    async fn publish(&self, queue: &str, envelope: RelayEnvelope) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }

        let retransmit_on = {
            let faults = self.broker.faults();
            if faults.blackholes.iter().any(|p| queue.starts_with(p.as_str())) {
                tracing::trace!("Dropping envelope for blackholed queue {}", queue);
                return Ok(());
            }
            faults
                .retransmit
                .iter()
                .find(|(p, _)| queue.starts_with(p.as_str()))
                .map(|(_, nth)| *nth)
        };

        let mut state = self
            .broker
            .queues
            .entry((self.relay.clone(), queue.to_string()))
            .or_default();
        state.published += 1;
        let previous = state.last.replace(envelope.clone());
        state.deliver(envelope);

        if retransmit_on == Some(state.published) {
            if let Some(previous) = previous {
                tracing::trace!("Retransmitting envelope on {}", queue);
                state.deliver(previous);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Subscription, RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.broker.next_token.fetch_add(1, Ordering::Relaxed);
        let key = (self.relay.clone(), queue.to_string());
        {
            let mut state = self.broker.queues.entry(key.clone()).or_default();
            while let Some(envelope) = state.pending.pop_front() {
                let _ = tx.send(envelope);
            }
            state.subscriber = Some(Subscriber { token, tx });
        }
        self.subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_string(), token);

        let broker = Arc::downgrade(&self.broker);
        let subscribed = Arc::clone(&self.subscribed);
        Ok(Subscription::new(queue, rx).on_release(move || {
            {
                let mut subscribed = subscribed.lock().unwrap_or_else(PoisonError::into_inner);
                if subscribed.get(&key.1) == Some(&token) {
                    subscribed.remove(&key.1);
                }
            }
            if let Some(broker) = broker.upgrade() {
                broker.unsubscribe(&key, token);
            }
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let queues =
            std::mem::take(&mut *self.subscribed.lock().unwrap_or_else(PoisonError::into_inner));
        for (queue, token) in queues {
            self.broker.unsubscribe(&(self.relay.clone(), queue), token);
        }
        tracing::trace!("Memory session {} to {} closed", self.id, self.relay);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
