//! Connector and session abstractions over a relay broker.

use crate::protocol::{RelayEnvelope, RelayError, RelayKey};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Receiving end of a queue subscription.
///
/// `recv` yields `None` once the owning session is closed or the relay
/// connection is lost. Dropping the subscription unsubscribes the queue.
pub struct Subscription {
    queue: String,
    rx: mpsc::UnboundedReceiver<RelayEnvelope>,
    release: Option<Release>,
}

impl Subscription {
    /// Wrap a channel receiver for `queue`.
    #[must_use]
    pub fn new(queue: impl Into<String>, rx: mpsc::UnboundedReceiver<RelayEnvelope>) -> Self {
        Self {
            queue: queue.into(),
            rx,
            release: None,
        }
    }

    /// Run `release` when the subscription is dropped.
    #[must_use]
    pub fn on_release(mut self, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Queue this subscription reads from.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next envelope.
    pub async fn recv(&mut self) -> Option<RelayEnvelope> {
        self.rx.recv().await
    }

    /// Take an envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<RelayEnvelope> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// An open connection to one relay broker.
///
/// Queues are created on first use. Envelopes published before anyone
/// subscribes are held by the broker and delivered on subscribe.
#[async_trait]
pub trait RelaySession: Send + Sync + fmt::Debug {
    /// Relay this session is connected to.
    fn relay(&self) -> &RelayKey;

    /// Publish an envelope to `queue`.
    async fn publish(&self, queue: &str, envelope: RelayEnvelope) -> Result<(), RelayError>;

    /// Become the consumer of `queue` until the returned subscription is
    /// dropped.
    async fn subscribe(&self, queue: &str) -> Result<Subscription, RelayError>;

    /// Close the session. Outstanding subscriptions end.
    async fn close(&self);

    /// True once the session was closed locally or lost its relay.
    fn is_closed(&self) -> bool;
}

/// Opens sessions to relay brokers.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Connect to `relay`. When `secure` is set the transport itself must
    /// be secured, or the connect fails.
    async fn connect(
        &self,
        relay: &RelayKey,
        secure: bool,
    ) -> Result<Arc<dyn RelaySession>, RelayError>;
}
