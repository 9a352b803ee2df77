//! Shared relay sessions keyed by `address:port`.
//!
//! Many concurrent poll tasks may target clouds behind the same relay. The
//! cache guarantees one live session per relay key: the first caller
//! connects, concurrent callers wait for that connect and reuse its session.
//! Sessions are reference counted through [`SessionLease`]s and closed when
//! the last lease is released.

use crate::protocol::{RelayError, RelayKey};
use crate::session::{RelayConnector, RelaySession};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::OnceCell;

struct Slot {
    session: OnceCell<Arc<dyn RelaySession>>,
    leases: AtomicUsize,
}

impl Slot {
    fn new() -> Self {
        Self {
            session: OnceCell::new(),
            leases: AtomicUsize::new(0),
        }
    }
}

/// Process-wide map from relay key to a shared session.
pub struct RelaySessionCache {
    connector: Arc<dyn RelayConnector>,
    slots: DashMap<RelayKey, Arc<Slot>>,
}

impl RelaySessionCache {
    /// Create an empty cache that dials through `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn RelayConnector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            slots: DashMap::new(),
        })
    }

    /// Return the live session for `address:port`, connecting if needed.
    ///
    /// Concurrent callers for the same key share one connect attempt. A
    /// cached session that has since lost its relay is replaced.
    ///
    /// # Errors
    ///
    /// Returns the connector's error when the relay cannot be reached. A
    /// failed connect is not cached, so the next caller dials again.
    pub async fn get_or_create(
        self: &Arc<Self>,
        address: &str,
        port: u16,
        secure: bool,
    ) -> Result<SessionLease, RelayError> {
        let key = RelayKey::new(address, port);

        loop {
            let slot = self.acquire(&key);

            let connected = slot
                .session
                .get_or_try_init(|| async {
                    tracing::debug!("Opening relay session to {} (secure: {})", key, secure);
                    self.connector.connect(&key, secure).await
                })
                .await
                .cloned();

            match connected {
                Ok(session) if session.is_closed() => {
                    tracing::debug!("Cached session to {} is closed, reconnecting", key);
                    self.evict(&key, &slot);
                    self.release_slot(&key, &slot).await;
                }
                Ok(session) => {
                    return Ok(SessionLease {
                        cache: Arc::clone(self),
                        key,
                        slot,
                        session,
                        released: false,
                    });
                }
                Err(e) => {
                    tracing::warn!("Relay {} unreachable: {}", key, e);
                    self.release_slot(&key, &slot).await;
                    return Err(e);
                }
            }
        }
    }

    /// Number of relay keys currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no session is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// True when a slot exists for `address:port`.
    #[must_use]
    pub fn contains(&self, address: &str, port: u16) -> bool {
        self.slots.contains_key(&RelayKey::new(address, port))
    }

    /// Outstanding leases on `address:port`.
    #[must_use]
    pub fn lease_count(&self, address: &str, port: u16) -> usize {
        self.slots
            .get(&RelayKey::new(address, port))
            .map_or(0, |slot| slot.leases.load(Ordering::Acquire))
    }

    /// Close every cached session regardless of outstanding leases.
    pub async fn close_all(&self) {
        let keys: Vec<RelayKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, slot)) = self.slots.remove(&key) {
                if let Some(session) = slot.session.get() {
                    session.close().await;
                }
            }
        }
    }

    // The lease count is bumped under the shard lock so a concurrent
    // release cannot remove the slot between lookup and increment.
    fn acquire(&self, key: &RelayKey) -> Arc<Slot> {
        let entry = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new()));
        entry.leases.fetch_add(1, Ordering::AcqRel);
        Arc::clone(entry.value())
    }

    fn evict(&self, key: &RelayKey, slot: &Arc<Slot>) {
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Drop one lease; close the session if it was the last one.
    async fn release_slot(&self, key: &RelayKey, slot: &Arc<Slot>) {
        if self.decrement(key, slot) {
            if let Some(session) = slot.session.get() {
                tracing::debug!("Closing idle relay session to {}", key);
                session.close().await;
            }
        }
    }

    fn decrement(&self, key: &RelayKey, slot: &Arc<Slot>) -> bool {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), slot) => {
                if slot.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            // Evicted slot: nobody can acquire it any more.
            _ => slot.leases.fetch_sub(1, Ordering::AcqRel) == 1,
        }
    }
}

impl fmt::Debug for RelaySessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySessionCache")
            .field("sessions", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// A counted reference to a cached relay session.
///
/// Call [`release`](Self::release) when done. Dropping an unreleased lease
/// releases it too, closing the session in a background task if it was the
/// last one.
pub struct SessionLease {
    cache: Arc<RelaySessionCache>,
    key: RelayKey,
    slot: Arc<Slot>,
    session: Arc<dyn RelaySession>,
    released: bool,
}

impl SessionLease {
    /// The shared session.
    #[must_use]
    pub fn session(&self) -> &Arc<dyn RelaySession> {
        &self.session
    }

    /// Relay this lease refers to.
    #[must_use]
    pub fn key(&self) -> &RelayKey {
        &self.key
    }

    /// Give the lease back, closing the session if nobody else holds it.
    pub async fn release(mut self) {
        self.released = true;
        self.cache.release_slot(&self.key, &self.slot).await;
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("relay", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released || !self.cache.decrement(&self.key, &self.slot) {
            return;
        }
        let session = Arc::clone(&self.session);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { session.close().await });
            }
            Err(_) => tracing::warn!(
                "Last lease on {} dropped outside a runtime, session left open",
                self.key
            ),
        }
    }
}
