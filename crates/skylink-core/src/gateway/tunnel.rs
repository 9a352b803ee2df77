//! Encrypted tunnel streams over relay queues.
//!
//! A [`TunnelStream`] is the application end of a tunnel. Behind it a pump
//! task moves bytes between the stream and the two relay data queues of the
//! session:
//!
//! - outbound: application bytes are cut into chunks, sealed with the next
//!   sequence number of the local direction and published
//! - inbound: frames are authenticated, duplicates dropped by the replay
//!   window, and the rest delivered to the application in sequence order
//!
//! A frame with the FIN flag ends a direction. The tunnel closes once both
//! directions are finished, on explicit close, or after the idle timeout.
//! Losing the relay session fails the tunnel.

use crate::error::{Error, Result};
use crate::gateway::protocol::{TunnelFrame, frame_aad};
use crate::model::{CloudIdentity, SessionId};
use dashmap::DashMap;
use skylink_crypto::CryptoError;
use skylink_crypto::aead::{OpeningKey, SealingKey};
use skylink_relay::{RelayEnvelope, RelayKey, RelaySession, SessionLease, Subscription};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Frames that may wait for a missing predecessor before the tunnel fails.
pub const MAX_REORDER_FRAMES: usize = 1024;

/// Tunnel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// Request validated, nothing sent yet
    Created,
    /// `Open` sent, waiting for the peer
    Handshaking,
    /// Keys agreed, data flowing
    Established,
    /// FIN sent or received, draining
    Closing,
    /// Shut down cleanly
    Closed,
    /// Setup or transport failure
    Failed,
}

impl TunnelState {
    /// Whether moving from `self` to `to` is allowed.
    #[must_use]
    pub fn can_transition(self, to: TunnelState) -> bool {
        matches!(
            (self, to),
            (TunnelState::Created, TunnelState::Handshaking)
                | (
                    TunnelState::Handshaking,
                    TunnelState::Established | TunnelState::Failed
                )
                | (
                    TunnelState::Established,
                    TunnelState::Closing | TunnelState::Failed
                )
                | (TunnelState::Closing, TunnelState::Closed)
        )
    }

    /// `Closed` and `Failed` have no way out.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of a live tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    /// Tunnel id
    pub session_id: SessionId,
    /// Service the tunnel carries
    pub service_definition: String,
    /// Cloud this end belongs to
    pub local_cloud: CloudIdentity,
    /// Cloud at the other end
    pub remote_cloud: CloudIdentity,
    /// Relay carrying the tunnel
    pub relay: RelayKey,
    /// State when the snapshot was taken
    pub state: TunnelState,
    /// When the tunnel was created
    pub opened_at: SystemTime,
}

/// Shared state of one tunnel: identity, lifecycle and close signal.
pub(crate) struct TunnelControl {
    info: ActiveSession,
    state: watch::Sender<TunnelState>,
    close: Notify,
}

impl TunnelControl {
    pub(crate) fn new(
        session_id: SessionId,
        service_definition: String,
        local_cloud: CloudIdentity,
        remote_cloud: CloudIdentity,
        relay: RelayKey,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(TunnelState::Created);
        Arc::new(Self {
            info: ActiveSession {
                session_id,
                service_definition,
                local_cloud,
                remote_cloud,
                relay,
                state: TunnelState::Created,
                opened_at: SystemTime::now(),
            },
            state,
            close: Notify::new(),
        })
    }

    pub(crate) fn session_id(&self) -> &SessionId {
        &self.info.session_id
    }

    pub(crate) fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub(crate) fn snapshot(&self) -> ActiveSession {
        ActiveSession {
            state: self.state(),
            ..self.info.clone()
        }
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the transition is not allowed.
    pub(crate) fn transition_to(&self, to: TunnelState) -> Result<()> {
        let mut from = None;
        self.state.send_if_modified(|state| {
            if state.can_transition(to) {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                debug!(
                    "Tunnel {} state transition: {:?} -> {:?}",
                    hex::encode(self.session_id()),
                    from,
                    to
                );
                Ok(())
            }
            None => Err(Error::InvalidState(
                format!("tunnel cannot move from {} to {to}", self.state()).into(),
            )),
        }
    }

    fn request_close(&self) {
        self.close.notify_one();
    }

    async fn wait_terminal(&self) -> TunnelState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

/// Live tunnels of one gateway.
#[derive(Default)]
pub struct SessionRegistry {
    tunnels: DashMap<SessionId, Arc<TunnelControl>>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, control: Arc<TunnelControl>) {
        self.tunnels.insert(*control.session_id(), control);
    }

    pub(crate) fn remove(&self, session_id: &SessionId) {
        self.tunnels.remove(session_id);
    }

    /// Snapshot of every live tunnel.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ActiveSession> {
        self.tunnels.iter().map(|entry| entry.value().snapshot()).collect()
    }

    /// Ask a tunnel to close.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if no such tunnel is live.
    pub fn close(&self, session_id: &SessionId) -> Result<()> {
        let control = self
            .tunnels
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::SessionNotFound(*session_id))?;
        control.request_close();
        Ok(())
    }

    /// Number of live tunnels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// True when no tunnel is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("tunnels", &self.tunnels.len())
            .finish()
    }
}

/// Everything the pump of an established tunnel needs.
pub(crate) struct TunnelParts {
    pub control: Arc<TunnelControl>,
    pub lease: SessionLease,
    pub inbound: Subscription,
    pub outbound_queue: String,
    pub sealer: SealingKey,
    pub opener: OpeningKey,
    pub chunk_size: usize,
    pub idle_timeout: Duration,
}

/// Application end of an established tunnel.
pub struct TunnelStream {
    io: DuplexStream,
    control: Arc<TunnelControl>,
}

impl TunnelStream {
    /// Start the pump task of an established tunnel.
    pub(crate) fn start(parts: TunnelParts, registry: Arc<SessionRegistry>) -> Self {
        let (io, pump_io) = tokio::io::duplex(parts.chunk_size.saturating_mul(4));
        let control = Arc::clone(&parts.control);

        info!(
            "Tunnel {} established ({} <-> {} via {})",
            hex::encode(control.session_id()),
            control.info.local_cloud,
            control.info.remote_cloud,
            control.info.relay
        );

        tokio::spawn(Pump::new(parts, registry).run(pump_io));
        Self { io, control }
    }

    /// Tunnel id.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        *self.control.session_id()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        self.control.state()
    }

    /// Snapshot of this tunnel.
    #[must_use]
    pub fn info(&self) -> ActiveSession {
        self.control.snapshot()
    }

    /// Ask the pump to send FIN and shut the tunnel down.
    pub fn close(&self) {
        self.control.request_close();
    }

    /// Wait until the tunnel is `Closed` or `Failed`.
    pub async fn closed(&self) -> TunnelState {
        self.control.wait_terminal().await
    }

    /// Couple a local socket to this tunnel until both sides finish.
    ///
    /// Returns bytes copied `(socket -> tunnel, tunnel -> socket)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if either side fails.
    pub async fn bridge(mut self, mut socket: TcpStream) -> Result<(u64, u64)> {
        let copied = tokio::io::copy_bidirectional(&mut socket, &mut self).await;
        self.close();
        let (up, down) = copied?;
        debug!(
            "Tunnel {} bridge finished ({} bytes up, {} bytes down)",
            hex::encode(self.session_id()),
            up,
            down
        );
        Ok((up, down))
    }
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("session_id", &hex::encode(self.control.session_id()))
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// How the pump loop ended.
enum Exit {
    /// Both FINs exchanged, explicit close, idle timeout or application gone
    Clean,
    /// Relay or protocol failure
    Failed(Error),
}

/// Application to relay direction.
struct Outbound {
    session_id: SessionId,
    session: Arc<dyn RelaySession>,
    queue: String,
    sender: String,
    sealer: SealingKey,
    chunk_size: usize,
    fin_sent: bool,
    // Sealed frame whose publish has not returned yet.
    unconfirmed: Option<RelayEnvelope>,
}

impl Outbound {
    /// Forward application bytes until the application shuts its write side.
    async fn run(&mut self, app: &mut ReadHalf<DuplexStream>, activity: &Notify) -> Result<()> {
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = match app.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    debug!(
                        "Tunnel {}: application read failed: {}",
                        hex::encode(self.session_id),
                        e
                    );
                    0
                }
            };
            self.send(&buf[..n], n == 0).await?;
            activity.notify_one();
            if n == 0 {
                self.fin_sent = true;
                return Ok(());
            }
        }
    }

    /// Seal and publish one frame.
    ///
    /// A frame whose publish was cancelled is published again first, so the
    /// peer never sees a gap in the sequence. A repeat is dropped by the
    /// peer's replay window.
    async fn send(&mut self, data: &[u8], fin: bool) -> Result<()> {
        self.flush().await?;
        let aad = frame_aad(&self.session_id, self.sealer.next_seq(), fin);
        let (seq, ciphertext) = self.sealer.seal(&aad, data)?;
        let frame = TunnelFrame {
            seq,
            fin,
            ciphertext,
        };
        self.unconfirmed = Some(RelayEnvelope::new(
            seq,
            self.sender.clone(),
            frame.to_bytes()?,
        ));
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(envelope) = &self.unconfirmed {
            self.session.publish(&self.queue, envelope.clone()).await?;
            self.unconfirmed = None;
        }
        Ok(())
    }
}

/// Relay to application direction.
struct Inbound {
    session_id: SessionId,
    relay: RelayKey,
    opener: OpeningKey,
    next_expected: u64,
    reorder: BTreeMap<u64, (Vec<u8>, bool)>,
}

impl Inbound {
    /// Deliver frames in order until the peer's FIN.
    async fn run(
        &mut self,
        frames: &mut Subscription,
        app: &mut WriteHalf<DuplexStream>,
        activity: &Notify,
    ) -> Result<()> {
        loop {
            let Some(envelope) = frames.recv().await else {
                return Err(Error::RelayUnreachable(format!(
                    "relay session to {} lost",
                    self.relay
                )));
            };
            activity.notify_one();
            if self.receive(envelope, app).await? {
                return Ok(());
            }
        }
    }

    /// Handle one inbound envelope. Returns true once the peer's FIN has
    /// been delivered in order.
    async fn receive(
        &mut self,
        envelope: RelayEnvelope,
        app: &mut WriteHalf<DuplexStream>,
    ) -> Result<bool> {
        let id = hex::encode(self.session_id);
        let frame = match TunnelFrame::from_bytes(&envelope.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Tunnel {}: undecodable frame dropped: {}", id, e);
                return Ok(false);
            }
        };
        if frame.seq < self.next_expected || self.reorder.contains_key(&frame.seq) {
            debug!("Tunnel {}: duplicate frame {} dropped", id, frame.seq);
            return Ok(false);
        }

        let aad = frame_aad(&self.session_id, frame.seq, frame.fin);
        let plaintext = match self.opener.open(frame.seq, &aad, &frame.ciphertext) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::ReplayDetected(seq)) => {
                debug!("Tunnel {}: replayed frame {} dropped", id, seq);
                return Ok(false);
            }
            Err(e) => {
                warn!("Tunnel {}: frame {} rejected: {}", id, frame.seq, e);
                return Ok(false);
            }
        };

        self.reorder.insert(frame.seq, (plaintext, frame.fin));
        if self.reorder.len() > MAX_REORDER_FRAMES {
            return Err(Error::invalid_state("too many frames out of order"));
        }

        while let Some((data, fin)) = self.reorder.remove(&self.next_expected) {
            self.next_expected += 1;
            if !data.is_empty() {
                app.write_all(&data).await?;
            }
            if fin {
                app.shutdown().await?;
                self.reorder.clear();
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Drives both directions of one tunnel and tears it down.
struct Pump {
    control: Arc<TunnelControl>,
    registry: Arc<SessionRegistry>,
    lease: SessionLease,
    frames: Subscription,
    outbound: Outbound,
    inbound: Inbound,
    idle_timeout: Duration,
}

impl Pump {
    fn new(parts: TunnelParts, registry: Arc<SessionRegistry>) -> Self {
        let session_id = *parts.control.session_id();
        Self {
            outbound: Outbound {
                session_id,
                session: Arc::clone(parts.lease.session()),
                queue: parts.outbound_queue,
                sender: parts.control.info.local_cloud.to_string(),
                sealer: parts.sealer,
                chunk_size: parts.chunk_size.max(1),
                fin_sent: false,
                unconfirmed: None,
            },
            inbound: Inbound {
                session_id,
                relay: parts.control.info.relay.clone(),
                opener: parts.opener,
                next_expected: 0,
                reorder: BTreeMap::new(),
            },
            control: parts.control,
            registry,
            lease: parts.lease,
            frames: parts.inbound,
            idle_timeout: parts.idle_timeout,
        }
    }

    async fn run(mut self, io: DuplexStream) {
        let id = hex::encode(self.control.session_id());
        let exit = self.pump(io).await;

        match exit {
            Exit::Clean => {
                if !self.outbound.fin_sent {
                    if let Err(e) = self.outbound.send(&[], true).await {
                        debug!("Tunnel {}: FIN not sent: {}", id, e);
                    }
                }
                self.begin_closing();
                let _ = self.control.transition_to(TunnelState::Closed);
                info!("Tunnel {} closed", id);
            }
            Exit::Failed(e) => {
                warn!("Tunnel {} failed: {}", id, e);
                if self.control.transition_to(TunnelState::Failed).is_err() {
                    let _ = self.control.transition_to(TunnelState::Closed);
                }
            }
        }

        let Pump {
            control,
            registry,
            lease,
            frames,
            ..
        } = self;
        drop(frames);
        registry.remove(control.session_id());
        lease.release().await;
    }

    async fn pump(&mut self, io: DuplexStream) -> Exit {
        let (mut app_rx, mut app_tx) = tokio::io::split(io);
        let activity = Notify::new();
        let control = Arc::clone(&self.control);
        let idle_timeout = self.idle_timeout;

        let sending = self.outbound.run(&mut app_rx, &activity);
        let receiving = self.inbound.run(&mut self.frames, &mut app_tx, &activity);
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(sending, receiving, idle);

        let mut sent = false;
        let mut received = false;
        loop {
            tokio::select! {
                done = &mut sending, if !sent => match done {
                    Ok(()) => {
                        sent = true;
                        begin_closing(&control);
                        if received {
                            return Exit::Clean;
                        }
                    }
                    Err(e) => return Exit::Failed(e),
                },
                done = &mut receiving, if !received => match done {
                    Ok(()) => {
                        received = true;
                        begin_closing(&control);
                        if sent {
                            return Exit::Clean;
                        }
                    }
                    Err(Error::Io(e)) => {
                        debug!(
                            "Tunnel {}: application gone: {}",
                            hex::encode(control.session_id()),
                            e
                        );
                        return Exit::Clean;
                    }
                    Err(e) => return Exit::Failed(e),
                },
                () = activity.notified() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                }
                () = &mut idle => {
                    info!(
                        "Tunnel {} idle for {:?}, closing",
                        hex::encode(control.session_id()),
                        idle_timeout
                    );
                    return Exit::Clean;
                }
                () = control.close.notified() => {
                    debug!("Tunnel {}: close requested", hex::encode(control.session_id()));
                    return Exit::Clean;
                }
            }
        }
    }

    fn begin_closing(&self) {
        begin_closing(&self.control);
    }
}

fn begin_closing(control: &TunnelControl) {
    if control.state() == TunnelState::Established {
        let _ = control.transition_to(TunnelState::Closing);
    }
}
