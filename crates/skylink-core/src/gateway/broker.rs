//! Consumer side of relay tunnels.

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::gateway::protocol::{ControlMessage, OpenTunnel};
use crate::gateway::tunnel::{
    ActiveSession, SessionRegistry, TunnelControl, TunnelParts, TunnelState, TunnelStream,
};
use crate::gateway::validation::{GatewayConnectionRequest, ValidatedRequest};
use crate::model::SessionId;
use crate::queues::{self, Direction};
use skylink_crypto::{InitiatorHandshake, PublicKey, Role, TunnelKeys};
use skylink_relay::{RelayEnvelope, RelaySession, RelaySessionCache, Subscription};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Opens tunnels to remote providers through relays.
pub struct TunnelBroker {
    cache: Arc<RelaySessionCache>,
    config: GatewayConfig,
    registry: Arc<SessionRegistry>,
}

/// A tunnel waiting for, or serving, one local consumer connection.
#[derive(Debug)]
pub struct ExposedTunnel {
    /// Local port the consumer should connect to
    pub port: u16,
    /// Tunnel id
    pub session_id: SessionId,
    handle: JoinHandle<Result<(u64, u64)>>,
}

impl ExposedTunnel {
    /// Wait for the bridged connection to finish.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when no consumer connected within the socket
    /// timeout or the bridge failed.
    pub async fn join(self) -> Result<(u64, u64)> {
        self.handle
            .await
            .map_err(|e| Error::Io(format!("bridge task failed: {e}")))?
    }
}

impl TunnelBroker {
    /// Broker dialling relays through `cache`.
    #[must_use]
    pub fn new(cache: Arc<RelaySessionCache>, config: GatewayConfig) -> Self {
        Self {
            cache,
            config,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// Open an encrypted tunnel to the provider named in `request`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidRequest` for the first validation failure
    /// - `Error::RelayUnreachable` when no relay session can be opened
    /// - `Error::TunnelSetupFailed` when the handshake does not complete
    pub async fn connect(&self, request: &GatewayConnectionRequest) -> Result<TunnelStream> {
        let request = request.validate()?;
        if self.config.require_secure_relay && !request.relay.secure {
            return Err(Error::invalid_request("relay is not secure"));
        }

        let lease = self
            .cache
            .get_or_create(&request.relay.address, request.relay.port, request.relay.secure)
            .await
            .map_err(|e| Error::unreachable(&e))?;

        let session_id: SessionId = rand::random();
        let control = TunnelControl::new(
            session_id,
            request.service_definition.clone(),
            request.consumer_cloud.clone(),
            request.provider_cloud.clone(),
            lease.key().clone(),
        );
        control.transition_to(TunnelState::Handshaking)?;
        self.registry.insert(Arc::clone(&control));

        let handshake = tokio::time::timeout(
            self.config.handshake_timeout,
            handshake(lease.session().as_ref(), &request, session_id),
        )
        .await
        .unwrap_or(Err(Error::tunnel_setup("handshake timed out")));

        let (keys, inbound) = match handshake {
            Ok(established) => established,
            Err(e) => {
                warn!(
                    "Tunnel {} to {} failed: {}",
                    hex::encode(session_id),
                    request.provider_cloud,
                    e
                );
                let _ = control.transition_to(TunnelState::Failed);
                self.registry.remove(&session_id);
                lease.release().await;
                return Err(e);
            }
        };

        control.transition_to(TunnelState::Established)?;
        let (sealer, opener) = keys.split(Role::Initiator);
        Ok(TunnelStream::start(
            TunnelParts {
                control,
                lease,
                inbound,
                outbound_queue: queues::tunnel_data(&session_id, Direction::ToProvider),
                sealer,
                opener,
                chunk_size: self.config.chunk_size,
                idle_timeout: self.config.socket_timeout,
            },
            Arc::clone(&self.registry),
        ))
    }

    /// Open a tunnel and serve it to the first local consumer that connects.
    ///
    /// A port is taken from the configured range before the tunnel is
    /// opened. The consumer must connect within the socket timeout.
    ///
    /// # Errors
    ///
    /// Fails like [`connect`](Self::connect), or with `Error::Io` when no
    /// port in the range can be bound.
    pub async fn expose_local(&self, request: &GatewayConnectionRequest) -> Result<ExposedTunnel> {
        request.validate()?;
        let listener = self.bind_local().await?;
        let port = listener.local_addr()?.port();

        let stream = self.connect(request).await?;
        let session_id = stream.session_id();
        let accept_timeout = self.config.socket_timeout;
        info!(
            "Tunnel {} exposed on {}:{}",
            hex::encode(session_id),
            self.config.bind_address,
            port
        );

        let handle = tokio::spawn(async move {
            let accepted = tokio::time::timeout(accept_timeout, listener.accept()).await;
            match accepted {
                Ok(Ok((socket, peer))) => {
                    debug!("Consumer {} connected to port {}", peer, port);
                    stream.bridge(socket).await
                }
                Ok(Err(e)) => {
                    stream.close();
                    Err(e.into())
                }
                Err(_) => {
                    stream.close();
                    Err(Error::Io(format!(
                        "no consumer connected to port {port} within {accept_timeout:?}"
                    )))
                }
            }
        });

        Ok(ExposedTunnel {
            port,
            session_id,
            handle,
        })
    }

    /// Snapshot of every live tunnel opened by this broker.
    #[must_use]
    pub fn active_sessions(&self) -> Vec<ActiveSession> {
        self.registry.snapshot()
    }

    /// Ask a tunnel to close.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if the tunnel is not live.
    pub fn close_session(&self, session_id: &SessionId) -> Result<()> {
        self.registry.close(session_id)
    }

    async fn bind_local(&self) -> Result<TcpListener> {
        for port in self.config.port_range.clone() {
            match TcpListener::bind((self.config.bind_address, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!("Port {} unavailable: {}", port, e),
            }
        }
        Err(Error::Io(format!(
            "no free port in {}-{}",
            self.config.port_range.start(),
            self.config.port_range.end()
        )))
    }
}

/// Send `Open` and wait for the matching `Accept`.
async fn handshake(
    session: &dyn RelaySession,
    request: &ValidatedRequest,
    session_id: SessionId,
) -> Result<(TunnelKeys, Subscription)> {
    let setup = |what: &str, e: &dyn std::fmt::Display| {
        Error::TunnelSetupFailed(format!("{what}: {e}").into())
    };

    let reply_queue = queues::gateway_reply(&session_id);
    let mut replies = session
        .subscribe(&reply_queue)
        .await
        .map_err(|e| setup("subscribe to reply queue", &e))?;
    let inbound = session
        .subscribe(&queues::tunnel_data(&session_id, Direction::ToConsumer))
        .await
        .map_err(|e| setup("subscribe to data queue", &e))?;

    let initiator = InitiatorHandshake::new(session_id, request.provider_key);
    let open = ControlMessage::Open(OpenTunnel {
        session_id,
        service_definition: request.service_definition.clone(),
        consumer: request.consumer.clone(),
        consumer_cloud: request.consumer_cloud.clone(),
        provider: request.provider.clone(),
        provider_cloud: request.provider_cloud.clone(),
        ephemeral_public: *initiator.ephemeral_public().as_bytes(),
    });
    let envelope = RelayEnvelope::new(
        rand::random(),
        request.consumer_cloud.to_string(),
        open.to_bytes()?,
    )
    .with_reply_to(reply_queue);

    session
        .publish(&queues::gateway_control(&request.provider_cloud), envelope)
        .await
        .map_err(|e| setup("publish Open", &e))?;
    debug!(
        "Tunnel {}: Open sent to {}",
        hex::encode(session_id),
        request.provider_cloud
    );

    loop {
        let Some(envelope) = replies.recv().await else {
            return Err(Error::tunnel_setup("relay session closed during handshake"));
        };
        let message = ControlMessage::from_bytes(&envelope.payload)
            .map_err(|e| setup("malformed handshake reply", &e))?;
        if message.session_id() != &session_id {
            debug!("Ignoring control reply for another tunnel");
            continue;
        }

        return match message {
            ControlMessage::Accept {
                ephemeral_public,
                confirmation,
                ..
            } => {
                let keys = initiator
                    .finish(&PublicKey::from_bytes(ephemeral_public), &confirmation)
                    .map_err(|e| setup("key confirmation", &e))?;
                Ok((keys, inbound))
            }
            ControlMessage::Reject { reason, .. } => Err(Error::TunnelSetupFailed(
                format!("rejected by provider gateway: {reason}").into(),
            )),
            ControlMessage::Open(_) => Err(Error::tunnel_setup("unexpected Open on reply queue")),
        };
    }
}
