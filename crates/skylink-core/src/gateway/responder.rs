//! Provider side of relay tunnels.
//!
//! A [`TunnelResponder`] listens on its cloud's gateway control queue,
//! answers `Open` requests with the responder half of the handshake and
//! hands out the resulting tunnels. Only systems the local registry offers
//! for the requested service are ever dialled.

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::gatekeeper::ServiceDiscovery;
use crate::gateway::protocol::{ControlMessage, OpenTunnel};
use crate::gateway::tunnel::{
    ActiveSession, SessionRegistry, TunnelControl, TunnelParts, TunnelState, TunnelStream,
};
use crate::model::{CloudIdentity, Relay, ServiceQuery, SessionId};
use crate::orchestrator::{AllowAll, Authorization};
use crate::queues::{self, Direction};
use skylink_crypto::handshake::respond;
use skylink_crypto::{PublicKey, Role, TunnelKeypair};
use skylink_relay::{RelayEnvelope, RelayError, RelaySessionCache, SessionLease, Subscription};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// A tunnel opened by a remote consumer.
#[derive(Debug)]
pub struct IncomingTunnel {
    /// The request that opened it
    pub open: OpenTunnel,
    /// Provider end of the tunnel
    pub stream: TunnelStream,
}

impl IncomingTunnel {
    /// Dial the requested provider system and bridge it to the tunnel.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the provider cannot be reached within
    /// `connect_timeout` or the bridge fails.
    pub async fn serve_provider(
        self,
        connect_timeout: std::time::Duration,
    ) -> Result<(u64, u64)> {
        let provider = &self.open.provider;
        let target = (provider.address.as_str(), provider.port);
        let socket = match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.stream.close();
                return Err(Error::Io(format!(
                    "provider {}:{} unreachable: {e}",
                    provider.address, provider.port
                )));
            }
            Err(_) => {
                self.stream.close();
                return Err(Error::Io(format!(
                    "provider {}:{} did not accept within {connect_timeout:?}",
                    provider.address, provider.port
                )));
            }
        };
        debug!(
            "Bridging tunnel {} to {}:{}",
            hex::encode(self.open.session_id),
            provider.address,
            provider.port
        );
        self.stream.bridge(socket).await
    }
}

/// Accepts tunnels addressed to one cloud.
pub struct TunnelResponder {
    cache: Arc<RelaySessionCache>,
    relay: Relay,
    identity: CloudIdentity,
    keypair: Arc<TunnelKeypair>,
    config: GatewayConfig,
    services: Arc<dyn ServiceDiscovery>,
    authorization: Arc<dyn Authorization>,
    registry: Arc<SessionRegistry>,
    lease: SessionLease,
    control: Subscription,
}

impl TunnelResponder {
    /// Start listening for `Open` requests to `identity` on `relay`.
    ///
    /// `services` is the registry the local gatekeeper answers polls from;
    /// an `Open` is refused unless its provider is registered there for the
    /// requested service.
    ///
    /// # Errors
    ///
    /// Returns `Error::RelayUnreachable` if the relay cannot be reached and
    /// `Error::Relay` if the control queue cannot be subscribed.
    pub async fn bind(
        cache: Arc<RelaySessionCache>,
        relay: &Relay,
        identity: CloudIdentity,
        keypair: Arc<TunnelKeypair>,
        services: Arc<dyn ServiceDiscovery>,
        config: GatewayConfig,
    ) -> Result<Self> {
        let lease = cache
            .get_or_create(&relay.address, relay.port, relay.secure)
            .await
            .map_err(|e| Error::unreachable(&e))?;
        let control = match lease.session().subscribe(&queues::gateway_control(&identity)).await {
            Ok(control) => control,
            Err(e) => {
                lease.release().await;
                return Err(e.into());
            }
        };
        info!("Gateway of {} listening on {}", identity, relay.key());

        Ok(Self {
            cache,
            relay: relay.clone(),
            identity,
            keypair,
            config,
            services,
            authorization: Arc::new(AllowAll),
            registry: Arc::new(SessionRegistry::new()),
            lease,
            control,
        })
    }

    /// Decide per consumer cloud who may open tunnels here.
    #[must_use]
    pub fn with_authorization(mut self, authorization: Arc<dyn Authorization>) -> Self {
        self.authorization = authorization;
        self
    }

    /// Public half of the static tunnel key, as published in poll answers.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Snapshot of every live tunnel accepted here.
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

    /// Wait for the next acceptable `Open` and establish its tunnel.
    ///
    /// Malformed or refused requests are answered (when possible) and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::Relay` once the relay session is gone.
    pub async fn accept(&mut self) -> Result<IncomingTunnel> {
        loop {
            let Some(envelope) = self.control.recv().await else {
                return Err(Error::Relay(RelayError::Closed));
            };
            let open = match ControlMessage::from_bytes(&envelope.payload) {
                Ok(ControlMessage::Open(open)) => open,
                Ok(other) => {
                    debug!(
                        "Ignoring reply for {} on control queue",
                        hex::encode(other.session_id())
                    );
                    continue;
                }
                Err(e) => {
                    warn!("Malformed control message from {}: {}", envelope.sender, e);
                    continue;
                }
            };
            let Some(reply_to) = envelope.reply_to else {
                warn!("Open from {} without reply queue dropped", envelope.sender);
                continue;
            };

            if let Err(reason) = self.admit(&open).await {
                warn!(
                    "Refusing tunnel {} from {}: {}",
                    hex::encode(open.session_id),
                    open.consumer_cloud,
                    reason
                );
                self.reply(
                    &reply_to,
                    ControlMessage::Reject {
                        session_id: open.session_id,
                        reason,
                    },
                )
                .await;
                continue;
            }

            match self.establish(&open, &reply_to).await {
                Ok(stream) => return Ok(IncomingTunnel { open, stream }),
                Err(e) => warn!(
                    "Tunnel {} from {} not established: {}",
                    hex::encode(open.session_id),
                    open.consumer_cloud,
                    e
                ),
            }
        }
    }

    /// Accept tunnels forever, bridging each to its provider system.
    ///
    /// # Errors
    ///
    /// Returns once the relay session is gone.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let tunnel = self.accept().await?;
            let connect_timeout = self.config.socket_timeout;
            tokio::spawn(async move {
                let id = hex::encode(tunnel.open.session_id);
                match tunnel.serve_provider(connect_timeout).await {
                    Ok((up, down)) => {
                        debug!("Tunnel {} done ({} bytes in, {} bytes out)", id, up, down);
                    }
                    Err(e) => warn!("Tunnel {} bridge failed: {}", id, e),
                }
            });
        }
    }

    /// Stop listening and give the relay lease back.
    pub async fn shutdown(self) {
        drop(self.control);
        self.lease.release().await;
    }

    async fn admit(&self, open: &OpenTunnel) -> std::result::Result<(), String> {
        if open.provider_cloud != self.identity {
            return Err(format!("this gateway serves {}", self.identity));
        }
        if open.provider.address.is_empty() || open.provider.port == 0 {
            return Err("provider endpoint is invalid".to_string());
        }
        if !self.authorization.is_authorized(
            &open.consumer_cloud,
            &self.identity,
            &open.service_definition,
        ) {
            return Err(format!(
                "{} is not authorized for '{}'",
                open.consumer_cloud, open.service_definition
            ));
        }

        let offer = self
            .services
            .lookup(&ServiceQuery::new(open.service_definition.clone()))
            .await
            .map_err(|_| format!("unknown service '{}'", open.service_definition))?;
        let registered = offer
            .providers
            .iter()
            .any(|p| p.address == open.provider.address && p.port == open.provider.port);
        if !registered {
            return Err(format!(
                "{}:{} does not provide '{}'",
                open.provider.address, open.provider.port, open.service_definition
            ));
        }
        Ok(())
    }

    async fn establish(&self, open: &OpenTunnel, reply_to: &str) -> Result<TunnelStream> {
        let control = TunnelControl::new(
            open.session_id,
            open.service_definition.clone(),
            self.identity.clone(),
            open.consumer_cloud.clone(),
            self.relay.key(),
        );
        control.transition_to(TunnelState::Handshaking)?;

        let reply = match respond(
            &self.keypair,
            &open.session_id,
            &PublicKey::from_bytes(open.ephemeral_public),
        ) {
            Ok(reply) => reply,
            Err(e) => {
                let _ = control.transition_to(TunnelState::Failed);
                self.reply(
                    reply_to,
                    ControlMessage::Reject {
                        session_id: open.session_id,
                        reason: "handshake failed".into(),
                    },
                )
                .await;
                return Err(e.into());
            }
        };

        let lease = self
            .cache
            .get_or_create(&self.relay.address, self.relay.port, self.relay.secure)
            .await
            .map_err(|e| Error::unreachable(&e))?;
        let inbound = match lease
            .session()
            .subscribe(&queues::tunnel_data(&open.session_id, Direction::ToProvider))
            .await
        {
            Ok(inbound) => inbound,
            Err(e) => {
                let _ = control.transition_to(TunnelState::Failed);
                lease.release().await;
                return Err(e.into());
            }
        };

        let accept = ControlMessage::Accept {
            session_id: open.session_id,
            ephemeral_public: *reply.ephemeral_public.as_bytes(),
            confirmation: reply.confirmation,
        };
        if let Err(e) = self.publish(&lease, reply_to, accept).await {
            let _ = control.transition_to(TunnelState::Failed);
            lease.release().await;
            return Err(e);
        }

        control.transition_to(TunnelState::Established)?;
        self.registry.insert(Arc::clone(&control));
        let (sealer, opener) = reply.keys.split(Role::Responder);
        Ok(TunnelStream::start(
            TunnelParts {
                control,
                lease,
                inbound,
                outbound_queue: queues::tunnel_data(&open.session_id, Direction::ToConsumer),
                sealer,
                opener,
                chunk_size: self.config.chunk_size,
                idle_timeout: self.config.socket_timeout,
            },
            Arc::clone(&self.registry),
        ))
    }

    async fn reply(&self, reply_to: &str, message: ControlMessage) {
        if let Err(e) = self.publish(&self.lease, reply_to, message).await {
            debug!("Control reply not sent: {}", e);
        }
    }

    async fn publish(&self, lease: &SessionLease, queue: &str, message: ControlMessage) -> Result<()> {
        let envelope = RelayEnvelope::new(rand::random(), self.identity.to_string(), message.to_bytes()?);
        lease.session().publish(queue, envelope).await?;
        Ok(())
    }
}
