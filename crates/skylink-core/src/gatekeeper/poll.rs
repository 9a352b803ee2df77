//! Discovery polls over a relay: the asking side ([`PollTask`]) and the
//! answering side ([`PollResponder`]).
//!
//! ```text
//! PollTask                        relay                     PollResponder
//!    | subscribe reply.<id>         |                               |
//!    |-- publish requests.<cloud> ->|-- deliver ------------------->|
//!    |                              |<- publish reply.<id> ---------|
//!    |<- deliver (correlation id) --|                               |
//! ```

use crate::error::{Error, Result};
use crate::model::{
    Cloud, CloudIdentity, PollAnswer, PollFailure, PollRequest, PollResult, ServiceQuery,
    SystemDescriptor,
};
use crate::queues;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skylink_crypto::PublicKey;
use skylink_relay::{RelayEnvelope, RelaySession, Subscription};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Reply payload of a discovery poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollReply {
    /// The service is offered
    Answer(PollAnswer),
    /// The remote gatekeeper could not answer
    Error(String),
}

/// One discovery query to one remote cloud.
pub struct PollTask {
    session: Arc<dyn RelaySession>,
    cloud: CloudIdentity,
    credentials: Option<String>,
    request: Arc<PollRequest>,
    timeout: Duration,
}

impl PollTask {
    /// Prepare a poll of `cloud` over `session`.
    #[must_use]
    pub fn new(
        session: Arc<dyn RelaySession>,
        cloud: &Cloud,
        request: Arc<PollRequest>,
        timeout: Duration,
    ) -> Self {
        Self {
            session,
            cloud: cloud.identity.clone(),
            credentials: cloud.authentication_info.clone(),
            request,
            timeout,
        }
    }

    /// Send the query and wait for the correlated reply.
    ///
    /// Never fails: timeouts, relay errors and remote errors come back as a
    /// failed [`PollResult`].
    pub async fn run(self) -> PollResult {
        let cloud = self.cloud.clone();
        match self.exchange().await {
            Ok(answer) => {
                tracing::debug!("{} answered for {}", cloud, answer.service_definition);
                PollResult::success(cloud, answer)
            }
            Err(failure) => {
                tracing::debug!("Poll of {} failed: {}", cloud, failure);
                PollResult::failure(cloud, failure)
            }
        }
    }

    async fn exchange(self) -> std::result::Result<PollAnswer, PollFailure> {
        let correlation_id: u64 = rand::random();
        let reply_queue = queues::gatekeeper_reply(correlation_id);

        let mut replies = self
            .session
            .subscribe(&reply_queue)
            .await
            .map_err(|e| PollFailure::Transport(e.to_string()))?;

        let payload =
            bincode::serialize(&*self.request).map_err(|e| PollFailure::Transport(e.to_string()))?;
        let envelope = RelayEnvelope::new(correlation_id, self.request.requester.to_string(), payload)
            .with_reply_to(reply_queue)
            .with_credentials(self.credentials);

        self.session
            .publish(&queues::gatekeeper_requests(&self.cloud), envelope)
            .await
            .map_err(|e| PollFailure::Transport(e.to_string()))?;

        let reply = tokio::time::timeout(self.timeout, next_reply(&mut replies, correlation_id))
            .await
            .map_err(|_| PollFailure::Timeout)?
            .ok_or_else(|| PollFailure::Transport("relay session closed".to_string()))?;

        match bincode::deserialize::<PollReply>(&reply.payload) {
            Ok(PollReply::Answer(answer)) => Ok(answer),
            Ok(PollReply::Error(message)) => Err(PollFailure::Remote(message)),
            Err(e) => Err(PollFailure::Transport(format!("undecodable reply: {e}"))),
        }
    }
}

async fn next_reply(replies: &mut Subscription, correlation_id: u64) -> Option<RelayEnvelope> {
    loop {
        let envelope = replies.recv().await?;
        if envelope.correlation_id == correlation_id {
            return Some(envelope);
        }
        tracing::debug!(
            "Ignoring reply {:016x} on {}",
            envelope.correlation_id,
            replies.queue()
        );
    }
}

/// What a cloud offers for one service definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceOffer {
    /// Systems providing the service
    pub providers: Vec<SystemDescriptor>,
    /// Interfaces the service is offered on
    pub interfaces: Vec<String>,
    /// Service metadata
    pub metadata: BTreeMap<String, String>,
}

/// Local service registry lookup.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Find providers for `query`. An `Err` is reported to the asking cloud.
    async fn lookup(&self, query: &ServiceQuery) -> std::result::Result<ServiceOffer, String>;
}

/// Decides whether a requesting cloud may query this one.
pub trait Authenticator: Send + Sync {
    /// Check the credentials that came with a poll.
    fn authenticate(&self, requester: &CloudIdentity, credentials: Option<&str>) -> bool;
}

/// Accepts polls carrying one shared secret.
#[derive(Debug, Clone)]
pub struct SharedSecret(pub String);

impl Authenticator for SharedSecret {
    fn authenticate(&self, _requester: &CloudIdentity, credentials: Option<&str>) -> bool {
        credentials == Some(self.0.as_str())
    }
}

/// In-memory service registry.
#[derive(Debug, Clone, Default)]
pub struct StaticServiceRegistry {
    offers: HashMap<String, ServiceOffer>,
}

impl StaticServiceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `service_definition`.
    #[must_use]
    pub fn with_service(mut self, service_definition: impl Into<String>, offer: ServiceOffer) -> Self {
        self.offers.insert(service_definition.into(), offer);
        self
    }
}

#[async_trait]
impl ServiceDiscovery for StaticServiceRegistry {
    async fn lookup(&self, query: &ServiceQuery) -> std::result::Result<ServiceOffer, String> {
        let offer = self
            .offers
            .get(&query.service_definition)
            .ok_or_else(|| format!("service '{}' is not offered", query.service_definition))?;

        let interfaces: Vec<String> = if query.interface_requirements.is_empty() {
            offer.interfaces.clone()
        } else {
            offer
                .interfaces
                .iter()
                .filter(|i| query.interface_requirements.contains(i))
                .cloned()
                .collect()
        };
        if interfaces.is_empty() {
            return Err("no offered interface satisfies the requirements".to_string());
        }

        let metadata_ok = query
            .metadata_requirements
            .iter()
            .all(|(k, v)| offer.metadata.get(k) == Some(v));
        if !metadata_ok {
            return Err("metadata requirements not met".to_string());
        }

        Ok(ServiceOffer {
            interfaces,
            ..offer.clone()
        })
    }
}

/// Answers discovery polls addressed to this cloud.
pub struct PollResponder {
    identity: CloudIdentity,
    discovery: Arc<dyn ServiceDiscovery>,
    authenticator: Option<Arc<dyn Authenticator>>,
    gateway_key: Option<PublicKey>,
}

impl PollResponder {
    /// Responder for `identity` backed by `discovery`.
    #[must_use]
    pub fn new(identity: CloudIdentity, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            identity,
            discovery,
            authenticator: None,
            gateway_key: None,
        }
    }

    /// Check credentials of every poll.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Advertise this cloud's gateway to requesters that run one too.
    #[must_use]
    pub fn with_gateway_key(mut self, key: PublicKey) -> Self {
        self.gateway_key = Some(key);
        self
    }

    /// Answer polls until the session closes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Relay` if the request queue cannot be subscribed.
    pub async fn serve(self: Arc<Self>, session: Arc<dyn RelaySession>) -> Result<()> {
        let queue = queues::gatekeeper_requests(&self.identity);
        let mut requests = session.subscribe(&queue).await?;
        tracing::info!("Gatekeeper of {} listening on {}", self.identity, session.relay());

        while let Some(envelope) = requests.recv().await {
            let Some(reply_to) = envelope.reply_to.clone() else {
                tracing::warn!("Poll from {} has no reply queue, dropped", envelope.sender);
                continue;
            };
            let responder = Arc::clone(&self);
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let reply = responder.answer(&envelope).await;
                let result = match bincode::serialize(&reply) {
                    Ok(payload) => {
                        let envelope = RelayEnvelope::new(
                            envelope.correlation_id,
                            responder.identity.to_string(),
                            payload,
                        );
                        session.publish(&reply_to, envelope).await.map_err(Error::from)
                    }
                    Err(e) => Err(Error::from(e)),
                };
                if let Err(e) = result {
                    tracing::warn!("Cannot answer poll on {}: {}", reply_to, e);
                }
            });
        }

        tracing::info!("Gatekeeper of {} stopped: relay session ended", self.identity);
        Ok(())
    }

    /// Spawn [`serve`](Self::serve) on the runtime.
    pub fn spawn(self: Arc<Self>, session: Arc<dyn RelaySession>) -> JoinHandle<Result<()>> {
        tokio::spawn(self.serve(session))
    }

    /// Build the reply to one poll envelope.
    pub async fn answer(&self, envelope: &RelayEnvelope) -> PollReply {
        let request: PollRequest = match bincode::deserialize(&envelope.payload) {
            Ok(request) => request,
            Err(_) => return PollReply::Error("malformed poll request".to_string()),
        };

        if let Some(authenticator) = &self.authenticator {
            if !authenticator.authenticate(&request.requester, envelope.credentials.as_deref()) {
                tracing::warn!("Rejected poll from {}: bad credentials", request.requester);
                return PollReply::Error("unauthorized".to_string());
            }
        }

        let offer = match self.discovery.lookup(&request.query).await {
            Ok(offer) if offer.providers.is_empty() => {
                return PollReply::Error(format!(
                    "no provider for '{}'",
                    request.query.service_definition
                ));
            }
            Ok(offer) => offer,
            Err(message) => return PollReply::Error(message),
        };

        let gateway_public_key = if request.gateway_is_present {
            self.gateway_key.map(|key| key.to_base64())
        } else {
            None
        };

        PollReply::Answer(PollAnswer {
            provider_cloud: self.identity.clone(),
            service_definition: request.query.service_definition,
            providers: offer.providers,
            interfaces: offer.interfaces,
            gateway_public_key,
        })
    }
}
