//! Inter-cloud orchestration: discovery, authorization, matchmaking.

pub mod matchmaking;

pub use matchmaking::{MatchmakingStrategy, ProviderMatchmaker, Selection, SelectionOutcome};

use crate::config::MatchmakingConfig;
use crate::error::Result;
use crate::gatekeeper::{Gatekeeper, GsdOutcome};
use crate::model::{Cloud, CloudIdentity, PollRequest, PollResult, PreferredProvider};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Decides whether a consumer cloud may use a provider cloud's service.
pub trait Authorization: Send + Sync {
    /// True when `consumer` may use `service` offered by `provider`.
    fn is_authorized(&self, consumer: &CloudIdentity, provider: &CloudIdentity, service: &str)
    -> bool;
}

/// Authorizes everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorization for AllowAll {
    fn is_authorized(&self, _: &CloudIdentity, _: &CloudIdentity, _: &str) -> bool {
        true
    }
}

/// Persists matchmaking outcomes.
pub trait SelectionStore: Send + Sync {
    /// Record the outcome of one orchestration, including `NoSelection`.
    ///
    /// # Errors
    ///
    /// Implementation defined.
    fn store(&self, request: &PollRequest, outcome: &SelectionOutcome) -> Result<()>;
}

/// In-memory [`SelectionStore`].
#[derive(Debug, Default)]
pub struct MemorySelectionStore {
    records: Mutex<Vec<(PollRequest, SelectionOutcome)>>,
}

impl MemorySelectionStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything stored so far.
    #[must_use]
    pub fn records(&self) -> Vec<(PollRequest, SelectionOutcome)> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SelectionStore for MemorySelectionStore {
    fn store(&self, request: &PollRequest, outcome: &SelectionOutcome) -> Result<()> {
        let mut records = match self.records.lock() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.push((request.clone(), outcome.clone()));
        Ok(())
    }
}

/// Runs discovery and picks a provider.
pub struct InterCloudOrchestrator {
    gatekeeper: Arc<Gatekeeper>,
    authorization: Arc<dyn Authorization>,
    store: Arc<dyn SelectionStore>,
    matchmaker: ProviderMatchmaker,
    store_on_no_match: bool,
}

impl InterCloudOrchestrator {
    /// Create an orchestrator.
    #[must_use]
    pub fn new(
        gatekeeper: Arc<Gatekeeper>,
        authorization: Arc<dyn Authorization>,
        store: Arc<dyn SelectionStore>,
        config: MatchmakingConfig,
    ) -> Self {
        Self {
            gatekeeper,
            authorization,
            store,
            matchmaker: ProviderMatchmaker::new(config.strategy),
            store_on_no_match: config.store_on_no_match,
        }
    }

    /// Discover `request` across `clouds` and select a provider.
    ///
    /// Answers from unauthorized provider clouds are dropped before
    /// matchmaking. The outcome is handed to the store before returning.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoCandidates` when no authorized cloud answered, or
    /// whatever the store reports.
    pub async fn orchestrate(
        &self,
        clouds: &[Cloud],
        request: PollRequest,
        preferred: &[PreferredProvider],
    ) -> Result<SelectionOutcome> {
        let outcome = self
            .gatekeeper
            .global_service_discovery(clouds, request.clone())
            .await;
        info!(
            "Discovery for '{}': {} answered, {} failed",
            request.query.service_definition,
            outcome.success_count(),
            outcome.failure_count()
        );

        let results = self.authorized(&request, outcome);
        let selection = self
            .matchmaker
            .select(&results, preferred, self.store_on_no_match)?;
        self.store.store(&request, &selection)?;
        Ok(selection)
    }

    fn authorized(&self, request: &PollRequest, outcome: GsdOutcome) -> Vec<PollResult> {
        outcome
            .results
            .into_iter()
            .filter(|result| match result.answer() {
                Some(answer) => {
                    let allowed = self.authorization.is_authorized(
                        &request.requester,
                        &answer.provider_cloud,
                        &request.query.service_definition,
                    );
                    if !allowed {
                        warn!(
                            "{} is not authorized to use {} from {}",
                            request.requester,
                            request.query.service_definition,
                            answer.provider_cloud
                        );
                    }
                    allowed
                }
                None => true,
            })
            .collect()
    }
}
