//! Provider selection over discovery results.

use crate::error::{Error, Result};
use crate::model::{PollAnswer, PollResult, PreferredProvider, SystemDescriptor};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How to pick a provider when no preferred provider answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchmakingStrategy {
    /// Fall back to the first successful answer
    #[default]
    FirstMatch,
    /// Fall back to a uniformly random successful answer
    RandomFallback,
}

/// The chosen provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Answer the provider came from
    pub answer: PollAnswer,
    /// Chosen system; `None` when the answer listed no providers
    pub provider: Option<SystemDescriptor>,
    /// Whether a preferred provider was matched
    pub matched_preference: bool,
}

/// Result of matchmaking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// A provider was chosen
    Selected(Selection),
    /// Nothing preferred answered and the caller asked to record that
    NoSelection,
}

impl SelectionOutcome {
    /// The selection, if any.
    #[must_use]
    pub fn selection(&self) -> Option<&Selection> {
        match self {
            SelectionOutcome::Selected(selection) => Some(selection),
            SelectionOutcome::NoSelection => None,
        }
    }
}

/// Picks one provider out of a discovery round.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderMatchmaker {
    strategy: MatchmakingStrategy,
}

impl ProviderMatchmaker {
    /// Matchmaker using `strategy` for the fallback pick.
    #[must_use]
    pub fn new(strategy: MatchmakingStrategy) -> Self {
        Self { strategy }
    }

    /// Configured strategy.
    #[must_use]
    pub fn strategy(&self) -> MatchmakingStrategy {
        self.strategy
    }

    /// Choose a provider.
    ///
    /// Successful results are scanned in order and, for each, the preferred
    /// providers in order; the first pair that matches wins. Without a match
    /// the outcome is [`SelectionOutcome::NoSelection`] when
    /// `store_on_no_match` is set, or the strategy's fallback pick otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoCandidates` when no result is a success.
    pub fn select(
        &self,
        results: &[PollResult],
        preferred: &[PreferredProvider],
        store_on_no_match: bool,
    ) -> Result<SelectionOutcome> {
        let answers: Vec<&PollAnswer> = results.iter().filter_map(PollResult::answer).collect();
        if answers.is_empty() {
            return Err(Error::NoCandidates);
        }

        for answer in &answers {
            for preference in preferred {
                if preference.matches(answer) {
                    debug!("Preferred provider matched in {}", answer.provider_cloud);
                    let provider = preference
                        .system
                        .clone()
                        .or_else(|| answer.providers.first().cloned());
                    return Ok(SelectionOutcome::Selected(Selection {
                        answer: (*answer).clone(),
                        provider,
                        matched_preference: true,
                    }));
                }
            }
        }

        if store_on_no_match {
            debug!("No preferred provider answered, recording no selection");
            return Ok(SelectionOutcome::NoSelection);
        }

        let fallback = match self.strategy {
            MatchmakingStrategy::FirstMatch => answers[0],
            MatchmakingStrategy::RandomFallback => answers
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(answers[0]),
        };
        debug!("Falling back to {}", fallback.provider_cloud);

        Ok(SelectionOutcome::Selected(Selection {
            answer: fallback.clone(),
            provider: fallback.providers.first().cloned(),
            matched_preference: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CloudIdentity, PollFailure};

    fn success(cloud: &str) -> PollResult {
        let identity = CloudIdentity::new(cloud, "op");
        PollResult::success(
            identity.clone(),
            PollAnswer {
                provider_cloud: identity,
                service_definition: "temperature".into(),
                providers: vec![
                    SystemDescriptor::new(format!("{cloud}-first"), "10.0.0.1", 80),
                    SystemDescriptor::new(format!("{cloud}-second"), "10.0.0.2", 81),
                ],
                interfaces: vec!["HTTP-SECURE-JSON".into()],
                gateway_public_key: None,
            },
        )
    }

    fn selected_cloud(outcome: &SelectionOutcome) -> &str {
        &outcome.selection().unwrap().answer.provider_cloud.name
    }

    #[test]
    fn test_preferred_provider_wins() {
        let results = vec![success("a"), success("b"), success("c")];
        let preferred = vec![PreferredProvider::cloud(CloudIdentity::new("b", "op"))];

        let outcome = ProviderMatchmaker::default()
            .select(&results, &preferred, false)
            .unwrap();
        assert_eq!(selected_cloud(&outcome), "b");
        assert!(outcome.selection().unwrap().matched_preference);
    }

    #[test]
    fn test_result_order_beats_preference_order() {
        let results = vec![success("a"), success("b"), success("c")];
        let preferred = vec![
            PreferredProvider::cloud(CloudIdentity::new("c", "op")),
            PreferredProvider::cloud(CloudIdentity::new("b", "op")),
        ];

        let outcome = ProviderMatchmaker::default()
            .select(&results, &preferred, false)
            .unwrap();
        assert_eq!(selected_cloud(&outcome), "b");
    }

    #[test]
    fn test_preferred_system_is_chosen() {
        let results = vec![success("a"), success("b")];
        let wanted = SystemDescriptor::new("b-second", "10.0.0.2", 81);
        let preferred = vec![PreferredProvider::system(
            CloudIdentity::new("b", "op"),
            wanted.clone(),
        )];

        let outcome = ProviderMatchmaker::default()
            .select(&results, &preferred, false)
            .unwrap();
        assert_eq!(outcome.selection().unwrap().provider, Some(wanted));
    }

    #[test]
    fn test_fallback_to_first_success() {
        let results = vec![
            PollResult::failure(CloudIdentity::new("x", "op"), PollFailure::Timeout),
            success("a"),
            success("b"),
        ];

        let outcome = ProviderMatchmaker::default().select(&results, &[], false).unwrap();
        assert_eq!(selected_cloud(&outcome), "a");
        let selection = outcome.selection().unwrap();
        assert!(!selection.matched_preference);
        assert_eq!(selection.provider.as_ref().unwrap().system_name, "a-first");
    }

    #[test]
    fn test_store_flag_without_match() {
        let results = vec![success("a"), success("b")];
        let preferred = vec![PreferredProvider::cloud(CloudIdentity::new("z", "op"))];

        let outcome = ProviderMatchmaker::default()
            .select(&results, &preferred, true)
            .unwrap();
        assert_eq!(outcome, SelectionOutcome::NoSelection);
    }

    #[test]
    fn test_preference_beats_store_flag() {
        let results = vec![success("a"), success("b")];
        let preferred = vec![PreferredProvider::cloud(CloudIdentity::new("b", "op"))];

        let outcome = ProviderMatchmaker::default()
            .select(&results, &preferred, true)
            .unwrap();
        assert_eq!(selected_cloud(&outcome), "b");
    }

    #[test]
    fn test_no_successes() {
        let results = vec![PollResult::failure(
            CloudIdentity::new("x", "op"),
            PollFailure::RelayUnreachable("down".into()),
        )];
        let err = ProviderMatchmaker::default()
            .select(&results, &[], false)
            .unwrap_err();
        assert!(matches!(err, Error::NoCandidates));
        assert!(matches!(
            ProviderMatchmaker::default().select(&[], &[], true),
            Err(Error::NoCandidates)
        ));
    }

    #[test]
    fn test_random_fallback_picks_a_success() {
        let results = vec![
            success("a"),
            PollResult::failure(CloudIdentity::new("x", "op"), PollFailure::Timeout),
            success("b"),
        ];
        let matchmaker = ProviderMatchmaker::new(MatchmakingStrategy::RandomFallback);

        for _ in 0..32 {
            let outcome = matchmaker.select(&results, &[], false).unwrap();
            assert!(matches!(selected_cloud(&outcome), "a" | "b"));
        }
    }
}
