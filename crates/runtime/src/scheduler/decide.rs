//! Deciding phase: score candidates, delegate ties, fall back deterministically.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use being_memory::State;

use crate::collaborators::RankingService;
use crate::registry::ActivityDescriptor;

/// Scores closer than this are treated as a tie.
const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub staleness_weight: f64,
    pub efficiency_weight: f64,
    pub staleness_horizon: Duration,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            staleness_weight: 0.6,
            efficiency_weight: 0.4,
            staleness_horizon: Duration::from_secs(86_400),
        }
    }
}

/// How the selected activity was arrived at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum Decision {
    /// The only candidate.
    Single,
    /// Unique highest score.
    Scored { score: f64 },
    /// Tie broken by the ranking service.
    Delegated,
    Fallback { reason: FallbackReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The ranking service did not answer within the timeout.
    SelectionTimeout,
    DelegationFailed(String),
    /// The ranking service named something outside the tied set.
    UnknownChoice(String),
}

/// 1.0 for a never-run descriptor, otherwise the fraction of the horizon
/// elapsed since its last run, saturating at 1.0.
pub fn staleness(descriptor: &ActivityDescriptor, now: DateTime<Utc>, horizon: Duration) -> f64 {
    match descriptor.since_last(now) {
        None => 1.0,
        Some(_) if horizon.is_zero() => 1.0,
        Some(elapsed) => (elapsed.as_secs_f64() / horizon.as_secs_f64()).min(1.0),
    }
}

pub fn score(
    descriptor: &ActivityDescriptor,
    state: &State,
    now: DateTime<Utc>,
    weights: &ScoringWeights,
) -> f64 {
    let base = weights.staleness_weight * staleness(descriptor, now, weights.staleness_horizon)
        + weights.efficiency_weight * (1.0 - descriptor.energy_cost);
    let personality = (1.0 + state.trait_weight("creativity") * descriptor.creativity_factor)
        * (1.0 + state.trait_weight("friendliness") * descriptor.social_factor);
    base * personality
}

/// Candidates sharing the maximum score, in name order, with that score.
pub fn top_scored<'a>(
    candidates: &'a [ActivityDescriptor],
    state: &State,
    now: DateTime<Utc>,
    weights: &ScoringWeights,
) -> (Vec<&'a ActivityDescriptor>, f64) {
    let scored: Vec<(&ActivityDescriptor, f64)> = candidates
        .iter()
        .map(|descriptor| (descriptor, score(descriptor, state, now, weights)))
        .collect();
    let best = scored
        .iter()
        .map(|(_, score)| *score)
        .fold(f64::NEG_INFINITY, f64::max);

    let mut tied: Vec<&ActivityDescriptor> = scored
        .into_iter()
        .filter(|(_, score)| (best - score).abs() <= TIE_EPSILON)
        .map(|(descriptor, _)| descriptor)
        .collect();
    tied.sort_by(|left, right| left.name.cmp(&right.name));
    (tied, best)
}

/// Deterministic tie-break: lexicographically smallest name.
pub fn fallback<'a>(tied: &[&'a ActivityDescriptor]) -> Option<&'a ActivityDescriptor> {
    tied.iter().min_by(|left, right| left.name.cmp(&right.name)).copied()
}

/// Pick one candidate.  Returns `None` only for an empty candidate set.
pub async fn choose(
    candidates: &[ActivityDescriptor],
    state: &State,
    now: DateTime<Utc>,
    weights: &ScoringWeights,
    ranking: &dyn RankingService,
    ranking_timeout: Duration,
) -> Option<(ActivityDescriptor, Decision)> {
    match candidates {
        [] => return None,
        [only] => return Some((only.clone(), Decision::Single)),
        _ => {}
    }

    let (tied, best) = top_scored(candidates, state, now, weights);
    if let [winner] = tied.as_slice() {
        debug!(activity = %winner.name, score = best, "unique top score");
        return Some(((*winner).clone(), Decision::Scored { score: best }));
    }

    let offered: Vec<ActivityDescriptor> = tied.iter().map(|d| (*d).clone()).collect();
    let reason = match tokio::time::timeout(ranking_timeout, ranking.rank(&offered, state)).await {
        Ok(Ok(choice)) => match tied.iter().find(|d| d.name == choice) {
            Some(chosen) => {
                debug!(activity = %chosen.name, tied = tied.len(), "tie delegated");
                return Some(((*chosen).clone(), Decision::Delegated));
            }
            None => FallbackReason::UnknownChoice(choice),
        },
        Ok(Err(err)) => FallbackReason::DelegationFailed(err.to_string()),
        Err(_) => FallbackReason::SelectionTimeout,
    };

    let chosen = fallback(&tied)?;
    warn!(activity = %chosen.name, ?reason, "ranking unusable, using deterministic fallback");
    Some((chosen.clone(), Decision::Fallback { reason }))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::TimeDelta;

    use crate::collaborators::UnavailableRanking;

    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl RankingService for Fixed {
        async fn rank(&self, _tied: &[ActivityDescriptor], _state: &State) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Hangs;

    #[async_trait]
    impl RankingService for Hangs {
        async fn rank(&self, _tied: &[ActivityDescriptor], _state: &State) -> Result<String> {
            std::future::pending::<()>().await;
            Ok("never".to_string())
        }
    }

    fn tied_pair() -> Vec<ActivityDescriptor> {
        vec![
            ActivityDescriptor::new("beta", 0.2, Duration::from_secs(10)),
            ActivityDescriptor::new("alpha", 0.2, Duration::from_secs(10)),
        ]
    }

    #[test]
    fn staleness_saturates_and_handles_zero_horizon() {
        let now = Utc::now();
        let fresh = ActivityDescriptor::new("a", 0.1, Duration::ZERO);
        let ran = fresh.clone().with_last_execution(now - TimeDelta::seconds(50));
        let horizon = Duration::from_secs(100);

        assert_eq!(staleness(&fresh, now, horizon), 1.0);
        assert!((staleness(&ran, now, horizon) - 0.5).abs() < 1e-9);
        assert_eq!(staleness(&ran, now, Duration::from_secs(10)), 1.0);
        assert_eq!(staleness(&ran, now, Duration::ZERO), 1.0);
    }

    #[test]
    fn cheaper_activity_scores_higher() {
        let now = Utc::now();
        let candidates = vec![
            ActivityDescriptor::new("costly", 0.9, Duration::ZERO),
            ActivityDescriptor::new("cheap", 0.1, Duration::ZERO),
        ];
        let (tied, _) = top_scored(&candidates, &State::default(), now, &ScoringWeights::default());
        assert_eq!(tied.len(), 1);
        assert_eq!(tied[0].name, "cheap");
    }

    #[test]
    fn personality_biases_towards_matching_factor() {
        let now = Utc::now();
        let mut creative = ActivityDescriptor::new("draw", 0.5, Duration::ZERO);
        creative.creativity_factor = 1.0;
        let mut social = ActivityDescriptor::new("tweet", 0.5, Duration::ZERO);
        social.social_factor = 1.0;
        let candidates = vec![creative, social];

        let mut state = State::default();
        state.personality = BTreeMap::from([
            ("creativity".to_string(), 0.9),
            ("friendliness".to_string(), 0.1),
        ]);
        let (tied, _) = top_scored(&candidates, &state, now, &ScoringWeights::default());
        assert_eq!(tied[0].name, "draw");

        state.personality.insert("friendliness".to_string(), 0.95);
        let (tied, _) = top_scored(&candidates, &state, now, &ScoringWeights::default());
        assert_eq!(tied[0].name, "tweet");
    }

    #[tokio::test]
    async fn single_candidate_skips_scoring() {
        let only = vec![ActivityDescriptor::new("A", 0.1, Duration::ZERO)];
        let (chosen, decision) = choose(
            &only,
            &State::default(),
            Utc::now(),
            &ScoringWeights::default(),
            &Hangs,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert_eq!(chosen.name, "A");
        assert_eq!(decision, Decision::Single);
    }

    #[tokio::test]
    async fn empty_candidate_set_yields_none() {
        let picked = choose(
            &[],
            &State::default(),
            Utc::now(),
            &ScoringWeights::default(),
            &UnavailableRanking,
            Duration::from_millis(10),
        )
        .await;
        assert!(picked.is_none());
    }

    #[tokio::test]
    async fn tie_is_delegated_to_ranking() {
        let (chosen, decision) = choose(
            &tied_pair(),
            &State::default(),
            Utc::now(),
            &ScoringWeights::default(),
            &Fixed("beta"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(chosen.name, "beta");
        assert_eq!(decision, Decision::Delegated);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_falls_back_to_smallest_name_every_time() {
        for _ in 0..5 {
            let (chosen, decision) = choose(
                &tied_pair(),
                &State::default(),
                Utc::now(),
                &ScoringWeights::default(),
                &Hangs,
                Duration::from_millis(50),
            )
            .await
            .unwrap();
            assert_eq!(chosen.name, "alpha");
            assert_eq!(
                decision,
                Decision::Fallback {
                    reason: FallbackReason::SelectionTimeout
                }
            );
        }
    }

    #[tokio::test]
    async fn unknown_or_failed_answers_fall_back() {
        let weights = ScoringWeights::default();
        let now = Utc::now();
        let (chosen, decision) = choose(
            &tied_pair(),
            &State::default(),
            now,
            &weights,
            &Fixed("gamma"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(chosen.name, "alpha");
        assert_eq!(
            decision,
            Decision::Fallback {
                reason: FallbackReason::UnknownChoice("gamma".to_string())
            }
        );

        let (chosen, decision) = choose(
            &tied_pair(),
            &State::default(),
            now,
            &weights,
            &UnavailableRanking,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(chosen.name, "alpha");
        assert!(matches!(
            decision,
            Decision::Fallback {
                reason: FallbackReason::DelegationFailed(_)
            }
        ));
    }
}
