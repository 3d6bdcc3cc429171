//! Round controller: runs rounds until a winner, exhaustion, or cancel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::candidate::{Candidate, CandidateId, CandidateStatus};
use crate::config::RaceConfig;
use crate::events::{EventSink, RaceEvent, RoundSummary};
use crate::orchestrator::{RaceOrchestrator, RoundOutcome};
use crate::providers::{Offer, OfferFilter, OfferSearch};

/// How a race resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RaceOutcome {
    /// A candidate reached Ready first.
    Won(Box<Candidate>),
    /// No winner within the allowed rounds, or no offers left.
    Exhausted,
    /// The caller cancelled the race.
    UserCancelled,
}

impl RaceOutcome {
    /// The winner, if the race was won.
    #[must_use]
    pub fn winner(&self) -> Option<&Candidate> {
        match self {
            Self::Won(c) => Some(c),
            _ => None,
        }
    }
}

/// State of one race across its rounds.
///
/// Owned by exactly one driver at a time; the round controller is its only
/// writer of `round` and `winner`.
#[derive(Debug, Clone)]
pub struct Race {
    round: u32,
    rounds_in_budget: u32,
    candidates: Vec<Candidate>,
    history: Vec<Candidate>,
    winner: Option<CandidateId>,
    rejected: Vec<CandidateId>,
    max_rounds: u32,
    deadline_per_round: Duration,
    excluded_offers: HashSet<String>,
    next_candidate_id: u64,
}

impl Race {
    /// Create an empty race.
    #[must_use]
    pub fn new(max_rounds: u32, deadline_per_round: Duration) -> Self {
        Self {
            round: 0,
            rounds_in_budget: 0,
            candidates: Vec::new(),
            history: Vec::new(),
            winner: None,
            rejected: Vec::new(),
            max_rounds,
            deadline_per_round,
            excluded_offers: HashSet::new(),
            next_candidate_id: 1,
        }
    }

    /// Create an empty race from configuration.
    #[must_use]
    pub fn from_config(config: &RaceConfig) -> Self {
        Self::new(config.max_rounds, config.round_deadline())
    }

    /// Current 1-based round, 0 before the first round starts.
    #[must_use]
    pub const fn round(&self) -> u32 {
        self.round
    }

    /// Round budget.
    #[must_use]
    pub const fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Candidates of the current round.
    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Every candidate from every round, current round last.
    pub fn all_candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.history.iter().chain(self.candidates.iter())
    }

    /// The winning candidate, if declared.
    #[must_use]
    pub fn winner(&self) -> Option<&Candidate> {
        let id = self.winner?;
        self.all_candidates().find(|c| c.id == id)
    }

    /// Winners the caller rejected, oldest first.
    #[must_use]
    pub fn rejected(&self) -> &[CandidateId] {
        &self.rejected
    }

    /// Offer ids that will not be raced again.
    #[must_use]
    pub fn excluded_offers(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.excluded_offers.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the round budget allows another round.
    #[must_use]
    pub const fn has_budget(&self) -> bool {
        self.rounds_in_budget < self.max_rounds
    }

    /// Start a new round with fresh candidate ids.
    fn begin_round(&mut self, offers: Vec<Offer>) {
        self.history.append(&mut self.candidates);
        self.round += 1;
        self.rounds_in_budget += 1;
        let round = self.round;
        self.candidates = offers
            .into_iter()
            .map(|offer| {
                let id = CandidateId(self.next_candidate_id);
                self.next_candidate_id += 1;
                Candidate::new(id, round, offer)
            })
            .collect();
    }

    /// Record a finished round.
    fn finish_round(&mut self, candidates: Vec<Candidate>) {
        for c in &candidates {
            if c.status() == CandidateStatus::Failed {
                self.excluded_offers.insert(c.offer.id.clone());
            }
        }
        self.candidates = candidates;
    }

    /// Set the winner. Write-once: later calls are ignored.
    fn set_winner(&mut self, id: CandidateId) -> bool {
        if self.winner.is_some() {
            return false;
        }
        self.winner = Some(id);
        true
    }

    /// Retire the winner so the search can resume.
    ///
    /// The rejected candidate stays in history and in [`Race::rejected`],
    /// its offer is excluded, and the round budget starts over. Returns the
    /// rejected candidate.
    pub(crate) fn reject_winner(&mut self) -> Option<Candidate> {
        let rejected = self.winner()?.clone();
        self.excluded_offers.insert(rejected.offer.id.clone());
        self.history.append(&mut self.candidates);
        self.rejected.push(rejected.id);
        self.winner = None;
        self.rounds_in_budget = 0;
        Some(rejected)
    }
}

/// Runs rounds of candidates until one wins or the race is exhausted.
#[derive(Clone)]
pub struct RoundController {
    search: Arc<dyn OfferSearch>,
    orchestrator: RaceOrchestrator,
    candidates_per_round: usize,
}

impl RoundController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        search: Arc<dyn OfferSearch>,
        orchestrator: RaceOrchestrator,
        candidates_per_round: usize,
    ) -> Self {
        Self {
            search,
            orchestrator,
            candidates_per_round,
        }
    }

    /// Orchestrator used for each round.
    #[must_use]
    pub const fn orchestrator(&self) -> &RaceOrchestrator {
        &self.orchestrator
    }

    /// Run rounds until the race resolves.
    pub async fn run_race(
        &self,
        mut race: Race,
        filter: &OfferFilter,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> (Race, RaceOutcome) {
        loop {
            if cancel.is_cancelled() {
                events.emit(RaceEvent::RaceCancelled);
                return (race, RaceOutcome::UserCancelled);
            }

            if !race.has_budget() {
                info!(rounds = race.round, "Race exhausted: round budget spent");
                events.emit(RaceEvent::RoundExhausted { rounds: race.round });
                return (race, RaceOutcome::Exhausted);
            }

            let offers = tokio::select! {
                biased;
                () = cancel.cancelled() => continue,
                offers = self.next_offers(&race, filter) => offers,
            };
            if offers.is_empty() {
                info!(rounds = race.round, "Race exhausted: no offers left");
                events.emit(RaceEvent::RoundExhausted { rounds: race.round });
                return (race, RaceOutcome::Exhausted);
            }

            race.begin_round(offers);
            let round = race.round;
            events.emit(RaceEvent::RoundStarted {
                round,
                candidates: race
                    .candidates
                    .iter()
                    .map(|c| (c.id, c.offer.id.clone()))
                    .collect(),
            });

            let candidates = std::mem::take(&mut race.candidates);
            let result = self
                .orchestrator
                .run_round(round, candidates, race.deadline_per_round, cancel, events)
                .await;
            let outcome = result.outcome;
            race.finish_round(result.candidates);

            match outcome {
                RoundOutcome::Won(id) => {
                    race.set_winner(id);
                    let Some(winner) = race.winner().cloned() else {
                        warn!(candidate_id = %id, "Winner missing from round");
                        continue;
                    };
                    events.emit(RaceEvent::WinnerFound {
                        candidate: Box::new(winner.clone()),
                    });
                    return (race, RaceOutcome::Won(Box::new(winner)));
                }
                RoundOutcome::Cancelled => {
                    events.emit(RaceEvent::RaceCancelled);
                    return (race, RaceOutcome::UserCancelled);
                }
                RoundOutcome::NoWinner => {
                    let summary = RoundSummary::from_candidates(&race.candidates);
                    info!(round, %summary, "Round ended without a winner");
                    events.emit(RaceEvent::RoundFailed { round, summary });
                }
            }
        }
    }

    /// Ask the selector for the next candidate set, dropping excluded and
    /// duplicate offers. Search errors end the race like an empty result.
    async fn next_offers(&self, race: &Race, filter: &OfferFilter) -> Vec<Offer> {
        let exclude = race.excluded_offers();
        let offers = match self.search.search(filter, &exclude).await {
            Ok(offers) => offers,
            Err(e) => {
                warn!(error = %e, "Offer search failed");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        offers
            .into_iter()
            .filter(|o| !race.excluded_offers.contains(&o.id))
            .filter(|o| seen.insert(o.id.clone()))
            .take(self.candidates_per_round)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: &str) -> Offer {
        Offer {
            id: id.to_string(),
            provider_id: "test".to_string(),
            gpu_model: "H100".to_string(),
            vram_gb: 80,
            price_per_hour: 2.0,
            region: "NYC".to_string(),
            reliability: 0.9,
        }
    }

    #[tokio::test]
    async fn test_candidate_ids_never_reused() {
        let mut race = Race::new(3, Duration::from_secs(60));
        race.begin_round(vec![offer("a"), offer("b")]);
        let first: Vec<_> = race.candidates().iter().map(|c| c.id).collect();
        race.begin_round(vec![offer("c"), offer("d")]);
        let second: Vec<_> = race.candidates().iter().map(|c| c.id).collect();

        assert_eq!(first, vec![CandidateId(1), CandidateId(2)]);
        assert_eq!(second, vec![CandidateId(3), CandidateId(4)]);
        assert_eq!(race.round(), 2);
        assert_eq!(race.all_candidates().count(), 4);
    }

    #[tokio::test]
    async fn test_failed_offers_excluded() {
        let mut race = Race::new(3, Duration::from_secs(60));
        race.begin_round(vec![offer("a"), offer("b")]);
        let mut finished = std::mem::take(&mut race.candidates);
        finished[0].advance(CandidateStatus::Creating);
        finished[0].fail("offer taken");
        finished[1].cancel();
        race.finish_round(finished);

        assert_eq!(race.excluded_offers(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_winner_write_once() {
        let mut race = Race::new(1, Duration::from_secs(60));
        race.begin_round(vec![offer("a"), offer("b")]);
        assert!(race.set_winner(CandidateId(1)));
        assert!(!race.set_winner(CandidateId(2)));
        assert_eq!(race.winner().map(|c| c.id), Some(CandidateId(1)));
    }

    #[tokio::test]
    async fn test_reject_resets_budget() {
        let mut race = Race::new(1, Duration::from_secs(60));
        race.begin_round(vec![offer("a")]);
        race.set_winner(CandidateId(1));
        assert!(!race.has_budget());

        let rejected = race.reject_winner().unwrap();
        assert_eq!(rejected.offer.id, "a");
        assert!(race.has_budget());
        assert!(race.winner().is_none());
        assert_eq!(race.excluded_offers(), vec!["a".to_string()]);
        assert_eq!(race.round(), 1);
        assert_eq!(race.rejected(), &[CandidateId(1)]);
    }
}
