//! Race session: the handle callers hold for one provisioning request.
//!
//! A session owns exactly one race. Callers observe it through events and
//! may only cancel it, accept the winner, or reject the winner and resume.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::candidate::Candidate;
use crate::cleanup::spawn_destroy;
use crate::config::RaceConfig;
use crate::error::RaceError;
use crate::events::{EventSink, RaceEvent};
use crate::providers::OfferFilter;
use crate::round::{Race, RaceOutcome, RoundController};

/// Callback-style subscriber.
///
/// Every method has a no-op default; implement the ones you need.
pub trait RaceObserver: Send + 'static {
    /// Candidate, round, and aggregate progress updates.
    fn on_update(&mut self, _event: &RaceEvent) {}

    /// A winner was declared.
    fn on_winner(&mut self, _candidate: &Candidate) {}

    /// The race ran out of rounds or offers.
    fn on_exhausted(&mut self, _rounds: u32) {}

    /// The race was cancelled by the caller.
    fn on_cancelled(&mut self) {}
}

enum SessionState {
    Idle(Race),
    Running(JoinHandle<(Race, RaceOutcome)>),
    Resolved { race: Race, outcome: RaceOutcome },
    Closed,
}

/// Facade over a race for UI, CLI, and API callers.
pub struct RaceSession {
    id: Uuid,
    controller: RoundController,
    filter: OfferFilter,
    events: EventSink,
    cancel: CancellationToken,
    state: SessionState,
}

impl RaceSession {
    /// Create a session. Nothing runs until [`RaceSession::start`]; subscribe
    /// first to see every event.
    #[must_use]
    pub fn new(controller: RoundController, race: Race, filter: OfferFilter) -> Self {
        Self {
            id: Uuid::new_v4(),
            controller,
            filter,
            events: EventSink::new(),
            cancel: CancellationToken::new(),
            state: SessionState::Idle(race),
        }
    }

    /// Create a session with a fresh race sized from `config`.
    #[must_use]
    pub fn from_config(controller: RoundController, config: &RaceConfig, filter: OfferFilter) -> Self {
        Self::new(controller, Race::from_config(config), filter)
    }

    /// Session id, used in logs.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Subscribe to the raw event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RaceEvent> {
        self.events.subscribe()
    }

    /// Subscribe with callbacks. The returned task ends when the session
    /// is dropped.
    pub fn subscribe_with<O: RaceObserver>(&self, mut observer: O) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let session_id = self.id;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RaceEvent::WinnerFound { candidate }) => observer.on_winner(&candidate),
                    Ok(RaceEvent::RoundExhausted { rounds }) => observer.on_exhausted(rounds),
                    Ok(RaceEvent::RaceCancelled) => observer.on_cancelled(),
                    Ok(event) => observer.on_update(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %session_id, skipped, "Observer lagged behind race events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Start racing. Calling it again is a no-op.
    pub fn start(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        self.state = match state {
            SessionState::Idle(race) => SessionState::Running(self.spawn_driver(race)),
            other => other,
        };
    }

    fn spawn_driver(&self, race: Race) -> JoinHandle<(Race, RaceOutcome)> {
        let controller = self.controller.clone();
        let filter = self.filter.clone();
        let cancel = self.cancel.clone();
        let events = self.events.clone();
        let span = tracing::info_span!("race_session", session_id = %self.id);
        tokio::spawn(
            async move { controller.run_race(race, &filter, &cancel, &events).await }
                .instrument(span),
        )
    }

    /// Cancel the race. Every candidate is treated as a loser.
    pub fn cancel(&self) {
        info!(session_id = %self.id, "Cancelling race");
        self.cancel.cancel();
    }

    /// Whether the race has resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        match &self.state {
            SessionState::Running(handle) => handle.is_finished(),
            SessionState::Resolved { .. } => true,
            SessionState::Idle(_) | SessionState::Closed => false,
        }
    }

    /// Race state after resolution.
    #[must_use]
    pub fn race(&self) -> Option<&Race> {
        match &self.state {
            SessionState::Idle(race) | SessionState::Resolved { race, .. } => Some(race),
            _ => None,
        }
    }

    /// Wait for the race to resolve, starting it if needed.
    ///
    /// Cancel-safe: dropping the future leaves the race running.
    ///
    /// # Errors
    /// Returns [`RaceError::Internal`] if the driver task panicked, or
    /// [`RaceError::NoWinner`] if the session was already closed.
    pub async fn outcome(&mut self) -> Result<RaceOutcome, RaceError> {
        self.start();
        if let SessionState::Running(handle) = &mut self.state {
            match handle.await {
                Ok((race, outcome)) => self.state = SessionState::Resolved { race, outcome },
                Err(e) => {
                    self.state = SessionState::Closed;
                    return Err(RaceError::Internal(e.to_string()));
                }
            }
        }
        match &self.state {
            SessionState::Resolved { outcome, .. } => Ok(outcome.clone()),
            _ => Err(RaceError::NoWinner),
        }
    }

    /// Accept the winner and close the session.
    ///
    /// # Errors
    /// Returns [`RaceError::RaceExhausted`] or [`RaceError::UserCancelled`]
    /// when the race produced no resource.
    pub async fn accept_winner(mut self) -> Result<Candidate, RaceError> {
        let outcome = self.outcome().await?;
        let rounds = self.race().map_or(0, Race::round);
        self.state = SessionState::Closed;
        match outcome {
            RaceOutcome::Won(candidate) => {
                info!(
                    session_id = %self.id,
                    candidate_id = %candidate.id,
                    offer_id = %candidate.offer.id,
                    "Winner accepted"
                );
                Ok(*candidate)
            }
            RaceOutcome::Exhausted => Err(RaceError::RaceExhausted { rounds }),
            RaceOutcome::UserCancelled => Err(RaceError::UserCancelled),
        }
    }

    /// Destroy the winner and resume the search. The resumed search gets a
    /// fresh round budget and never re-races the rejected offer.
    ///
    /// # Errors
    /// Returns [`RaceError::NoWinner`] if the race did not produce a winner,
    /// or [`RaceError::UserCancelled`] if the session was cancelled.
    pub async fn reject_winner_and_continue(&mut self) -> Result<(), RaceError> {
        if self.cancel.is_cancelled() {
            return Err(RaceError::UserCancelled);
        }
        self.outcome().await?;
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        let (mut race, outcome) = match state {
            SessionState::Resolved { race, outcome } => (race, outcome),
            other => {
                self.state = other;
                return Err(RaceError::NoWinner);
            }
        };

        let Some(rejected) = race.reject_winner() else {
            self.state = SessionState::Resolved { race, outcome };
            return Err(RaceError::NoWinner);
        };

        info!(
            session_id = %self.id,
            candidate_id = %rejected.id,
            offer_id = %rejected.offer.id,
            "Winner rejected, resuming search"
        );
        if let Some(instance) = &rejected.instance {
            spawn_destroy(
                self.controller.orchestrator().api(),
                rejected.id,
                instance.id.clone(),
            );
        } else {
            debug!(candidate_id = %rejected.id, "Rejected winner has no instance to destroy");
        }
        self.events.emit(RaceEvent::WinnerRejected {
            candidate_id: rejected.id,
        });
        self.state = SessionState::Running(self.spawn_driver(race));
        Ok(())
    }
}

impl Drop for RaceSession {
    fn drop(&mut self) {
        if let SessionState::Running(handle) = &self.state {
            if !handle.is_finished() {
                debug!(session_id = %self.id, "Session dropped mid-race, cancelling");
                self.cancel.cancel();
            }
        }
    }
}

impl std::fmt::Debug for RaceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceSession")
            .field("id", &self.id)
            .field("resolved", &self.is_resolved())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
