//! Race orchestrator: races one round of candidates and declares a winner.
//!
//! The orchestrator is the only writer of candidate status and progress.
//! Provisioning tasks run fully in parallel and report over a channel; the
//! orchestrator waits on that channel, the round deadline, and the caller's
//! cancellation token at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candidate::{Candidate, CandidateId, CandidateStatus};
use crate::cleanup::spawn_destroy;
use crate::events::{EventSink, RaceEvent};
use crate::progress::{Eta, ProgressEstimator};
use crate::providers::{InstanceHandle, ProvisioningApi, RemoteState};
use crate::task::{ProvisioningTask, TaskReport, TaskSettings, TaskUpdate};

/// Failure reason for candidates still in flight at the round deadline.
pub const ROUND_TIMEOUT_REASON: &str = "round timeout";

/// How a single round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A candidate reached Ready first.
    Won(CandidateId),
    /// Every candidate ended Failed or Cancelled.
    NoWinner,
    /// The caller cancelled the race.
    Cancelled,
}

/// Final state of a round.
#[derive(Debug)]
pub struct RoundResult {
    /// Candidates in their terminal states.
    pub candidates: Vec<Candidate>,
    /// How the round ended.
    pub outcome: RoundOutcome,
}

impl RoundResult {
    /// The winning candidate, if any.
    #[must_use]
    pub fn winner(&self) -> Option<&Candidate> {
        match self.outcome {
            RoundOutcome::Won(id) => self.candidates.iter().find(|c| c.id == id),
            _ => None,
        }
    }
}

/// Races candidates against each other.
#[derive(Clone)]
pub struct RaceOrchestrator {
    api: Arc<dyn ProvisioningApi>,
    settings: Arc<TaskSettings>,
    estimator: ProgressEstimator,
}

impl RaceOrchestrator {
    /// Create an orchestrator for a provisioning API.
    #[must_use]
    pub fn new(api: Arc<dyn ProvisioningApi>, settings: TaskSettings) -> Self {
        let estimator = ProgressEstimator::new(api.reports_initializing());
        Self {
            api,
            settings: Arc::new(settings),
            estimator,
        }
    }

    /// Replace the progress estimator.
    #[must_use]
    pub fn with_estimator(mut self, estimator: ProgressEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Provisioning API used by this orchestrator.
    #[must_use]
    pub fn api(&self) -> Arc<dyn ProvisioningApi> {
        Arc::clone(&self.api)
    }

    /// Race `candidates` until one is Ready, all are terminal, the round
    /// deadline passes, or `cancel` fires.
    ///
    /// Losing instances are cleaned up in the background after this returns.
    pub async fn run_round(
        &self,
        round: u32,
        candidates: Vec<Candidate>,
        deadline: Duration,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> RoundResult {
        let round_token = cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        let mut state = RoundState {
            round,
            started: Instant::now(),
            index: HashMap::with_capacity(candidates.len()),
            candidates,
            estimator: self.estimator.clone(),
            events,
            last_progress: None,
        };

        for (i, candidate) in state.candidates.iter_mut().enumerate() {
            state.index.insert(candidate.id, i);
            candidate.mark_started();
            candidate.advance(CandidateStatus::Creating);
            let task = ProvisioningTask::new(
                candidate.id,
                candidate.offer.clone(),
                Arc::clone(&self.api),
                Arc::clone(&self.settings),
                round_token.child_token(),
                tx.clone(),
            );
            tasks.spawn(task.run());
        }
        drop(tx);

        for i in 0..state.candidates.len() {
            state.emit_candidate(i);
        }
        info!(round, candidates = state.candidates.len(), "Round started");

        let (outcome, rx) = self.drive(&mut state, rx, deadline, cancel).await;

        // Stop every remaining task; they destroy their own instances.
        round_token.cancel();
        let winner = match outcome {
            RoundOutcome::Won(id) => Some(id),
            _ => None,
        };
        self.reap(tasks, rx, winner);

        RoundResult {
            candidates: state.candidates,
            outcome,
        }
    }

    async fn drive(
        &self,
        state: &mut RoundState<'_>,
        mut rx: mpsc::UnboundedReceiver<TaskReport>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> (RoundOutcome, mpsc::UnboundedReceiver<TaskReport>) {
        let deadline_at = state.started + deadline;
        let mut tick = tokio::time::interval(self.settings.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            if state.all_terminal() {
                info!(round = state.round, "All candidates terminal, no winner");
                break RoundOutcome::NoWinner;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(round = state.round, "Race cancelled by caller");
                    state.cancel_remaining();
                    break RoundOutcome::Cancelled;
                }
                () = tokio::time::sleep_until(deadline_at) => {
                    // A Ready observed by the deadline still counts, even if
                    // its report has not been received yet.
                    tokio::task::yield_now().await;
                    let mut ready = Vec::new();
                    while let Ok(report) = rx.try_recv() {
                        self.apply(state, report, &mut ready);
                    }
                    let (in_time, late): (Vec<_>, Vec<_>) =
                        ready.into_iter().partition(|(at, _, _)| *at <= deadline_at);
                    for (_, candidate_id, handle) in late {
                        debug!(candidate_id = %candidate_id, "Ready after round deadline, destroying");
                        spawn_destroy(self.api(), candidate_id, handle.id);
                    }
                    if let Some(winner) = self.declare_winner(state, in_time) {
                        break RoundOutcome::Won(winner);
                    }

                    warn!(round = state.round, deadline_secs = deadline.as_secs(), "Round deadline reached");
                    state.fail_remaining(ROUND_TIMEOUT_REASON);
                    break RoundOutcome::NoWinner;
                }
                report = rx.recv() => {
                    let Some(report) = report else {
                        state.fail_remaining("provisioning task exited");
                        break RoundOutcome::NoWinner;
                    };
                    let mut ready = Vec::new();
                    self.apply(state, report, &mut ready);
                    if ready.is_empty() {
                        continue;
                    }

                    // Collect every Ready observed in the same tick before
                    // choosing, so simultaneous finishers tie-break by id.
                    tokio::task::yield_now().await;
                    while let Ok(report) = rx.try_recv() {
                        self.apply(state, report, &mut ready);
                    }
                    if let Some(winner) = self.declare_winner(state, ready) {
                        break RoundOutcome::Won(winner);
                    }
                }
                _ = tick.tick() => state.refresh_progress(),
            }
        };

        (outcome, rx)
    }

    /// Apply one report. Ready reports from live candidates are collected
    /// into `ready` instead of being applied.
    fn apply(
        &self,
        state: &mut RoundState<'_>,
        report: TaskReport,
        ready: &mut Vec<(Instant, CandidateId, InstanceHandle)>,
    ) {
        let Some(&i) = state.index.get(&report.candidate_id) else {
            warn!(candidate_id = %report.candidate_id, "Report for unknown candidate");
            return;
        };

        if state.candidates[i].is_terminal() {
            if let TaskUpdate::Ready(handle) = report.update {
                debug!(candidate_id = %report.candidate_id, "Late ready report, destroying");
                spawn_destroy(self.api(), report.candidate_id, handle.id);
            }
            return;
        }

        match report.update {
            TaskUpdate::Allocated(handle) => {
                state.candidates[i].instance = Some(handle);
            }
            TaskUpdate::Remote(remote) => {
                let candidate = &mut state.candidates[i];
                let mut changed = match remote {
                    RemoteState::Creating => candidate.advance(CandidateStatus::Creating),
                    RemoteState::Connecting => candidate.advance(CandidateStatus::Connecting),
                    RemoteState::Initializing => {
                        let moved = candidate.advance(CandidateStatus::Connecting);
                        candidate.mark_initializing() || moved
                    }
                    RemoteState::Ready | RemoteState::Failed => false,
                };
                changed |= state.update_progress(i);
                if changed {
                    state.emit_candidate(i);
                    state.emit_round_progress();
                }
            }
            TaskUpdate::Ready(handle) => {
                ready.push((report.at, report.candidate_id, handle));
            }
            TaskUpdate::Failed(err) => {
                let candidate = &mut state.candidates[i];
                info!(
                    round = state.round,
                    candidate_id = %candidate.id,
                    offer_id = %candidate.offer.id,
                    reason = %err,
                    "Candidate failed"
                );
                if candidate.fail(err.to_string()) {
                    state.emit_candidate(i);
                }
            }
            TaskUpdate::Cancelled => {
                if state.candidates[i].cancel() {
                    state.emit_candidate(i);
                }
            }
        }
    }

    /// Pick the earliest Ready report (lowest id on ties), mark it the
    /// winner, and cancel every other live candidate.
    fn declare_winner(
        &self,
        state: &mut RoundState<'_>,
        mut ready: Vec<(Instant, CandidateId, InstanceHandle)>,
    ) -> Option<CandidateId> {
        ready.sort_by_key(|(at, id, _)| (*at, *id));
        let mut reports = ready.into_iter();
        let (_, winner_id, handle) = reports.next()?;

        let w = state.index[&winner_id];
        let winner = &mut state.candidates[w];
        winner.instance = Some(handle);
        winner.advance(CandidateStatus::Ready);
        info!(
            round = state.round,
            candidate_id = %winner_id,
            offer_id = %winner.offer.id,
            elapsed_secs = winner.elapsed().as_secs(),
            "Winner declared"
        );
        state.emit_candidate(w);

        // Ready-but-lost candidates already stopped polling; destroy here.
        for (_, loser_id, handle) in reports {
            debug!(candidate_id = %loser_id, "Lost tie-break, destroying");
            spawn_destroy(self.api(), loser_id, handle.id);
        }

        state.cancel_remaining();
        Some(winner_id)
    }

    /// Wait for cancelled tasks in the background and destroy any instance
    /// that reached Ready after the round was decided.
    fn reap(
        &self,
        mut tasks: JoinSet<()>,
        mut rx: mpsc::UnboundedReceiver<TaskReport>,
        winner: Option<CandidateId>,
    ) {
        let api = self.api();
        tokio::spawn(async move {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Provisioning task ended abnormally");
                }
            }
            while let Ok(report) = rx.try_recv() {
                if Some(report.candidate_id) == winner {
                    continue;
                }
                if let TaskUpdate::Ready(handle) = report.update {
                    debug!(candidate_id = %report.candidate_id, "Reaping late ready instance");
                    spawn_destroy(Arc::clone(&api), report.candidate_id, handle.id);
                }
            }
            debug!("Round reaped");
        });
    }
}

/// Mutable per-round bookkeeping owned by [`RaceOrchestrator::run_round`].
struct RoundState<'a> {
    round: u32,
    started: Instant,
    candidates: Vec<Candidate>,
    index: HashMap<CandidateId, usize>,
    estimator: ProgressEstimator,
    events: &'a EventSink,
    last_progress: Option<(u8, Eta)>,
}

impl RoundState<'_> {
    fn all_terminal(&self) -> bool {
        self.candidates.iter().all(Candidate::is_terminal)
    }

    fn emit_candidate(&self, i: usize) {
        let c = &self.candidates[i];
        self.events.emit(RaceEvent::CandidateUpdated {
            candidate_id: c.id,
            status: c.status(),
            progress: c.progress(),
        });
    }

    fn update_progress(&mut self, i: usize) -> bool {
        let candidate = &mut self.candidates[i];
        let estimate = self.estimator.estimate(candidate.stage(), candidate.elapsed());
        candidate.raise_progress(estimate)
    }

    fn refresh_progress(&mut self) {
        for i in 0..self.candidates.len() {
            if self.update_progress(i) {
                self.emit_candidate(i);
            }
        }
        self.emit_round_progress();
    }

    fn emit_round_progress(&mut self) {
        let max_progress = self
            .candidates
            .iter()
            .map(Candidate::progress)
            .max()
            .unwrap_or(0);
        let eta = Eta::compute(self.started.elapsed(), max_progress);
        if self.last_progress == Some((max_progress, eta)) {
            return;
        }
        self.last_progress = Some((max_progress, eta));
        self.events.emit(RaceEvent::Progress {
            round: self.round,
            max_progress,
            eta,
        });
    }

    fn cancel_remaining(&mut self) {
        for i in 0..self.candidates.len() {
            if self.candidates[i].cancel() {
                self.emit_candidate(i);
            }
        }
    }

    fn fail_remaining(&mut self, reason: &str) {
        for i in 0..self.candidates.len() {
            if self.candidates[i].fail(reason) {
                self.emit_candidate(i);
            }
        }
    }
}
