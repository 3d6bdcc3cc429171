//! Events emitted by a race session.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::candidate::{Candidate, CandidateId, CandidateStatus};
use crate::progress::Eta;

/// Capacity of the session event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events observed by session subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaceEvent {
    /// A round launched its candidates.
    RoundStarted {
        round: u32,
        candidates: Vec<(CandidateId, String)>,
    },

    /// A candidate changed status or progress.
    CandidateUpdated {
        candidate_id: CandidateId,
        status: CandidateStatus,
        progress: u8,
    },

    /// Aggregate progress. `max_progress` is the highest value reached in
    /// the race so far and never decreases; `eta` covers the current round.
    Progress { round: u32, max_progress: u8, eta: Eta },

    /// A round ended without a winner.
    RoundFailed { round: u32, summary: RoundSummary },

    /// A candidate won the race.
    WinnerFound { candidate: Box<Candidate> },

    /// The caller rejected the winner and the search resumed.
    WinnerRejected { candidate_id: CandidateId },

    /// Every allowed round ended without a winner.
    RoundExhausted { rounds: u32 },

    /// The caller cancelled the race.
    RaceCancelled,
}

/// Informational tally of a round's candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundSummary {
    /// Candidates raced.
    pub total: usize,
    /// Candidates that failed.
    pub failed: usize,
    /// Candidates that were cancelled.
    pub cancelled: usize,
}

impl RoundSummary {
    /// Tally the final statuses of a round.
    #[must_use]
    pub fn from_candidates(candidates: &[Candidate]) -> Self {
        let mut summary = Self {
            total: candidates.len(),
            ..Self::default()
        };
        for c in candidates {
            match c.status() {
                CandidateStatus::Failed => summary.failed += 1,
                CandidateStatus::Cancelled => summary.cancelled += 1,
                _ => {}
            }
        }
        summary
    }
}

impl fmt::Display for RoundSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} attempts failed", self.failed, self.total)
    }
}

/// Sending half of the session event stream.
///
/// Sending never blocks and never fails the race; with no subscribers the
/// event is dropped. Clones share the channel and the progress high-water
/// mark, so aggregate progress stays monotonic across rounds.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<RaceEvent>,
    progress_high: Arc<AtomicU8>,
}

impl EventSink {
    /// Create a sink with a fresh channel.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            progress_high: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RaceEvent> {
        self.tx.subscribe()
    }

    /// Emit an event.
    pub fn emit(&self, mut event: RaceEvent) {
        if let RaceEvent::Progress { max_progress, .. } = &mut event {
            let previous = self.progress_high.fetch_max(*max_progress, Ordering::Relaxed);
            *max_progress = previous.max(*max_progress);
        }
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_display() {
        let summary = RoundSummary {
            total: 5,
            failed: 2,
            cancelled: 3,
        };
        assert_eq!(summary.to_string(), "2 of 5 attempts failed");
    }

    #[test]
    fn test_event_json_tag() {
        let json = serde_json::to_value(RaceEvent::CandidateUpdated {
            candidate_id: CandidateId(3),
            status: CandidateStatus::Connecting,
            progress: 20,
        })
        .unwrap();
        assert_eq!(json["type"], "candidate_updated");
        assert_eq!(json["candidate_id"], 3);
        assert_eq!(json["status"], "connecting");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let sink = EventSink::new();
        sink.emit(RaceEvent::RaceCancelled);

        let mut rx = sink.subscribe();
        sink.emit(RaceEvent::RoundExhausted { rounds: 2 });
        assert!(matches!(
            rx.recv().await,
            Ok(RaceEvent::RoundExhausted { rounds: 2 })
        ));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_across_rounds() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        for (round, max_progress) in [(1, 40), (2, 10), (2, 55)] {
            sink.clone().emit(RaceEvent::Progress {
                round,
                max_progress,
                eta: Eta::Estimating,
            });
        }

        let mut seen = Vec::new();
        while let Ok(RaceEvent::Progress { max_progress, .. }) = rx.try_recv() {
            seen.push(max_progress);
        }
        assert_eq!(seen, vec![40, 40, 55]);
    }
}
