//! Race candidates and their provisioning lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::progress::Stage;
use crate::providers::{InstanceHandle, Offer};

/// Race-scoped candidate identifier.
///
/// Allocated from a counter owned by the race, so ids are never reused
/// across rounds and compare in allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub u64);

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Candidate lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    /// Not yet submitted to the provider.
    Pending,
    /// Create request in flight or hardware being allocated.
    Creating,
    /// Instance booting or becoming reachable.
    Connecting,
    /// Instance is usable.
    Ready,
    /// Provisioning failed.
    Failed,
    /// Withdrawn because another candidate won or the race was cancelled.
    Cancelled,
}

impl CandidateStatus {
    /// Whether the status is absorbing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Creating => write!(f, "creating"),
            Self::Connecting => write!(f, "connecting"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One offer undergoing a provisioning attempt within a race round.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    /// Race-scoped id.
    pub id: CandidateId,
    /// Round the candidate was raced in.
    pub round: u32,
    /// Offer being provisioned.
    pub offer: Offer,
    /// Allocated instance, once the create call succeeded.
    pub instance: Option<InstanceHandle>,
    status: CandidateStatus,
    progress: u8,
    error_reason: Option<String>,
    initializing: bool,
    /// Wall-clock start of the attempt.
    pub started_at: DateTime<Utc>,
    /// Wall-clock time the candidate became Ready.
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    ready_after: Option<std::time::Duration>,
}

impl Candidate {
    /// Create a pending candidate.
    #[must_use]
    pub fn new(id: CandidateId, round: u32, offer: Offer) -> Self {
        Self {
            id,
            round,
            offer,
            instance: None,
            status: CandidateStatus::Pending,
            progress: 0,
            error_reason: None,
            initializing: false,
            started_at: Utc::now(),
            ready_at: None,
            started: Instant::now(),
            ready_after: None,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> CandidateStatus {
        self.status
    }

    /// Estimated progress, 0–100.
    #[must_use]
    pub const fn progress(&self) -> u8 {
        self.progress
    }

    /// Failure reason; only set when [`CandidateStatus::Failed`].
    #[must_use]
    pub fn error_reason(&self) -> Option<&str> {
        self.error_reason.as_deref()
    }

    /// Whether the candidate has reached an absorbing status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time since the attempt started.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Time from launch to Ready. Fixed once set.
    #[must_use]
    pub const fn time_to_ready(&self) -> Option<std::time::Duration> {
        self.ready_after
    }

    /// Monotonic start instant.
    #[must_use]
    pub const fn started(&self) -> Instant {
        self.started
    }

    /// Reset the start clock when the candidate is launched.
    pub fn mark_started(&mut self) {
        self.started_at = Utc::now();
        self.started = Instant::now();
    }

    /// Estimator stage derived from status and observed sub-phase.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self.status {
            CandidateStatus::Pending => Stage::Pending,
            CandidateStatus::Creating => Stage::Creating,
            CandidateStatus::Connecting if self.initializing => Stage::Initializing,
            CandidateStatus::Connecting => Stage::Connecting,
            CandidateStatus::Ready | CandidateStatus::Failed | CandidateStatus::Cancelled => {
                Stage::Done
            }
        }
    }

    /// Move to a non-terminal status, or to `Ready`.
    ///
    /// Backward moves and moves out of a terminal status are ignored.
    /// Returns whether the status changed.
    pub fn advance(&mut self, next: CandidateStatus) -> bool {
        if self.is_terminal() || next <= self.status {
            return false;
        }
        match next {
            CandidateStatus::Failed | CandidateStatus::Cancelled => {
                debug!(candidate_id = %self.id, status = %next, "Use fail()/cancel() for this transition");
                false
            }
            CandidateStatus::Ready => {
                self.status = CandidateStatus::Ready;
                self.progress = 100;
                self.ready_at = Some(Utc::now());
                self.ready_after = Some(self.started.elapsed());
                true
            }
            _ => {
                self.status = next;
                true
            }
        }
    }

    /// Record that the provider reported the initializing sub-phase.
    pub fn mark_initializing(&mut self) -> bool {
        if self.status != CandidateStatus::Connecting || self.initializing {
            return false;
        }
        self.initializing = true;
        true
    }

    /// Raise progress; never lowers it and is a no-op unless in flight.
    pub fn raise_progress(&mut self, value: u8) -> bool {
        if !matches!(
            self.status,
            CandidateStatus::Creating | CandidateStatus::Connecting
        ) {
            return false;
        }
        let value = value.min(99);
        if value <= self.progress {
            return false;
        }
        self.progress = value;
        true
    }

    /// Mark the candidate failed. Returns whether the status changed.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = CandidateStatus::Failed;
        self.error_reason = Some(reason.into());
        true
    }

    /// Mark the candidate cancelled. Returns whether the status changed.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = CandidateStatus::Cancelled;
        true
    }
}
