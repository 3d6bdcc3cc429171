//! Error types for provisioning races.

use thiserror::Error;

use crate::candidate::CandidateId;
use crate::providers::ProviderError;

/// Errors raised while racing candidates.
///
/// Only [`RaceError::RaceExhausted`] and [`RaceError::UserCancelled`] describe
/// a race that produced no resource. Per-candidate variants are recorded as
/// the candidate's failure reason and never abort siblings.
#[derive(Debug, Error)]
pub enum RaceError {
    /// The offer was taken by another requester.
    #[error("offer {0} is no longer available")]
    OfferUnavailable(String),

    /// The provider could not provision the candidate.
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// The candidate did not become ready within its max wait.
    #[error("provisioning timed out after {0}s")]
    ProvisioningTimeout(u64),

    /// Transient network failure that outlived its retries.
    #[error("network error: {0}")]
    Network(String),

    /// Every allowed round finished without a winner.
    #[error("race exhausted after {rounds} round(s)")]
    RaceExhausted { rounds: u32 },

    /// The caller cancelled the race.
    #[error("race cancelled by user")]
    UserCancelled,

    /// Destroying a losing instance failed. Logged only.
    #[error("cleanup of instance {instance_id} (candidate {candidate_id}) failed: {reason}")]
    CleanupFailed {
        candidate_id: CandidateId,
        instance_id: String,
        reason: String,
    },

    /// The session has no winner to accept or reject.
    #[error("no winner to act on")]
    NoWinner,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The race driver task stopped unexpectedly.
    #[error("race driver failed: {0}")]
    Internal(String),
}

impl RaceError {
    /// Map a provider error raised for a single candidate.
    #[must_use]
    pub fn from_provider(err: ProviderError) -> Self {
        match err {
            ProviderError::OfferUnavailable(offer) => Self::OfferUnavailable(offer),
            ProviderError::Network(msg) => Self::Network(msg),
            ProviderError::Failed(msg) => Self::ProvisioningFailed(msg),
            other => Self::ProvisioningFailed(other.to_string()),
        }
    }
}
