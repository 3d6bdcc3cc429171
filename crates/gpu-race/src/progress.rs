//! Progress and ETA estimation.
//!
//! Providers do not report real progress percentages. The estimator maps a
//! candidate's discrete stage and elapsed time onto fixed bands, which is a
//! placeholder policy rather than telemetry. Display smoothing belongs to
//! the presentation layer.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// No ETA is produced before this much time has elapsed.
const ETA_MIN_ELAPSED: Duration = Duration::from_secs(3);

/// No ETA is produced until some candidate is past this progress.
const ETA_MIN_PROGRESS: u8 = 10;

/// Estimator stage for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Not launched.
    Pending,
    /// Create call or allocation in progress.
    Creating,
    /// Booting / becoming reachable.
    Connecting,
    /// Provider-reported sub-phase after connecting.
    Initializing,
    /// Ready or any other terminal status.
    Done,
}

/// Maps (stage, elapsed) onto a 0–100 progress value.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    /// Whether the provider can report [`Stage::Initializing`]. When it
    /// cannot, the connecting band stretches over the initializing band.
    initializing_observable: bool,
    creating_ramp: Duration,
    connecting_ramp: Duration,
    initializing_ramp: Duration,
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ProgressEstimator {
    /// Create an estimator with the default ramp horizons.
    #[must_use]
    pub const fn new(initializing_observable: bool) -> Self {
        Self {
            initializing_observable,
            creating_ramp: Duration::from_secs(30),
            connecting_ramp: Duration::from_secs(180),
            initializing_ramp: Duration::from_secs(300),
        }
    }

    /// Override the elapsed time at which each band saturates.
    #[must_use]
    pub const fn with_ramps(
        mut self,
        creating: Duration,
        connecting: Duration,
        initializing: Duration,
    ) -> Self {
        self.creating_ramp = creating;
        self.connecting_ramp = connecting;
        self.initializing_ramp = initializing;
        self
    }

    /// Half-open `[low, high)` band for a stage.
    #[must_use]
    pub const fn band(&self, stage: Stage) -> (u8, u8) {
        match stage {
            Stage::Pending => (0, 1),
            Stage::Creating => (0, 15),
            Stage::Connecting if self.initializing_observable => (15, 40),
            Stage::Connecting => (15, 75),
            Stage::Initializing => (40, 75),
            Stage::Done => (100, 101),
        }
    }

    /// Estimate progress for a stage after `elapsed` since the attempt began.
    ///
    /// The value ramps linearly from the band floor toward (but never to) the
    /// band ceiling. Callers keep the maximum seen so far.
    #[must_use]
    pub fn estimate(&self, stage: Stage, elapsed: Duration) -> u8 {
        let ramp = match stage {
            Stage::Pending => return 0,
            Stage::Done => return 100,
            Stage::Creating => self.creating_ramp,
            Stage::Connecting => self.connecting_ramp,
            Stage::Initializing => self.initializing_ramp,
        };
        let (low, high) = self.band(stage);
        let span = f64::from(high - low - 1);
        let fraction = if ramp.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / ramp.as_secs_f64()).min(1.0)
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let offset = (span * fraction).floor() as u8;
        low + offset
    }
}

/// Human-facing time estimate for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "remaining_secs", rename_all = "snake_case")]
pub enum Eta {
    /// Too early for a stable estimate.
    Estimating,
    /// Estimated time remaining.
    Remaining(#[serde(with = "secs")] Duration),
}

impl Eta {
    /// Linear extrapolation from the leading candidate's progress.
    #[must_use]
    pub fn compute(elapsed: Duration, max_progress: u8) -> Self {
        if elapsed < ETA_MIN_ELAPSED || max_progress <= ETA_MIN_PROGRESS {
            return Self::Estimating;
        }
        let total = elapsed.as_secs_f64() * 100.0 / f64::from(max_progress);
        let remaining = (total - elapsed.as_secs_f64()).max(0.0);
        Self::Remaining(Duration::from_secs_f64(remaining))
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Estimating => write!(f, "estimating…"),
            Self::Remaining(d) => {
                let secs = d.as_secs();
                if secs < 60 {
                    write!(f, "~{secs}s remaining")
                } else {
                    write!(f, "~{}m {:02}s remaining", secs / 60, secs % 60)
                }
            }
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
