//! Fire-and-forget destruction of instances that did not win.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::candidate::CandidateId;
use crate::error::RaceError;
use crate::providers::ProvisioningApi;

/// Destroy an instance in the background.
///
/// Failures are logged as [`RaceError::CleanupFailed`] and never reach the
/// caller; the race outcome is already decided by the time this runs.
pub fn spawn_destroy(
    api: Arc<dyn ProvisioningApi>,
    candidate_id: CandidateId,
    instance_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        debug!(candidate_id = %candidate_id, instance_id = %instance_id, "Destroying instance");
        match api.destroy_instance(&instance_id).await {
            Ok(()) => {
                debug!(candidate_id = %candidate_id, instance_id = %instance_id, "Instance destroyed");
            }
            Err(e) => {
                let err = RaceError::CleanupFailed {
                    candidate_id,
                    instance_id,
                    reason: e.to_string(),
                };
                warn!(error = %err, "Cleanup failed");
            }
        }
    })
}
