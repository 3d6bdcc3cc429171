//! Provisioning task: drives one candidate from create request to a
//! terminal state.
//!
//! Tasks never touch candidate state. They report through an unbounded
//! channel and the orchestrator applies the reports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candidate::CandidateId;
use crate::cleanup::spawn_destroy;
use crate::config::RaceConfig;
use crate::error::RaceError;
use crate::providers::{
    CreateOptions, InstanceHandle, Offer, ProviderError, ProvisioningApi, RemoteState,
    RemoteStatus,
};

/// Per-task timing and retry settings.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Hard timeout for the whole attempt.
    pub max_wait: Duration,
    /// Retries for transient poll errors.
    pub network_retries: u32,
    /// Base backoff between retries.
    pub retry_backoff: Duration,
    /// Options forwarded on create.
    pub create_options: CreateOptions,
}

impl TaskSettings {
    /// Derive task settings from a race configuration.
    #[must_use]
    pub fn from_config(config: &RaceConfig, create_options: CreateOptions) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_wait: config.max_wait(),
            network_retries: config.network_retries,
            retry_backoff: config.retry_backoff(),
            create_options: CreateOptions {
                failover: create_options.failover.or_else(|| config.failover.clone()),
                ..create_options
            },
        }
    }
}

/// Result of a provider call raced against cancellation and max wait.
enum Step<T> {
    Cancelled,
    TimedOut,
    Done(T),
}

/// A state change reported by a task.
#[derive(Debug)]
pub enum TaskUpdate {
    /// The create call returned an instance.
    Allocated(InstanceHandle),
    /// A poll observed a non-terminal remote state.
    Remote(RemoteState),
    /// The instance is usable.
    Ready(InstanceHandle),
    /// The attempt failed.
    Failed(RaceError),
    /// The attempt stopped because its token was cancelled.
    Cancelled,
}

/// Message sent from a task to the orchestrator.
#[derive(Debug)]
pub struct TaskReport {
    /// Reporting candidate.
    pub candidate_id: CandidateId,
    /// When the change was observed.
    pub at: Instant,
    /// The change.
    pub update: TaskUpdate,
}

/// Async unit driving one candidate.
pub struct ProvisioningTask {
    candidate_id: CandidateId,
    offer: Offer,
    api: Arc<dyn ProvisioningApi>,
    settings: Arc<TaskSettings>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TaskReport>,
}

impl ProvisioningTask {
    /// Create a task; nothing runs until [`ProvisioningTask::run`] is awaited.
    #[must_use]
    pub fn new(
        candidate_id: CandidateId,
        offer: Offer,
        api: Arc<dyn ProvisioningApi>,
        settings: Arc<TaskSettings>,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<TaskReport>,
    ) -> Self {
        Self {
            candidate_id,
            offer,
            api,
            settings,
            cancel,
            tx,
        }
    }

    fn report(&self, update: TaskUpdate) {
        let report = TaskReport {
            candidate_id: self.candidate_id,
            at: Instant::now(),
            update,
        };
        if self.tx.send(report).is_err() {
            debug!(candidate_id = %self.candidate_id, "Orchestrator gone, dropping report");
        }
    }

    fn destroy(&self, instance: &InstanceHandle) {
        spawn_destroy(
            Arc::clone(&self.api),
            self.candidate_id,
            instance.id.clone(),
        );
    }

    /// Drive the candidate to a terminal state.
    pub async fn run(self) {
        if self.cancel.is_cancelled() {
            self.report(TaskUpdate::Cancelled);
            return;
        }

        let deadline = Instant::now() + self.settings.max_wait;
        debug!(
            candidate_id = %self.candidate_id,
            offer_id = %self.offer.id,
            "Provisioning task started"
        );

        let Some(mut instance) = self.create(deadline).await else {
            return;
        };

        loop {
            let wake = (Instant::now() + self.settings.poll_interval).min(deadline);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.abandon(&instance);
                    return;
                }
                () = tokio::time::sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                self.fail_timeout(&instance);
                return;
            }

            let status = match self.poll(&instance.id, deadline).await {
                Ok(Step::Done(status)) => status,
                Ok(Step::Cancelled) => {
                    self.abandon(&instance);
                    return;
                }
                Ok(Step::TimedOut) => {
                    self.fail_timeout(&instance);
                    return;
                }
                Err(e) => {
                    warn!(candidate_id = %self.candidate_id, error = %e, "Polling failed");
                    self.destroy(&instance);
                    self.report(TaskUpdate::Failed(e));
                    return;
                }
            };

            if let Some(refreshed) = status.instance {
                instance = refreshed;
            }

            if self.settle(status.state, status.detail, &instance) {
                return;
            }
        }
    }

    /// Issue the create call. Returns `None` when the task already ended.
    async fn create(&self, deadline: Instant) -> Option<InstanceHandle> {
        let api = Arc::clone(&self.api);
        let offer = self.offer.clone();
        let options = self.settings.create_options.clone();
        let mut create =
            Box::pin(async move { api.create_instance(&offer, &options).await });

        let step = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Step::Cancelled,
            () = tokio::time::sleep_until(deadline) => Step::TimedOut,
            result = &mut create => Step::Done(result),
        };

        let result = match step {
            Step::Done(result) => result,
            interrupted => {
                // Let the in-flight create finish in the background so a late
                // allocation is still destroyed.
                let api = Arc::clone(&self.api);
                let candidate_id = self.candidate_id;
                tokio::spawn(async move {
                    if let Ok(created) = create.await {
                        spawn_destroy(api, candidate_id, created.instance.id);
                    }
                });
                self.report(match interrupted {
                    Step::TimedOut => TaskUpdate::Failed(RaceError::ProvisioningTimeout(
                        self.settings.max_wait.as_secs(),
                    )),
                    _ => TaskUpdate::Cancelled,
                });
                return None;
            }
        };

        let created = match result {
            Ok(created) => created,
            Err(e) => {
                info!(
                    candidate_id = %self.candidate_id,
                    offer_id = %self.offer.id,
                    error = %e,
                    "Create failed"
                );
                self.report(TaskUpdate::Failed(RaceError::from_provider(e)));
                return None;
            }
        };

        debug!(
            candidate_id = %self.candidate_id,
            instance_id = %created.instance.id,
            state = %created.initial,
            "Instance allocated"
        );
        self.report(TaskUpdate::Allocated(created.instance.clone()));

        if self.cancel.is_cancelled() {
            self.abandon(&created.instance);
            return None;
        }
        if self.settle(created.initial, None, &created.instance) {
            return None;
        }
        Some(created.instance)
    }

    /// Apply a remote state. Returns `true` when the task reached a
    /// terminal state.
    fn settle(&self, state: RemoteState, detail: Option<String>, instance: &InstanceHandle) -> bool {
        match state {
            RemoteState::Ready => {
                info!(candidate_id = %self.candidate_id, instance_id = %instance.id, "Instance ready");
                self.report(TaskUpdate::Ready(instance.clone()));
                true
            }
            RemoteState::Failed => {
                let reason = detail.unwrap_or_else(|| "provider reported failure".to_string());
                info!(candidate_id = %self.candidate_id, reason = %reason, "Instance failed");
                self.destroy(instance);
                self.report(TaskUpdate::Failed(RaceError::ProvisioningFailed(reason)));
                true
            }
            other => {
                self.report(TaskUpdate::Remote(other));
                false
            }
        }
    }

    /// Poll once, retrying transient errors with exponential backoff.
    ///
    /// Neither the status call nor a backoff may outlive `deadline`.
    async fn poll(
        &self,
        instance_id: &str,
        deadline: Instant,
    ) -> Result<Step<RemoteStatus>, RaceError> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(Step::Cancelled),
                () = tokio::time::sleep_until(deadline) => return Ok(Step::TimedOut),
                result = self.api.get_status(instance_id) => result,
            };

            match result {
                Ok(status) => {
                    debug!(
                        candidate_id = %self.candidate_id,
                        instance_id,
                        state = %status.state,
                        "Polled instance status"
                    );
                    return Ok(Step::Done(status));
                }
                Err(e) if e.is_transient() && attempt < self.settings.network_retries => {
                    let backoff = self.settings.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    debug!(
                        candidate_id = %self.candidate_id,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        error = %e,
                        "Transient poll error, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Ok(Step::Cancelled),
                        () = tokio::time::sleep_until(deadline) => return Ok(Step::TimedOut),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(ProviderError::NotFound(_)) => {
                    return Err(RaceError::ProvisioningFailed(
                        "instance disappeared".to_string(),
                    ));
                }
                Err(e) if e.is_transient() => return Err(RaceError::Network(e.to_string())),
                Err(e) => return Err(RaceError::from_provider(e)),
            }
        }
    }

    fn fail_timeout(&self, instance: &InstanceHandle) {
        info!(candidate_id = %self.candidate_id, "Candidate exceeded max wait");
        self.destroy(instance);
        self.report(TaskUpdate::Failed(RaceError::ProvisioningTimeout(
            self.settings.max_wait.as_secs(),
        )));
    }

    fn abandon(&self, instance: &InstanceHandle) {
        debug!(candidate_id = %self.candidate_id, instance_id = %instance.id, "Task cancelled");
        self.destroy(instance);
        self.report(TaskUpdate::Cancelled);
    }
}
