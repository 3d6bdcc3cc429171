//! Scripted in-memory GPU marketplace for race tests.
//!
//! Every offer follows a [`Plan`]: a timeline of remote states measured from
//! the moment its instance was created. Tests run on tokio's paused clock,
//! so timelines play out deterministically.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use gpu_race::providers::{
    CreateOptions, CreatedInstance, InstanceHandle, Offer, OfferFilter, OfferSearch,
    ProviderError, ProvisioningApi, RemoteState, RemoteStatus,
};
use gpu_race::{
    CandidateId, CandidateStatus, RaceConfig, RaceEvent, RaceOrchestrator, RaceSession,
    RoundController, TaskSettings,
};

/// How a create call fails.
#[derive(Debug, Clone, Copy)]
pub enum CreateFailure {
    /// Someone else took the offer.
    Unavailable,
    /// The provider is down.
    Outage,
}

/// Scripted behaviour of one offer.
#[derive(Debug, Clone)]
pub struct Plan {
    create_delay: Duration,
    create_failure: Option<CreateFailure>,
    timeline: Vec<(Duration, RemoteState)>,
    destroy_fails: bool,
    status_hangs: bool,
}

impl Plan {
    /// Boots to Connecting after two seconds and stays there.
    pub fn connecting() -> Self {
        Self {
            create_delay: Duration::ZERO,
            create_failure: None,
            timeline: vec![
                (Duration::ZERO, RemoteState::Creating),
                (Duration::from_secs(2), RemoteState::Connecting),
            ],
            destroy_fails: false,
            status_hangs: false,
        }
    }

    /// Never leaves Creating.
    pub fn stuck() -> Self {
        Self {
            timeline: vec![(Duration::ZERO, RemoteState::Creating)],
            ..Self::connecting()
        }
    }

    /// Create is rejected because the offer is gone.
    pub fn unavailable() -> Self {
        Self {
            create_failure: Some(CreateFailure::Unavailable),
            ..Self::connecting()
        }
    }

    /// Create is rejected by a provider outage.
    pub fn outage() -> Self {
        Self {
            create_failure: Some(CreateFailure::Outage),
            ..Self::connecting()
        }
    }

    /// Becomes Ready `secs` after creation.
    pub fn ready_at(mut self, secs: u64) -> Self {
        self.timeline
            .push((Duration::from_secs(secs), RemoteState::Ready));
        self
    }

    /// Fails on the provider side `secs` after creation.
    pub fn failed_at(mut self, secs: u64) -> Self {
        self.timeline
            .push((Duration::from_secs(secs), RemoteState::Failed));
        self
    }

    /// Create takes `secs` to return.
    pub fn create_delay(mut self, secs: u64) -> Self {
        self.create_delay = Duration::from_secs(secs);
        self
    }

    /// Every destroy call fails.
    pub fn destroy_fails(mut self) -> Self {
        self.destroy_fails = true;
        self
    }

    /// Status calls never return.
    pub fn status_hangs(mut self) -> Self {
        self.status_hangs = true;
        self
    }

    fn state_at(&self, elapsed: Duration) -> RemoteState {
        self.timeline
            .iter()
            .rev()
            .find(|(at, _)| *at <= elapsed)
            .map_or(RemoteState::Creating, |(_, state)| *state)
    }
}

#[derive(Debug)]
struct Instance {
    offer_id: String,
    created: Instant,
    destroyed: bool,
}

#[derive(Default)]
struct MarketState {
    offers: Vec<(Offer, Plan)>,
    instances: HashMap<String, Instance>,
    next_instance: u64,
    create_calls: Vec<String>,
    destroy_calls: Vec<String>,
    search_calls: usize,
}

/// In-memory marketplace implementing both provider traits.
#[derive(Default)]
pub struct Marketplace {
    state: Mutex<MarketState>,
}

impl Marketplace {
    /// Create a marketplace with no offers.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, MarketState> {
        self.state.lock().unwrap()
    }

    /// Publish an offer.
    pub fn add(&self, offer_id: &str, plan: Plan) {
        self.state().offers.push((offer(offer_id), plan));
    }

    /// Offer ids of instances that exist and were not destroyed.
    pub fn live_offers(&self) -> Vec<String> {
        let mut live: Vec<_> = self
            .state()
            .instances
            .values()
            .filter(|i| !i.destroyed)
            .map(|i| i.offer_id.clone())
            .collect();
        live.sort();
        live
    }

    /// Offer ids passed to create, in call order.
    pub fn create_calls(&self) -> Vec<String> {
        self.state().create_calls.clone()
    }

    /// Offer ids whose instances received a destroy call.
    pub fn destroy_attempts(&self) -> Vec<String> {
        let state = self.state();
        let mut ids: Vec<_> = state
            .destroy_calls
            .iter()
            .filter_map(|id| state.instances.get(id).map(|i| i.offer_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Number of search calls.
    pub fn search_calls(&self) -> usize {
        self.state().search_calls
    }

    fn plan(&self, offer_id: &str) -> Option<Plan> {
        self.state()
            .offers
            .iter()
            .find(|(o, _)| o.id == offer_id)
            .map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl OfferSearch for Marketplace {
    async fn search(
        &self,
        filter: &OfferFilter,
        exclude: &[String],
    ) -> Result<Vec<Offer>, ProviderError> {
        let mut state = self.state();
        state.search_calls += 1;
        Ok(state
            .offers
            .iter()
            .map(|(o, _)| o)
            .filter(|o| filter.matches(o) && !exclude.contains(&o.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ProvisioningApi for Marketplace {
    async fn create_instance(
        &self,
        offer: &Offer,
        _options: &CreateOptions,
    ) -> Result<CreatedInstance, ProviderError> {
        self.state().create_calls.push(offer.id.clone());
        let plan = self
            .plan(&offer.id)
            .ok_or_else(|| ProviderError::NotFound(offer.id.clone()))?;

        if !plan.create_delay.is_zero() {
            tokio::time::sleep(plan.create_delay).await;
        }
        match plan.create_failure {
            Some(CreateFailure::Unavailable) => {
                return Err(ProviderError::OfferUnavailable(offer.id.clone()))
            }
            Some(CreateFailure::Outage) => {
                return Err(ProviderError::Api {
                    status: 503,
                    message: "provider outage".to_string(),
                })
            }
            None => {}
        }

        let mut state = self.state();
        state.next_instance += 1;
        let id = format!("vm-{}", state.next_instance);
        state.instances.insert(
            id.clone(),
            Instance {
                offer_id: offer.id.clone(),
                created: Instant::now(),
                destroyed: false,
            },
        );
        Ok(CreatedInstance {
            instance: InstanceHandle::new(id),
            initial: plan.state_at(Duration::ZERO),
        })
    }

    async fn get_status(&self, instance_id: &str) -> Result<RemoteStatus, ProviderError> {
        let (offer_id, elapsed) = {
            let state = self.state();
            match state.instances.get(instance_id) {
                Some(i) if !i.destroyed => (i.offer_id.clone(), i.created.elapsed()),
                _ => return Err(ProviderError::NotFound(instance_id.to_string())),
            }
        };
        let plan = self
            .plan(&offer_id)
            .ok_or_else(|| ProviderError::NotFound(offer_id.clone()))?;
        if plan.status_hangs {
            std::future::pending::<()>().await;
        }
        let state = plan.state_at(elapsed);
        let status = RemoteStatus::new(state);
        Ok(if state == RemoteState::Failed {
            status.with_detail("boot failure")
        } else {
            status
        })
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        let offer_id = {
            let mut state = self.state();
            state.destroy_calls.push(instance_id.to_string());
            state.instances.get(instance_id).map(|i| i.offer_id.clone())
        };
        let fails = offer_id
            .and_then(|id| self.plan(&id))
            .is_some_and(|p| p.destroy_fails);
        if fails {
            return Err(ProviderError::Api {
                status: 503,
                message: "destroy rejected".to_string(),
            });
        }
        if let Some(instance) = self.state().instances.get_mut(instance_id) {
            instance.destroyed = true;
        }
        Ok(())
    }
}

/// A plain H100 offer.
pub fn offer(id: &str) -> Offer {
    Offer {
        id: id.to_string(),
        provider_id: "scripted".to_string(),
        gpu_model: "H100".to_string(),
        vram_gb: 80,
        price_per_hour: 2.0,
        region: "NYC".to_string(),
        reliability: 0.9,
    }
}

/// Fast-polling configuration used by the race tests.
pub fn config(candidates_per_round: usize, max_rounds: u32) -> RaceConfig {
    RaceConfig {
        candidates_per_round,
        max_rounds,
        round_deadline_secs: 300,
        poll_interval_ms: 1_000,
        max_wait_secs: 120,
        network_retries: 2,
        retry_backoff_ms: 100,
        failover: None,
    }
}

/// Session wired to a marketplace.
pub fn session(market: &Arc<Marketplace>, config: &RaceConfig) -> RaceSession {
    let settings = TaskSettings::from_config(config, CreateOptions::default());
    let orchestrator = RaceOrchestrator::new(market.clone(), settings);
    let controller = RoundController::new(market.clone(), orchestrator, config.candidates_per_round);
    RaceSession::from_config(controller, config, OfferFilter::default())
}

/// Records every event a session emits.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<RaceEvent>>>,
}

impl EventLog {
    /// Start recording. Call before [`RaceSession::start`].
    pub fn attach(session: &RaceSession) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        let mut rx = session.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                events.lock().unwrap().push(event);
            }
        });
        log
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<RaceEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(candidate, status, progress)` updates in emission order.
    pub fn updates(&self) -> Vec<(CandidateId, CandidateStatus, u8)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RaceEvent::CandidateUpdated {
                    candidate_id,
                    status,
                    progress,
                } => Some((candidate_id, status, progress)),
                _ => None,
            })
            .collect()
    }

    /// Offer ids raced in each round, by round number.
    pub fn rounds(&self) -> Vec<(u32, Vec<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RaceEvent::RoundStarted { round, candidates } => Some((
                    round,
                    candidates.into_iter().map(|(_, offer)| offer).collect(),
                )),
                _ => None,
            })
            .collect()
    }
}

/// Let background cleanup and reaping finish.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(30)).await;
}
