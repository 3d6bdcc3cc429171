//! Concurrent GPU instance provisioning.
//!
//! Asking a marketplace for one GPU instance is slow and often fails: offers
//! get taken, machines never boot, networking stalls. This crate races
//! several offers at once, keeps the first instance that becomes ready, and
//! destroys every other attempt.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  RaceSession  (caller facade: subscribe / cancel / accept)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │  RoundController  (rounds, offer exclusion, exhaustion)      │
//! │        │                                                     │
//! │        ▼                                                     │
//! │  RaceOrchestrator  (one round: winner, cancel, cleanup)      │
//! │        │                                                     │
//! │        ├──► ProvisioningTask #1 ──► create / poll / destroy  │
//! │        ├──► ProvisioningTask #2 ──►        ...               │
//! │        └──► ProvisioningTask #N ──►        ...               │
//! └──────────────────────────────────────────────────────────────┘
//!              │                              │
//!              ▼                              ▼
//!        OfferSearch                   ProvisioningApi
//!                (providers::latitude, or your own)
//! ```
//!
//! Tasks never touch shared candidate state: they report over a channel and
//! the orchestrator is the only writer. At most one candidate per race is
//! ever Ready.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gpu_race::providers::latitude::Latitude;
//! use gpu_race::providers::{CreateOptions, OfferFilter};
//! use gpu_race::{RaceConfig, RaceOrchestrator, RaceSession, RoundController, TaskSettings};
//!
//! let config = RaceConfig::load(None)?;
//! let provider = Arc::new(Latitude::new(api_key, project_id)?);
//! let settings = TaskSettings::from_config(&config, CreateOptions::default());
//! let orchestrator = RaceOrchestrator::new(provider.clone(), settings);
//! let controller = RoundController::new(provider, orchestrator, config.candidates_per_round);
//!
//! let mut session = RaceSession::from_config(controller, &config, OfferFilter::default());
//! let mut events = session.subscribe();
//! session.start();
//! let instance = session.accept_winner().await?;
//! ```

pub mod candidate;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod progress;
pub mod providers;
pub mod round;
pub mod session;
pub mod task;

pub use candidate::{Candidate, CandidateId, CandidateStatus};
pub use config::{FailoverStrategy, RaceConfig};
pub use error::RaceError;
pub use events::{EventSink, RaceEvent, RoundSummary};
pub use orchestrator::{RaceOrchestrator, RoundOutcome, RoundResult};
pub use progress::{Eta, ProgressEstimator, Stage};
pub use providers::latitude;
pub use round::{Race, RaceOutcome, RoundController};
pub use session::{RaceObserver, RaceSession};
pub use task::TaskSettings;
