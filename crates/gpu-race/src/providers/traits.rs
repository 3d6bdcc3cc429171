//! Marketplace collaborator traits and common types.
//!
//! A race consumes two external services: an [`OfferSearch`] that ranks
//! priced GPU configurations, and a [`ProvisioningApi`] that turns one offer
//! into a running instance.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FailoverStrategy;

/// Errors that can occur during marketplace operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The offer was taken by another requester.
    #[error("Offer unavailable: {0}")]
    OfferUnavailable(String),

    /// The provider reported that provisioning failed.
    #[error("Provisioning failed: {0}")]
    Failed(String),

    /// Transport-level failure; safe to retry.
    #[error("Network error: {0}")]
    Network(String),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// Whether the operation may succeed if retried unchanged.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Api {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// A priced, located compute configuration from the marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer identifier, unique within the marketplace.
    pub id: String,
    /// Marketplace that published the offer.
    pub provider_id: String,
    /// GPU model (e.g., "H100", "L40S").
    pub gpu_model: String,
    /// GPU memory in GB.
    pub vram_gb: u32,
    /// Hourly price in USD.
    pub price_per_hour: f64,
    /// Region or site the instance would land in.
    pub region: String,
    /// Reliability score in `[0.0, 1.0]`.
    pub reliability: f64,
}

impl fmt::Display for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}GB @ {} (${:.2}/hr, reliability {:.0}%)",
            self.gpu_model,
            self.vram_gb,
            self.region,
            self.price_per_hour,
            self.reliability * 100.0
        )
    }
}

/// Upstream filter handed to the offer search service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfferFilter {
    /// Case-insensitive GPU model substring.
    pub gpu_model: Option<String>,
    /// Minimum GPU memory in GB.
    pub min_vram_gb: Option<u32>,
    /// Maximum hourly price in USD.
    pub max_price_per_hour: Option<f64>,
    /// Exact region match.
    pub region: Option<String>,
    /// Minimum reliability score.
    pub min_reliability: Option<f64>,
}

impl OfferFilter {
    /// Check whether an offer satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, offer: &Offer) -> bool {
        if let Some(model) = &self.gpu_model {
            if !offer
                .gpu_model
                .to_ascii_lowercase()
                .contains(&model.to_ascii_lowercase())
            {
                return false;
            }
        }
        if self.min_vram_gb.is_some_and(|min| offer.vram_gb < min) {
            return false;
        }
        if self
            .max_price_per_hour
            .is_some_and(|max| offer.price_per_hour > max)
        {
            return false;
        }
        if self
            .region
            .as_deref()
            .is_some_and(|region| !offer.region.eq_ignore_ascii_case(region))
        {
            return false;
        }
        if self
            .min_reliability
            .is_some_and(|min| offer.reliability < min)
        {
            return false;
        }
        true
    }
}

/// Handle to an instance allocated by the provisioning API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Provider-side instance identifier.
    pub id: String,
    /// SSH host/IP address, once known.
    pub host: Option<String>,
    /// SSH username, once known.
    pub username: Option<String>,
    /// When the provider created the instance.
    pub created_at: Option<DateTime<Utc>>,
}

impl InstanceHandle {
    /// Create a handle carrying only the instance id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: None,
            username: None,
            created_at: None,
        }
    }
}

/// Remote provisioning state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    /// The provider is allocating hardware.
    Creating,
    /// The instance is booting and becoming reachable.
    Connecting,
    /// Optional sub-phase after connecting (image pull, drivers).
    Initializing,
    /// The instance is usable.
    Ready,
    /// Provisioning failed on the provider side.
    Failed,
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Connecting => write!(f, "connecting"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStatus {
    /// Remote state.
    pub state: RemoteState,
    /// Provider-supplied detail (failure reason, raw status).
    pub detail: Option<String>,
    /// Refreshed instance handle, when the provider returns connection info.
    pub instance: Option<InstanceHandle>,
}

impl RemoteStatus {
    /// Status with no detail attached.
    #[must_use]
    pub const fn new(state: RemoteState) -> Self {
        Self {
            state,
            detail: None,
            instance: None,
        }
    }

    /// Attach a detail message.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Response from a successful create call.
#[derive(Debug, Clone)]
pub struct CreatedInstance {
    /// Allocated instance.
    pub instance: InstanceHandle,
    /// State the provider reported at creation.
    pub initial: RemoteState,
}

/// Options passed along with every create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateOptions {
    /// Instance name prefix.
    pub name_prefix: String,
    /// SSH key IDs to configure.
    pub ssh_keys: Vec<String>,
    /// Failover/storage strategy chosen by the user.
    pub failover: Option<FailoverStrategy>,
}

/// Offer search service.
#[async_trait]
pub trait OfferSearch: Send + Sync {
    /// Return ranked offers matching `filter`, skipping `exclude` ids.
    ///
    /// May return fewer offers than exist; an empty result is not an error.
    async fn search(
        &self,
        filter: &OfferFilter,
        exclude: &[String],
    ) -> Result<Vec<Offer>, ProviderError>;
}

/// Instance provisioning API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningApi: Send + Sync {
    /// Request an instance for `offer`.
    async fn create_instance(
        &self,
        offer: &Offer,
        options: &CreateOptions,
    ) -> Result<CreatedInstance, ProviderError>;

    /// Poll an instance's provisioning state.
    async fn get_status(&self, instance_id: &str) -> Result<RemoteStatus, ProviderError>;

    /// Destroy an instance.
    async fn destroy_instance(&self, instance_id: &str) -> Result<(), ProviderError>;

    /// Whether [`RemoteState::Initializing`] is ever reported.
    fn reports_initializing(&self) -> bool {
        false
    }
}
