//! Latitude.sh GPU VM API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    ApiErrorBody, ApiResponse, CreateVirtualMachineAttributes, CreateVirtualMachineBody,
    CreateVirtualMachineData, VirtualMachinePlanResource, VirtualMachineResource,
};
use crate::providers::traits::{
    CreateOptions, CreatedInstance, InstanceHandle, Offer, OfferFilter, OfferSearch,
    ProviderError, ProvisioningApi, RemoteState, RemoteStatus,
};

/// Base URL for Latitude.sh API.
const API_BASE_URL: &str = "https://api.latitude.sh";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Provider id stamped on every offer.
pub const PROVIDER_ID: &str = "latitude";

/// Separator between plan id and site in an offer id.
const OFFER_ID_SEPARATOR: char = '@';

/// Latitude.sh GPU marketplace.
#[derive(Clone)]
pub struct Latitude {
    /// HTTP client.
    client: Client,
    /// API base URL.
    base_url: String,
    /// API key for authentication.
    api_key: String,
    /// Project ID for VM operations.
    project_id: String,
}

impl Latitude {
    /// Create a new Latitude provider.
    ///
    /// # Arguments
    /// * `api_key` - Latitude.sh API key
    /// * `project_id` - Project ID for VM operations
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created or credentials are
    /// empty.
    pub fn new(
        api_key: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Self::with_base_url(api_key, project_id, API_BASE_URL)
    }

    /// Create a provider against a different API endpoint.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created or credentials are
    /// empty.
    pub fn with_base_url(
        api_key: impl Into<String>,
        project_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let project_id = project_id.into();
        if api_key.trim().is_empty() || project_id.trim().is_empty() {
            return Err(ProviderError::Config(
                "Latitude API key and project ID are required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            project_id,
        })
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request.
    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated DELETE request. A missing VM counts as deleted.
    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(text))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// Map a Latitude VM status string onto a remote state.
    #[must_use]
    pub fn remote_state(status: &str) -> RemoteState {
        match status {
            "Starting" => RemoteState::Connecting,
            "Configuring network" => RemoteState::Initializing,
            "Running" => RemoteState::Ready,
            "Stopped" | "Deleting" | "Failed" => RemoteState::Failed,
            // "Scheduling", "Scheduled", and anything new.
            _ => RemoteState::Creating,
        }
    }

    /// Convert API VM resource to an instance handle.
    fn to_instance(resource: &VirtualMachineResource) -> InstanceHandle {
        let credentials = resource.attributes.credentials.as_ref();
        InstanceHandle {
            id: resource.id.clone(),
            host: credentials.and_then(|c| c.host.clone()),
            username: credentials.and_then(|c| c.username.clone()),
            created_at: resource
                .attributes
                .created_at
                .as_ref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
        }
    }

    /// GPU model and memory from a plan name (e.g., "vm.h100.small").
    fn gpu_from_plan_name(name: &str) -> (&'static str, u32) {
        let name = name.to_ascii_lowercase();
        if name.contains("h100") {
            ("H100", 80)
        } else if name.contains("l40s") {
            ("L40S", 48)
        } else if name.contains("rtx6k") || name.contains("rtx6000") {
            ("RTX 6000 Pro", 96)
        } else if name.contains("a100") {
            ("A100", 80)
        } else {
            ("Unknown GPU", 0)
        }
    }

    /// Reliability score derived from the advertised stock level.
    fn reliability(stock_level: &str) -> f64 {
        match stock_level {
            "high" => 0.95,
            "medium" => 0.8,
            "low" => 0.5,
            "unavailable" => 0.0,
            _ => 0.3,
        }
    }

    /// Expand a plan into one offer per available site.
    fn to_offers(resource: &VirtualMachinePlanResource) -> Vec<Offer> {
        let attrs = &resource.attributes;
        let name = attrs.name.clone().unwrap_or_default();
        let (gpu_model, vram_gb) = Self::gpu_from_plan_name(&name);
        let reliability = Self::reliability(attrs.stock_level.as_deref().unwrap_or("unknown"));

        attrs
            .regions
            .iter()
            .flatten()
            .flat_map(|region| {
                let price = region
                    .pricing
                    .as_ref()
                    .and_then(|p| p.usd.as_ref())
                    .and_then(|usd| usd.hour)
                    .unwrap_or(0.0);
                region
                    .available
                    .iter()
                    .flatten()
                    .map(move |site| (site.clone(), price))
            })
            .map(|(site, price)| Offer {
                id: format!("{}{OFFER_ID_SEPARATOR}{site}", resource.id),
                provider_id: PROVIDER_ID.to_string(),
                gpu_model: gpu_model.to_string(),
                vram_gb,
                price_per_hour: price,
                region: site,
                reliability,
            })
            .collect()
    }

    /// Split an offer id into plan id and optional site.
    fn split_offer_id(offer_id: &str) -> (&str, Option<&str>) {
        match offer_id.split_once(OFFER_ID_SEPARATOR) {
            Some((plan, site)) => (plan, Some(site)),
            None => (offer_id, None),
        }
    }

    /// Classify a failed create response.
    fn create_error(offer: &Offer, err: ProviderError) -> ProviderError {
        match err {
            ProviderError::Api { status, message }
                if matches!(status, 409 | 410 | 422) =>
            {
                let body: Option<ApiErrorBody> = serde_json::from_str(&message).ok();
                if status != 422 || body.as_ref().is_some_and(ApiErrorBody::is_out_of_stock) {
                    ProviderError::OfferUnavailable(offer.id.clone())
                } else {
                    ProviderError::Failed(
                        body.and_then(|b| b.message()).unwrap_or(message),
                    )
                }
            }
            other => other,
        }
    }
}

#[async_trait]
impl OfferSearch for Latitude {
    async fn search(
        &self,
        filter: &OfferFilter,
        exclude: &[String],
    ) -> Result<Vec<Offer>, ProviderError> {
        let response: ApiResponse<Vec<VirtualMachinePlanResource>> =
            self.get("/plans/virtual_machines").await?;

        let mut offers: Vec<Offer> = response
            .data
            .iter()
            .flat_map(Self::to_offers)
            .filter(|o| o.reliability > 0.0)
            .filter(|o| filter.matches(o))
            .filter(|o| !exclude.contains(&o.id))
            .collect();

        offers.sort_by(|a, b| {
            b.reliability
                .total_cmp(&a.reliability)
                .then(a.price_per_hour.total_cmp(&b.price_per_hour))
        });

        debug!(offers = offers.len(), excluded = exclude.len(), "Offer search complete");
        Ok(offers)
    }
}

#[async_trait]
impl ProvisioningApi for Latitude {
    async fn create_instance(
        &self,
        offer: &Offer,
        options: &CreateOptions,
    ) -> Result<CreatedInstance, ProviderError> {
        let (plan, site) = Self::split_offer_id(&offer.id);
        let prefix = if options.name_prefix.is_empty() {
            "gpu-race"
        } else {
            options.name_prefix.as_str()
        };
        let name = format!("{prefix}-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        info!(name = %name, plan = %plan, site = ?site, "Creating GPU VM");

        let body = CreateVirtualMachineBody {
            data: CreateVirtualMachineData {
                resource_type: "virtual_machines".to_string(),
                attributes: CreateVirtualMachineAttributes {
                    name,
                    plan: plan.to_string(),
                    site: site.map(str::to_string),
                    ssh_keys: options.ssh_keys.clone(),
                    project: self.project_id.clone(),
                    failover: options.failover.clone(),
                },
            },
        };

        let response: ApiResponse<VirtualMachineResource> = self
            .post("/virtual_machines", &body)
            .await
            .map_err(|e| Self::create_error(offer, e))?;

        let instance = Self::to_instance(&response.data);
        let initial = Self::remote_state(&response.data.attributes.status);
        info!(vm_id = %instance.id, status = %response.data.attributes.status, "GPU VM created");
        Ok(CreatedInstance { instance, initial })
    }

    async fn get_status(&self, instance_id: &str) -> Result<RemoteStatus, ProviderError> {
        let response: ApiResponse<VirtualMachineResource> = self
            .get(&format!(
                "/virtual_machines/{instance_id}?extra_fields[virtual_machines]=credentials"
            ))
            .await?;

        let raw = &response.data.attributes.status;
        Ok(RemoteStatus {
            state: Self::remote_state(raw),
            detail: Some(raw.clone()),
            instance: Some(Self::to_instance(&response.data)),
        })
    }

    async fn destroy_instance(&self, instance_id: &str) -> Result<(), ProviderError> {
        info!(vm_id = %instance_id, "Deleting GPU VM");
        self.delete(&format!("/virtual_machines/{instance_id}")).await?;
        info!(vm_id = %instance_id, "GPU VM deleted");
        Ok(())
    }

    fn reports_initializing(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_state_mapping() {
        assert_eq!(Latitude::remote_state("Scheduling"), RemoteState::Creating);
        assert_eq!(Latitude::remote_state("Starting"), RemoteState::Connecting);
        assert_eq!(
            Latitude::remote_state("Configuring network"),
            RemoteState::Initializing
        );
        assert_eq!(Latitude::remote_state("Running"), RemoteState::Ready);
        assert_eq!(Latitude::remote_state("Stopped"), RemoteState::Failed);
    }

    #[test]
    fn test_split_offer_id() {
        assert_eq!(
            Latitude::split_offer_id("plan_abc@NYC"),
            ("plan_abc", Some("NYC"))
        );
        assert_eq!(Latitude::split_offer_id("plan_abc"), ("plan_abc", None));
    }

    #[test]
    fn test_requires_credentials() {
        assert!(matches!(
            Latitude::new("", "proj"),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn test_create_error_classification() {
        let offer = Offer {
            id: "plan_abc@NYC".to_string(),
            provider_id: PROVIDER_ID.to_string(),
            gpu_model: "H100".to_string(),
            vram_gb: 80,
            price_per_hour: 1.66,
            region: "NYC".to_string(),
            reliability: 0.95,
        };
        let conflict = ProviderError::Api {
            status: 409,
            message: String::new(),
        };
        assert!(matches!(
            Latitude::create_error(&offer, conflict),
            ProviderError::OfferUnavailable(ref id) if id == "plan_abc@NYC"
        ));

        let invalid = ProviderError::Api {
            status: 422,
            message: r#"{"errors":[{"code":"invalid","detail":"ssh key not found"}]}"#.to_string(),
        };
        assert!(matches!(
            Latitude::create_error(&offer, invalid),
            ProviderError::Failed(ref m) if m == "ssh key not found"
        ));
    }
}
