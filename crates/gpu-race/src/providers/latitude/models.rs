//! Latitude.sh GPU VM API models.
//!
//! Based on the JSON:API specification used by Latitude.sh. Only the fields
//! a race needs are modelled.

use serde::{Deserialize, Serialize};

use crate::config::FailoverStrategy;

// ============================================================================
// Common JSON:API wrapper types
// ============================================================================

/// JSON:API response wrapper.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    /// Response data.
    pub data: T,
}

/// JSON:API error document.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    /// Error entries.
    #[serde(default)]
    pub errors: Vec<ApiErrorEntry>,
}

/// One JSON:API error entry.
#[derive(Debug, Deserialize)]
pub struct ApiErrorEntry {
    /// Machine-readable code.
    pub code: Option<String>,
    /// Human-readable title.
    pub title: Option<String>,
    /// Detailed message.
    pub detail: Option<String>,
}

impl ApiErrorBody {
    /// First human-readable message in the document.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        self.errors
            .iter()
            .find_map(|e| e.detail.clone().or_else(|| e.title.clone()))
    }

    /// Whether any entry reports exhausted stock.
    #[must_use]
    pub fn is_out_of_stock(&self) -> bool {
        self.errors.iter().any(|e| {
            e.code
                .as_deref()
                .is_some_and(|c| c.contains("stock") || c.contains("unavailable"))
        })
    }
}

// ============================================================================
// Virtual Machine types
// ============================================================================

/// Virtual Machine resource from API.
#[derive(Debug, Deserialize)]
pub struct VirtualMachineResource {
    /// VM ID.
    pub id: String,
    /// VM attributes.
    pub attributes: VirtualMachineAttributes,
}

/// Virtual Machine attributes.
#[derive(Debug, Deserialize)]
pub struct VirtualMachineAttributes {
    /// VM name.
    pub name: String,
    /// VM status (e.g., "Scheduling", "Configuring network", "Running").
    pub status: String,
    /// Creation timestamp.
    pub created_at: Option<String>,
    /// VM credentials (requires `extra_fields[virtual_machines]=credentials`).
    pub credentials: Option<VmCredentials>,
}

/// VM credentials.
#[derive(Debug, Deserialize)]
pub struct VmCredentials {
    /// Username for SSH access.
    pub username: Option<String>,
    /// Hostname/IP for access.
    pub host: Option<String>,
}

/// Request body for creating a Virtual Machine.
#[derive(Debug, Serialize)]
pub struct CreateVirtualMachineBody {
    /// Request data.
    pub data: CreateVirtualMachineData,
}

/// Create Virtual Machine data wrapper.
#[derive(Debug, Serialize)]
pub struct CreateVirtualMachineData {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// VM attributes.
    pub attributes: CreateVirtualMachineAttributes,
}

/// Attributes for creating a Virtual Machine.
#[derive(Debug, Serialize)]
pub struct CreateVirtualMachineAttributes {
    /// VM name.
    pub name: String,
    /// Plan slug or ID.
    pub plan: String,
    /// Site (location) slug.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    /// SSH key IDs to configure.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    /// Project ID or slug.
    pub project: String,
    /// Failover/storage strategy, forwarded verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<FailoverStrategy>,
}

// ============================================================================
// Virtual Machine Plan types
// ============================================================================

/// Virtual Machine plan resource.
#[derive(Debug, Deserialize)]
pub struct VirtualMachinePlanResource {
    /// Plan ID.
    pub id: String,
    /// Plan attributes.
    pub attributes: VirtualMachinePlanAttributes,
}

/// Virtual Machine plan attributes.
#[derive(Debug, Deserialize)]
pub struct VirtualMachinePlanAttributes {
    /// Plan name (e.g., "vm.h100.small").
    pub name: Option<String>,
    /// Available regions.
    pub regions: Option<Vec<VmPlanRegion>>,
    /// Stock level.
    pub stock_level: Option<String>,
}

/// VM plan region info.
#[derive(Debug, Deserialize)]
pub struct VmPlanRegion {
    /// Region name.
    pub name: Option<String>,
    /// Available locations.
    pub available: Option<Vec<String>>,
    /// Pricing info.
    pub pricing: Option<VmPlanPricing>,
}

/// VM plan pricing.
#[derive(Debug, Deserialize)]
pub struct VmPlanPricing {
    /// USD pricing.
    #[serde(rename = "USD")]
    pub usd: Option<VmPlanPrice>,
}

/// VM plan price details.
#[derive(Debug, Deserialize)]
pub struct VmPlanPrice {
    /// Hourly price.
    pub hour: Option<f64>,
}
