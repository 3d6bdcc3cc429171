//! GPU marketplace providers.
//!
//! This module contains the [`OfferSearch`] and [`ProvisioningApi`] traits
//! and implementations for providers offering GPU VMs.

pub mod latitude;
pub mod traits;

#[cfg(test)]
pub use traits::MockProvisioningApi;
pub use traits::{
    CreateOptions, CreatedInstance, InstanceHandle, Offer, OfferFilter, OfferSearch,
    ProviderError, ProvisioningApi, RemoteState, RemoteStatus,
};
