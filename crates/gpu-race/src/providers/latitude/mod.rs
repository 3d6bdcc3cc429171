//! Latitude.sh GPU VM provider.
//!
//! Implements [`OfferSearch`](crate::providers::OfferSearch) and
//! [`ProvisioningApi`](crate::providers::ProvisioningApi) for Latitude.sh
//! GPU VMs. Each plan is expanded into one offer per site with stock.
//!
//! ## Available GPU Plans
//!
//! - **H100** - NVIDIA H100 80GB (~$1.66/hr)
//! - **L40S** - NVIDIA L40S 48GB (~$0.74/hr)
//! - **RTX 6000 Pro** - NVIDIA RTX 6000 Pro 96GB (~$2.44/hr)
//!
//! ## Example
//!
//! ```ignore
//! use gpu_race::providers::latitude::Latitude;
//! use gpu_race::providers::{OfferFilter, OfferSearch};
//!
//! let provider = Latitude::new(api_key, project_id)?;
//! let offers = provider.search(&OfferFilter::default(), &[]).await?;
//! ```

mod client;
mod models;

pub use client::{Latitude, PROVIDER_ID};
pub use models::*;
