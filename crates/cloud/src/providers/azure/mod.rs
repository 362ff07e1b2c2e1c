//! Azure provider.
//!
//! ## Services
//!
//! - **AKS** (Azure Kubernetes Service) - managed Kubernetes with agent pools
//!
//! Clusters live in a single configured resource group and use a
//! system-assigned managed identity.
//!
//! ## Recommended VM Sizes
//!
//! - **Standard_D4s_v3**: 4 vCPU, 16GB RAM - ~$140/mo
//! - **Standard_D8s_v3**: 8 vCPU, 32GB RAM - ~$280/mo

mod client;
mod models;

pub use client::{Azure, DEFAULT_BASE_URL, PROVIDER_NAME};
