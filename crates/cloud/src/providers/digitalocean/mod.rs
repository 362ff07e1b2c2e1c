//! DigitalOcean provider.
//!
//! ## Services
//!
//! - **DOKS** - managed Kubernetes with node pools and in-place upgrades
//! - **VPC**, **Load Balancers**, **Volumes**
//!
//! Quotas are checked against the account droplet limit.

mod client;
mod models;

pub use client::{DigitalOcean, DEFAULT_BASE_URL, PROVIDER_NAME};
