//! Civo provider.
//!
//! Civo Kubernetes (k3s-based) with node pools, private networks and
//! volumes. Every request is scoped to the configured region.

mod client;
mod models;

pub use client::{Civo, DEFAULT_BASE_URL, PROVIDER_NAME};
