//! GCP (Google Cloud Platform) provider.
//!
//! ## Services
//!
//! - **GKE** (Google Kubernetes Engine) - managed Kubernetes with node pools
//!
//! Kubeconfigs authenticate through `gke-gcloud-auth-plugin`.
//!
//! ## Recommended Machine Types
//!
//! - **e2-standard-4**: 4 vCPU, 16GB RAM - ~$97/mo
//! - **e2-standard-8**: 8 vCPU, 32GB RAM - ~$195/mo
//! - **n2-standard-4**: 4 vCPU, 16GB RAM (Intel Ice Lake) - ~$117/mo

mod client;
mod models;

pub use client::{Gcp, DEFAULT_BASE_URL, PROVIDER_NAME};
