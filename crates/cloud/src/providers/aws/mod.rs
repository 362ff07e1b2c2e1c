//! AWS (Amazon Web Services) provider.
//!
//! EKS clusters are driven through `eksctl` for lifecycle changes and the
//! `aws` CLI for reads, so authentication follows the standard AWS
//! credential chain (profiles, env vars, SSO).
//!
//! ## Recommended Instance Types
//!
//! - **m5.large**: 2 vCPU, 8GB RAM - ~$70/mo
//! - **m5.xlarge**: 4 vCPU, 16GB RAM - ~$140/mo
//! - **c5.xlarge**: 4 vCPU, 8GB RAM (compute-optimized) - ~$124/mo

mod client;
mod models;

pub use client::{Aws, PROVIDER_NAME};
