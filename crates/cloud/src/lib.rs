//! Kubernetes cluster providers for the Adhar platform.
//!
//! This crate owns everything that talks to infrastructure:
//!
//! - **Providers** - local kind clusters, DigitalOcean, Civo, GKE, AKS, EKS
//!   and adopted ("custom") clusters behind one [`Provider`] trait
//! - **Registry** - name-to-constructor lookup with cached instances
//! - **Cluster store** - the file-backed record of locally managed clusters
//! - **Commands** - the subprocess seam used for `kind`, `helm`, `eksctl`
//!
//! Providers return [`ProviderError`]; "not found" and "not supported" are
//! distinguished kinds so callers can branch on them.

pub mod command;
pub mod providers;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use providers::{
    Cluster, ClusterSpec, ClusterStatus, Provider, ProviderConfig, ProviderError, ProviderRegistry,
};
pub use store::{ClusterStore, FileClusterStore, MemoryClusterStore};
