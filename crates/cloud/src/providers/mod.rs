//! Provider abstraction and built-in providers.
//!
//! Every infrastructure (local kind, the managed clouds, adopted clusters)
//! implements [`Provider`]. Callers obtain instances through the
//! [`registry`] by name and never depend on a concrete type.

pub mod addons;
pub mod aws;
pub mod azure;
pub mod civo;
pub mod custom;
pub mod digitalocean;
pub mod gcp;
pub mod health;
pub(crate) mod http;
pub mod kind;
pub mod pricing;
pub mod registry;
mod traits;
pub mod types;

pub use registry::{ProviderConfig, ProviderRegistry, DEFAULT_PROVIDER};
pub use traits::{ensure_spec_for, NoQuotaCheck, Provider, ProviderError, QuotaChecker};
pub use types::*;
