//! Adhar platform provisioning library.
//!
//! Stands up an internal developer platform (Kubernetes, Argo CD, Gitea and
//! ingress) either on a local kind cluster or on the cloud providers of
//! [`adhar_cloud`], then hands control to GitOps.
//!
//! # Example
//!
//! ```ignore
//! use adhar_cli::config::PlatformConfig;
//! use adhar_cli::context::RunContext;
//! use adhar_cli::production::{ProductionOptions, ProviderManager};
//!
//! let config = PlatformConfig::load("platform.yaml".as_ref())?;
//! let manager = ProviderManager::new(config, registry, runner, connector, ProductionOptions::default());
//! let report = manager.run(Some("dev"), &RunContext::new(), &sink).await?;
//! println!("{}", report.summary());
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow async functions that don't use await
#![allow(clippy::unused_async)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod bootstrap;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod context;
pub mod crd;
pub mod kubeconfig;
pub mod local;
pub mod locator;
pub mod pipeline;
pub mod production;
pub mod readiness;
pub mod reconciler;
pub mod tls;
pub mod tools;
pub mod ui;

// Re-export commonly used types at the crate root
pub use config::{PlatformConfig, ResolvedEnvironment};
pub use context::{CancelReason, RunContext};
pub use local::{LocalOptions, LocalPipeline};
pub use pipeline::{Pipeline, PipelineError, PipelineReport};
pub use production::{ProductionOptions, ProviderManager};
