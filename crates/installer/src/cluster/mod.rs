//! Operations the installer performs against a running cluster.
//!
//! [`PlatformCluster`] is the seam between the bootstrap logic and the
//! Kubernetes API plus `kubectl`/`helm`. [`KubeCluster`] is the real
//! implementation; tests use an in-memory fake.

mod kube_cluster;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use adhar_cloud::command::CommandRunner;
use adhar_cloud::providers::AddonSpec;
use anyhow::Result;
use async_trait::async_trait;

pub use kube_cluster::KubeCluster;
use crate::crd::{AdharPlatform, AdharPlatformStatus};

/// Sync and health of one GitOps Application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    /// Application name.
    pub name: String,
    /// Sync status (Synced, OutOfSync, Unknown).
    pub sync_status: String,
    /// Health status (Healthy, Degraded, Progressing, Missing, Unknown).
    pub health_status: String,
    /// Optional status message.
    pub message: Option<String>,
}

impl AppStatus {
    /// Whether the application reports `Synced`.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.sync_status == "Synced"
    }

    /// Whether the application reports `Healthy`.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.health_status == "Healthy"
    }
}

/// Cluster operations used by the bootstrap sequencer and pipelines.
///
/// Readiness queries return `Ok(false)` for "not yet" and reserve errors
/// for API failures, so pollers can tell the two apart.
#[async_trait]
pub trait PlatformCluster: Send + Sync {
    /// Path of the kubeconfig used for subprocesses.
    fn kubeconfig_path(&self) -> &Path;

    /// `kubectl apply` a (possibly multi-document) manifest.
    async fn apply_manifest(&self, manifest: &str) -> Result<()>;

    /// Whether a namespace exists.
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Create a namespace if missing. Returns whether it was created.
    async fn ensure_namespace(&self, name: &str) -> Result<bool>;

    /// Whether a Deployment reports the `Available` condition.
    async fn deployment_available(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Whether a DaemonSet has every scheduled pod ready.
    async fn daemonset_ready(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Whether at least one pod matches `selector` and all matching pods
    /// are ready.
    async fn pods_ready(&self, namespace: &str, selector: &str) -> Result<bool>;

    /// Whether a Service has at least one ready endpoint address.
    async fn service_has_endpoints(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Run `command` inside `target` (e.g. `deploy/gitea`) and return stdout.
    async fn exec(&self, namespace: &str, target: &str, command: &[&str]) -> Result<String>;

    /// Install or upgrade a helm release.
    async fn helm_install(&self, addon: &AddonSpec) -> Result<()>;

    /// Server-side apply the `AdharPlatform` CRD.
    async fn install_platform_crd(&self) -> Result<()>;

    /// Whether the `AdharPlatform` CRD is established.
    async fn platform_crd_established(&self) -> Result<bool>;

    /// Create the platform object or merge its spec and annotations into
    /// the existing one.
    async fn upsert_platform(&self, platform: &AdharPlatform) -> Result<()>;

    /// Read the platform object.
    async fn platform(&self, namespace: &str, name: &str) -> Result<Option<AdharPlatform>>;

    /// Replace the platform object's status.
    async fn patch_platform_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AdharPlatformStatus,
    ) -> Result<()>;

    /// Status of an Argo CD Application.
    async fn application_status(&self, namespace: &str, name: &str) -> Result<Option<AppStatus>>;

    /// Decoded data of a Secret.
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    /// Data of a ConfigMap.
    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    /// `kubectl rollout restart` a Deployment.
    async fn rollout_restart(&self, namespace: &str, deployment: &str) -> Result<()>;
}

/// Opens a [`PlatformCluster`] for a kubeconfig written by a provider.
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the cluster described by the kubeconfig at `path`.
    async fn connect(&self, kubeconfig_path: &Path) -> Result<Arc<dyn PlatformCluster>>;
}

/// Connects through [`KubeCluster`].
pub struct KubeConnector {
    runner: Arc<dyn CommandRunner>,
}

impl KubeConnector {
    /// Connector whose clusters shell out through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, kubeconfig_path: &Path) -> Result<Arc<dyn PlatformCluster>> {
        let cluster = KubeCluster::connect(kubeconfig_path, Arc::clone(&self.runner)).await?;
        Ok(Arc::new(cluster))
    }
}
