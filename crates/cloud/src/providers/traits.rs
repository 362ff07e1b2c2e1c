//! Provider trait and error type.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{
    Addon, AddonSpec, Cluster, ClusterHealth, ClusterMetrics, ClusterSpec, CostEstimate,
    Credentials, Investigation, LoadBalancer, LoadBalancerSpec, NodeGroup, NodeGroupSpec,
    QuotaReport, Volume, VolumeSpec, Vpc, VpcSpec,
};
use super::{addons, health};
use crate::command::ProcessRunner;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation is meaningless for this provider.
    #[error("{operation} is not supported by the {provider} provider")]
    NotSupported {
        provider: String,
        operation: &'static str,
    },

    /// No constructor registered under the name.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    /// Invalid configuration or request.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Subprocess exited unsuccessfully.
    #[error("{program} exited with {code:?}: {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Kubernetes API error.
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster store is unreadable or corrupt.
    #[error("Cluster store error: {0}")]
    Store(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Quota exceeded.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
}

impl ProviderError {
    /// Whether this is the distinguished "not found" kind.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Whether this is a "not supported" answer rather than a failure.
    #[must_use]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }

    pub(crate) fn not_supported(provider: &str, operation: &'static str) -> Self {
        Self::NotSupported {
            provider: provider.to_string(),
            operation,
        }
    }
}

/// Optional resource-quota capability.
///
/// Providers without a quota API use [`NoQuotaCheck`], which reports that
/// nothing was checked so callers can fall back to generic validation.
#[async_trait]
pub trait QuotaChecker: Send + Sync {
    /// Check whether the account has room for `spec`.
    async fn check_quotas(&self, spec: &ClusterSpec) -> Result<QuotaReport, ProviderError>;
}

/// Quota adapter for providers without a quota API.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuotaCheck;

#[async_trait]
impl QuotaChecker for NoQuotaCheck {
    async fn check_quotas(&self, _spec: &ClusterSpec) -> Result<QuotaReport, ProviderError> {
        Ok(QuotaReport::unchecked())
    }
}

/// Cluster lifecycle operations against one infrastructure.
///
/// The capability set is deliberately wide. Operations that make no sense
/// for an infrastructure fail with [`ProviderError::NotSupported`] through
/// the default methods, so callers never need to know the concrete type.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name of the provider (`kind`, `aws`, ...).
    fn name(&self) -> &str;

    /// Public API endpoint used by network pre-flight checks.
    fn api_endpoint(&self) -> Option<&str> {
        None
    }

    /// Quota capability.
    fn quotas(&self) -> &dyn QuotaChecker {
        &NoQuotaCheck
    }

    // ========================================================================
    // Account
    // ========================================================================

    /// Verify the credentials are accepted.
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ProviderError>;

    /// Verify the authenticated identity can manage clusters.
    async fn validate_permissions(&self) -> Result<(), ProviderError>;

    // ========================================================================
    // Clusters
    // ========================================================================

    /// Create a cluster. Rejects specs addressed to another provider.
    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError>;

    /// Delete a cluster. Fails with `NotFound` when it does not exist.
    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError>;

    /// Apply a changed spec to an existing cluster.
    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError>;

    /// Upgrade the control plane to `version`.
    async fn upgrade_cluster(&self, id: &str, version: &str) -> Result<Cluster, ProviderError> {
        let _ = (id, version);
        Err(ProviderError::not_supported(self.name(), "upgrade_cluster"))
    }

    /// Get a cluster. Fails with `NotFound` when it does not exist.
    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError>;

    /// List clusters.
    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError>;

    /// Raw kubeconfig document for a cluster.
    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError>;

    // ========================================================================
    // Node groups
    // ========================================================================

    /// Add a node group.
    async fn add_node_group(
        &self,
        cluster_id: &str,
        spec: &NodeGroupSpec,
    ) -> Result<NodeGroup, ProviderError> {
        let _ = (cluster_id, spec);
        Err(ProviderError::not_supported(self.name(), "add_node_group"))
    }

    /// Remove a node group.
    async fn remove_node_group(&self, cluster_id: &str, name: &str) -> Result<(), ProviderError> {
        let _ = (cluster_id, name);
        Err(ProviderError::not_supported(self.name(), "remove_node_group"))
    }

    /// Resize a node group.
    async fn scale_node_group(
        &self,
        cluster_id: &str,
        name: &str,
        replicas: u32,
    ) -> Result<NodeGroup, ProviderError> {
        let _ = (cluster_id, name, replicas);
        Err(ProviderError::not_supported(self.name(), "scale_node_group"))
    }

    /// Get a node group.
    async fn get_node_group(&self, cluster_id: &str, name: &str) -> Result<NodeGroup, ProviderError> {
        self.list_node_groups(cluster_id)
            .await?
            .into_iter()
            .find(|g| g.name == name)
            .ok_or_else(|| ProviderError::NotFound(format!("node group {name} in {cluster_id}")))
    }

    /// List node groups.
    async fn list_node_groups(&self, cluster_id: &str) -> Result<Vec<NodeGroup>, ProviderError> {
        let _ = cluster_id;
        Err(ProviderError::not_supported(self.name(), "list_node_groups"))
    }

    // ========================================================================
    // Networking and storage
    // ========================================================================

    /// Create a VPC.
    async fn create_vpc(&self, spec: &VpcSpec) -> Result<Vpc, ProviderError> {
        let _ = spec;
        Err(ProviderError::not_supported(self.name(), "create_vpc"))
    }

    /// Delete a VPC.
    async fn delete_vpc(&self, id: &str) -> Result<(), ProviderError> {
        let _ = id;
        Err(ProviderError::not_supported(self.name(), "delete_vpc"))
    }

    /// List VPCs.
    async fn list_vpcs(&self) -> Result<Vec<Vpc>, ProviderError> {
        Err(ProviderError::not_supported(self.name(), "list_vpcs"))
    }

    /// Create a load balancer.
    async fn create_load_balancer(
        &self,
        spec: &LoadBalancerSpec,
    ) -> Result<LoadBalancer, ProviderError> {
        let _ = spec;
        Err(ProviderError::not_supported(self.name(), "create_load_balancer"))
    }

    /// Delete a load balancer.
    async fn delete_load_balancer(&self, id: &str) -> Result<(), ProviderError> {
        let _ = id;
        Err(ProviderError::not_supported(self.name(), "delete_load_balancer"))
    }

    /// List load balancers.
    async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>, ProviderError> {
        Err(ProviderError::not_supported(self.name(), "list_load_balancers"))
    }

    /// Create a block storage volume.
    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume, ProviderError> {
        let _ = spec;
        Err(ProviderError::not_supported(self.name(), "create_volume"))
    }

    /// Delete a block storage volume.
    async fn delete_volume(&self, id: &str) -> Result<(), ProviderError> {
        let _ = id;
        Err(ProviderError::not_supported(self.name(), "delete_volume"))
    }

    /// List block storage volumes.
    async fn list_volumes(&self) -> Result<Vec<Volume>, ProviderError> {
        Err(ProviderError::not_supported(self.name(), "list_volumes"))
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Node and system-component health, read through the Kubernetes API.
    async fn get_cluster_health(&self, id: &str) -> Result<ClusterHealth, ProviderError> {
        let kubeconfig = self.get_kubeconfig(id).await?;
        health::cluster_health(&kubeconfig).await
    }

    /// Capacity and object counts, read through the Kubernetes API.
    async fn get_cluster_metrics(&self, id: &str) -> Result<ClusterMetrics, ProviderError> {
        let kubeconfig = self.get_kubeconfig(id).await?;
        health::cluster_metrics(&kubeconfig).await
    }

    /// Best-effort diagnostics.
    async fn investigate_cluster(&self, id: &str) -> Result<Investigation, ProviderError> {
        let _ = id;
        Err(ProviderError::not_supported(self.name(), "investigate_cluster"))
    }

    // ========================================================================
    // Addons
    // ========================================================================

    /// Install an addon with helm.
    async fn install_addon(&self, cluster_id: &str, addon: &AddonSpec) -> Result<(), ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::install(&ProcessRunner, &kubeconfig, addon).await
    }

    /// Uninstall an addon with helm.
    async fn uninstall_addon(
        &self,
        cluster_id: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::uninstall(&ProcessRunner, &kubeconfig, name, namespace).await
    }

    /// List helm releases.
    async fn list_addons(&self, cluster_id: &str) -> Result<Vec<Addon>, ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::list(&ProcessRunner, &kubeconfig).await
    }

    // ========================================================================
    // Cost
    // ========================================================================

    /// Estimate the running cost of `spec`.
    async fn estimate_cost(&self, spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        let _ = spec;
        Err(ProviderError::not_supported(self.name(), "estimate_cost"))
    }
}

/// Reject specs addressed to another provider.
///
/// # Errors
///
/// Returns [`ProviderError::Config`] on mismatch or a missing name.
pub fn ensure_spec_for(provider: &str, spec: &ClusterSpec) -> Result<(), ProviderError> {
    if spec.provider != provider {
        return Err(ProviderError::Config(format!(
            "cluster spec targets provider '{}' but was sent to '{provider}'",
            spec.provider
        )));
    }
    if spec.name.trim().is_empty() {
        return Err(ProviderError::Config("cluster name is required".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_spec_for_rejects_mismatch() {
        let spec = ClusterSpec::new("aws", "prod");
        assert!(ensure_spec_for("aws", &spec).is_ok());
        let err = ensure_spec_for("gcp", &spec).unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn test_not_found_kind() {
        assert!(ProviderError::NotFound("x".into()).is_not_found());
        assert!(!ProviderError::Timeout(3).is_not_found());
        assert!(ProviderError::not_supported("kind", "create_vpc").is_not_supported());
    }
}
