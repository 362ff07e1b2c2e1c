//! AKS API request and response models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Managed clusters
// ============================================================================

/// AKS cluster information.
#[derive(Debug, Clone, Deserialize)]
pub struct AksCluster {
    /// Resource ID.
    pub id: String,
    /// Cluster name.
    pub name: String,
    /// Location.
    pub location: String,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Properties.
    pub properties: AksClusterProperties,
}

/// AKS cluster properties.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AksClusterProperties {
    /// Provisioning state.
    pub provisioning_state: String,
    /// Kubernetes version.
    #[serde(default)]
    pub kubernetes_version: String,
    /// FQDN of the API server.
    pub fqdn: Option<String>,
    /// Agent pool profiles.
    #[serde(default)]
    pub agent_pool_profiles: Vec<AgentPoolProfile>,
}

/// Agent pool profile as embedded in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPoolProfile {
    /// Pool name.
    pub name: String,
    /// Node count.
    pub count: u32,
    /// VM size.
    pub vm_size: String,
    /// OS type.
    #[serde(default = "linux")]
    pub os_type: String,
    /// `System` or `User`.
    #[serde(default = "user_mode")]
    pub mode: String,
    /// Autoscaling enabled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enable_auto_scaling: bool,
    /// Autoscaling lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
    /// Autoscaling upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
    /// Node labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
    /// Node taints (`key=value:Effect`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_taints: Vec<String>,
    /// Provisioning state.
    #[serde(default, skip_serializing)]
    pub provisioning_state: Option<String>,
}

fn linux() -> String {
    "Linux".to_string()
}

fn user_mode() -> String {
    "User".to_string()
}

/// Create AKS cluster request.
#[derive(Debug, Serialize)]
pub struct CreateAksClusterRequest {
    /// Location.
    pub location: String,
    /// Tags.
    pub tags: BTreeMap<String, String>,
    /// Managed identity.
    pub identity: ManagedIdentity,
    /// Properties.
    pub properties: CreateAksClusterProperties,
}

/// Create AKS cluster properties.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAksClusterProperties {
    /// Kubernetes version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// DNS prefix.
    pub dns_prefix: String,
    /// Agent pool profiles.
    pub agent_pool_profiles: Vec<AgentPoolProfile>,
    /// Network profile.
    pub network_profile: NetworkProfile,
}

/// Network profile.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    /// Network plugin (`azure`, `kubenet`, `none`).
    pub network_plugin: String,
    /// Pod CIDR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
    /// Service CIDR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
}

/// Managed identity.
#[derive(Debug, Serialize)]
pub struct ManagedIdentity {
    /// Identity type.
    #[serde(rename = "type")]
    pub identity_type: String,
}

/// Tag update request.
#[derive(Debug, Serialize)]
pub struct TagsPatch {
    /// Replacement tags.
    pub tags: BTreeMap<String, String>,
}

/// AKS cluster list response.
#[derive(Debug, Deserialize)]
pub struct AksClusterListResponse {
    /// Clusters.
    #[serde(default)]
    pub value: Vec<AksCluster>,
}

// ============================================================================
// Agent pools
// ============================================================================

/// Standalone agent pool resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPool {
    /// Pool name.
    #[serde(default, skip_serializing)]
    pub name: String,
    /// Properties.
    pub properties: AgentPoolProperties,
}

/// Agent pool properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPoolProperties {
    /// Node count.
    pub count: u32,
    /// VM size.
    pub vm_size: String,
    /// OS type.
    #[serde(default = "linux")]
    pub os_type: String,
    /// `System` or `User`.
    #[serde(default = "user_mode")]
    pub mode: String,
    /// Autoscaling enabled.
    #[serde(default)]
    pub enable_auto_scaling: bool,
    /// Autoscaling lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
    /// Autoscaling upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
    /// Provisioning state.
    #[serde(default, skip_serializing)]
    pub provisioning_state: Option<String>,
}

/// Agent pool list response.
#[derive(Debug, Deserialize)]
pub struct AgentPoolListResponse {
    /// Pools.
    #[serde(default)]
    pub value: Vec<AgentPool>,
}

// ============================================================================
// Credentials
// ============================================================================

/// AKS credentials response.
#[derive(Debug, Deserialize)]
pub struct AksCredentials {
    /// Kubeconfig entries.
    #[serde(default)]
    pub kubeconfigs: Vec<KubeconfigEntry>,
}

/// Kubeconfig entry.
#[derive(Debug, Deserialize)]
pub struct KubeconfigEntry {
    /// Name.
    pub name: String,
    /// Base64-encoded kubeconfig.
    pub value: String,
}
