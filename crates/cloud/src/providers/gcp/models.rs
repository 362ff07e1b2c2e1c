//! GKE API request and response models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Responses
// ============================================================================

/// GKE cluster information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GkeCluster {
    /// Cluster name.
    pub name: String,
    /// Cluster self link.
    pub self_link: Option<String>,
    /// Zone/region.
    pub location: String,
    /// Cluster status.
    pub status: String,
    /// Status detail.
    pub status_message: Option<String>,
    /// Kubernetes master version.
    pub current_master_version: Option<String>,
    /// API server endpoint (bare IP).
    pub endpoint: Option<String>,
    /// Master credentials.
    pub master_auth: Option<MasterAuth>,
    /// Node pools.
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
    /// Create time.
    pub create_time: Option<String>,
    /// Labels.
    #[serde(default)]
    pub resource_labels: BTreeMap<String, String>,
    /// Fingerprint required to change labels.
    pub label_fingerprint: Option<String>,
}

/// Cluster CA.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterAuth {
    /// Base64 PEM of the cluster CA.
    pub cluster_ca_certificate: Option<String>,
}

/// GKE node pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Node pool name.
    pub name: String,
    /// Node pool status.
    pub status: Option<String>,
    /// Node config.
    pub config: Option<NodeConfig>,
    /// Initial node count.
    pub initial_node_count: Option<u32>,
    /// Autoscaling config.
    pub autoscaling: Option<NodePoolAutoscaling>,
}

/// Node configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Machine type.
    pub machine_type: String,
}

/// Node pool autoscaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolAutoscaling {
    /// Enabled.
    pub enabled: bool,
    /// Min node count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_node_count: Option<u32>,
    /// Max node count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_node_count: Option<u32>,
}

/// Cluster list response.
#[derive(Debug, Deserialize)]
pub struct ClusterListResponse {
    /// Clusters.
    #[serde(default)]
    pub clusters: Vec<GkeCluster>,
}

/// Node pool list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolListResponse {
    /// Node pools.
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
}

// ============================================================================
// Requests
// ============================================================================

/// Create cluster request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    /// Cluster definition.
    pub cluster: ClusterDefinition,
}

/// Cluster definition for creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDefinition {
    /// Cluster name.
    pub name: String,
    /// Initial Kubernetes version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_cluster_version: Option<String>,
    /// Network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Pod CIDR.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_ipv4_cidr: Option<String>,
    /// Node pools.
    pub node_pools: Vec<NodePoolDefinition>,
    /// Labels.
    pub resource_labels: BTreeMap<String, String>,
}

/// Node pool definition for creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolDefinition {
    /// Node pool name.
    pub name: String,
    /// Initial node count.
    pub initial_node_count: u32,
    /// Node config.
    pub config: NodeConfigDefinition,
    /// Autoscaling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<NodePoolAutoscaling>,
}

/// Node config for creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigDefinition {
    /// Machine type.
    pub machine_type: String,
    /// Disk size in GB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    /// Image type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    /// Node labels.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Node taints.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<NodeTaint>,
}

/// Node taint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTaint {
    /// Key.
    pub key: String,
    /// Value.
    pub value: String,
    /// Effect (`NO_SCHEDULE`, `PREFER_NO_SCHEDULE`, `NO_EXECUTE`).
    pub effect: String,
}

/// Create node pool request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodePoolRequest {
    /// Node pool.
    pub node_pool: NodePoolDefinition,
}

/// Resize request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetNodePoolSizeRequest {
    /// Node count.
    pub node_count: u32,
}

/// Cluster update request.
#[derive(Debug, Serialize)]
pub struct UpdateClusterRequest {
    /// Requested changes.
    pub update: ClusterUpdate,
}

/// Requested cluster changes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterUpdate {
    /// Target master version.
    pub desired_master_version: String,
}

/// Label update request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLabelsRequest {
    /// Labels.
    pub resource_labels: BTreeMap<String, String>,
    /// Current fingerprint.
    pub label_fingerprint: String,
}
