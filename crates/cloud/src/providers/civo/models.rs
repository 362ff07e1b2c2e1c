//! Civo API request and response models.

use serde::{Deserialize, Serialize};

/// Civo Kubernetes cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct CivoCluster {
    /// Cluster id.
    pub id: String,
    /// Cluster name.
    pub name: String,
    /// Status (`ACTIVE`, `BUILDING`, ...).
    #[serde(default)]
    pub status: String,
    /// Whether the cluster is ready.
    #[serde(default)]
    pub ready: bool,
    /// Kubernetes version.
    #[serde(default)]
    pub kubernetes_version: String,
    /// API server endpoint.
    #[serde(default)]
    pub api_endpoint: Option<String>,
    /// Raw kubeconfig, present once the cluster is ready.
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Node pools.
    #[serde(default)]
    pub pools: Vec<CivoPool>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Create time.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Node pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CivoPool {
    /// Pool id (user-chosen).
    pub id: String,
    /// Instance size.
    pub size: String,
    /// Node count.
    pub count: u32,
}

/// Paged cluster list.
#[derive(Debug, Deserialize)]
pub struct ClusterListResponse {
    /// Clusters.
    #[serde(default)]
    pub items: Vec<CivoCluster>,
}

/// Create cluster request.
#[derive(Debug, Serialize)]
pub struct CreateClusterRequest {
    /// Cluster name.
    pub name: String,
    /// Region code.
    pub region: String,
    /// Node pools.
    pub pools: Vec<CivoPool>,
    /// Kubernetes version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// CNI plugin (`cilium` or `flannel`).
    pub cni_plugin: String,
    /// Network to deploy into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    /// Space-separated tags.
    pub tags: String,
}

/// Cluster update request.
#[derive(Debug, Serialize)]
pub struct UpdateClusterRequest {
    /// Region code.
    pub region: String,
    /// Kubernetes version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Replacement tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

/// Pool resize request.
#[derive(Debug, Serialize)]
pub struct UpdatePoolRequest {
    /// Region code.
    pub region: String,
    /// Node count.
    pub count: u32,
}

/// Account quota.
#[derive(Debug, Deserialize)]
pub struct Quota {
    /// Instance limit.
    pub instance_count_limit: u64,
    /// Instances in use.
    pub instance_count_usage: u64,
    /// CPU core limit.
    #[serde(default)]
    pub cpu_core_limit: u64,
    /// CPU cores in use.
    #[serde(default)]
    pub cpu_core_usage: u64,
}

/// Private network.
#[derive(Debug, Clone, Deserialize)]
pub struct CivoNetwork {
    /// Network id.
    pub id: String,
    /// Label.
    #[serde(default)]
    pub label: String,
    /// Region code.
    #[serde(default)]
    pub region: String,
    /// IPv4 CIDR.
    #[serde(default)]
    pub cidr: String,
}

/// Network create request.
#[derive(Debug, Serialize)]
pub struct CreateNetworkRequest {
    /// Label.
    pub label: String,
    /// Region code.
    pub region: String,
    /// IPv4 CIDR.
    pub cidr_v4: String,
}

/// Volume.
#[derive(Debug, Clone, Deserialize)]
pub struct CivoVolume {
    /// Volume id.
    pub id: String,
    /// Name.
    pub name: String,
    /// Size in GiB.
    #[serde(default, alias = "size_gb")]
    pub size_gigabytes: u32,
}

/// Volume create request.
#[derive(Debug, Serialize)]
pub struct CreateVolumeRequest {
    /// Name.
    pub name: String,
    /// Size in GiB.
    pub size_gb: u32,
    /// Region code.
    pub region: String,
}

/// Generic `{"id": ..., "result": ...}` acknowledgement.
#[derive(Debug, Deserialize)]
pub struct Ack {
    /// Created resource id.
    #[serde(default)]
    pub id: String,
}
