//! DigitalOcean API request and response models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Kubernetes (DOKS)
// ============================================================================

/// DOKS cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct DoCluster {
    /// Cluster UUID.
    pub id: String,
    /// Cluster name.
    pub name: String,
    /// Region slug.
    pub region: String,
    /// Version slug (e.g. `1.31.1-do.4`).
    pub version: String,
    /// API server URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Cluster state.
    pub status: DoClusterStatus,
    /// Node pools.
    #[serde(default)]
    pub node_pools: Vec<DoNodePool>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Create time.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// DOKS cluster state.
#[derive(Debug, Clone, Deserialize)]
pub struct DoClusterStatus {
    /// State (`running`, `provisioning`, `degraded`, ...).
    pub state: String,
    /// Human-readable detail.
    #[serde(default)]
    pub message: Option<String>,
}

/// DOKS node pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoNodePool {
    /// Pool UUID (absent in requests).
    #[serde(default, skip_serializing)]
    pub id: String,
    /// Pool name.
    pub name: String,
    /// Droplet size slug.
    pub size: String,
    /// Node count.
    pub count: u32,
    /// Autoscaling enabled.
    #[serde(default)]
    pub auto_scale: bool,
    /// Autoscaling lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_nodes: Option<u32>,
    /// Autoscaling upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,
    /// Node labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Node taints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<DoTaint>,
}

/// Node taint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoTaint {
    /// Key.
    pub key: String,
    /// Value.
    #[serde(default)]
    pub value: String,
    /// Effect.
    pub effect: String,
}

/// Create cluster request.
#[derive(Debug, Serialize)]
pub struct CreateClusterRequest {
    /// Cluster name.
    pub name: String,
    /// Region slug.
    pub region: String,
    /// Version slug or `latest`.
    pub version: String,
    /// Node pools.
    pub node_pools: Vec<DoNodePool>,
    /// Tags.
    pub tags: Vec<String>,
    /// VPC to deploy into.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_uuid: Option<String>,
    /// Highly available control plane.
    pub ha: bool,
}

/// Cluster update request.
#[derive(Debug, Serialize)]
pub struct UpdateClusterRequest {
    /// Cluster name.
    pub name: String,
    /// Tags.
    pub tags: Vec<String>,
}

/// Upgrade request.
#[derive(Debug, Serialize)]
pub struct UpgradeRequest {
    /// Target version slug.
    pub version: String,
}

/// Node pool resize request.
#[derive(Debug, Serialize)]
pub struct UpdateNodePoolRequest {
    /// Pool name.
    pub name: String,
    /// Node count.
    pub count: u32,
}

/// `{"kubernetes_cluster": ...}` envelope.
#[derive(Debug, Deserialize)]
pub struct ClusterEnvelope {
    /// Cluster.
    pub kubernetes_cluster: DoCluster,
}

/// `{"kubernetes_clusters": [...]}` envelope.
#[derive(Debug, Deserialize)]
pub struct ClusterListResponse {
    /// Clusters.
    #[serde(default)]
    pub kubernetes_clusters: Vec<DoCluster>,
}

/// `{"node_pool": ...}` envelope.
#[derive(Debug, Deserialize)]
pub struct NodePoolEnvelope {
    /// Node pool.
    pub node_pool: DoNodePool,
}

/// `{"node_pools": [...]}` envelope.
#[derive(Debug, Deserialize)]
pub struct NodePoolListResponse {
    /// Node pools.
    #[serde(default)]
    pub node_pools: Vec<DoNodePool>,
}

// ============================================================================
// Account
// ============================================================================

/// `{"account": ...}` envelope.
#[derive(Debug, Deserialize)]
pub struct AccountEnvelope {
    /// Account.
    pub account: Account,
}

/// Account limits.
#[derive(Debug, Deserialize)]
pub struct Account {
    /// Maximum droplets.
    pub droplet_limit: u64,
    /// Account status.
    #[serde(default)]
    pub status: String,
}

/// Paged list metadata.
#[derive(Debug, Deserialize)]
pub struct ListMeta {
    /// Total objects.
    pub total: u64,
}

/// Response carrying only list metadata.
#[derive(Debug, Deserialize)]
pub struct CountResponse {
    /// Metadata.
    pub meta: ListMeta,
}

// ============================================================================
// Networking and storage
// ============================================================================

/// VPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoVpc {
    /// VPC UUID (absent in requests).
    #[serde(default, skip_serializing)]
    pub id: String,
    /// Name.
    pub name: String,
    /// Region slug.
    pub region: String,
    /// IP range.
    pub ip_range: String,
}

/// `{"vpc": ...}` envelope.
#[derive(Debug, Deserialize)]
pub struct VpcEnvelope {
    /// VPC.
    pub vpc: DoVpc,
}

/// `{"vpcs": [...]}` envelope.
#[derive(Debug, Deserialize)]
pub struct VpcListResponse {
    /// VPCs.
    #[serde(default)]
    pub vpcs: Vec<DoVpc>,
}

/// Block storage volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoVolume {
    /// Volume UUID (absent in requests).
    #[serde(default, skip_serializing)]
    pub id: String,
    /// Name.
    pub name: String,
    /// Region slug (requests only).
    #[serde(default, skip_deserializing)]
    pub region: String,
    /// Size in GiB.
    pub size_gigabytes: u32,
}

/// `{"volume": ...}` envelope.
#[derive(Debug, Deserialize)]
pub struct VolumeEnvelope {
    /// Volume.
    pub volume: DoVolume,
}

/// `{"volumes": [...]}` envelope.
#[derive(Debug, Deserialize)]
pub struct VolumeListResponse {
    /// Volumes.
    #[serde(default)]
    pub volumes: Vec<DoVolume>,
}

/// Load balancer forwarding rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingRule {
    /// Entry protocol.
    pub entry_protocol: String,
    /// Entry port.
    pub entry_port: u16,
    /// Target protocol.
    pub target_protocol: String,
    /// Target port.
    pub target_port: u16,
}

/// Load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoLoadBalancer {
    /// UUID (absent in requests).
    #[serde(default, skip_serializing)]
    pub id: String,
    /// Name.
    pub name: String,
    /// Region slug (requests only).
    #[serde(default, skip_deserializing)]
    pub region: String,
    /// Public IP.
    #[serde(default, skip_serializing)]
    pub ip: Option<String>,
    /// Forwarding rules.
    pub forwarding_rules: Vec<ForwardingRule>,
}

/// `{"load_balancer": ...}` envelope.
#[derive(Debug, Deserialize)]
pub struct LoadBalancerEnvelope {
    /// Load balancer.
    pub load_balancer: DoLoadBalancer,
}

/// `{"load_balancers": [...]}` envelope.
#[derive(Debug, Deserialize)]
pub struct LoadBalancerListResponse {
    /// Load balancers.
    #[serde(default)]
    pub load_balancers: Vec<DoLoadBalancer>,
}
