//! EKS CLI output and eksctl configuration models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// `aws eks` output
// ============================================================================

/// EKS cluster information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EksCluster {
    /// Cluster name.
    pub name: String,
    /// Cluster ARN.
    pub arn: String,
    /// Kubernetes version.
    #[serde(default)]
    pub version: String,
    /// Cluster status.
    pub status: String,
    /// API server endpoint.
    pub endpoint: Option<String>,
    /// Cluster CA.
    pub certificate_authority: Option<CertificateAuthority>,
    /// Created at timestamp.
    pub created_at: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Cluster CA.
#[derive(Debug, Clone, Deserialize)]
pub struct CertificateAuthority {
    /// Base64 PEM.
    pub data: Option<String>,
}

/// `aws eks describe-cluster` output.
#[derive(Debug, Deserialize)]
pub struct DescribeClusterResponse {
    /// Cluster.
    pub cluster: EksCluster,
}

/// `aws eks list-clusters` output.
#[derive(Debug, Deserialize)]
pub struct ListClustersResponse {
    /// Cluster names.
    #[serde(default)]
    pub clusters: Vec<String>,
}

/// `aws sts get-caller-identity` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerIdentity {
    /// Account number.
    pub account: String,
    /// Caller ARN.
    pub arn: String,
}

/// Node group as printed by `eksctl get nodegroup -o json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EksctlNodeGroup {
    /// Node group name.
    pub name: String,
    /// Status.
    #[serde(default)]
    pub status: String,
    /// Instance type.
    #[serde(default)]
    pub instance_type: String,
    /// Desired size.
    #[serde(default)]
    pub desired_capacity: u32,
    /// Minimum size.
    pub min_size: Option<u32>,
    /// Maximum size.
    pub max_size: Option<u32>,
}

// ============================================================================
// eksctl ClusterConfig
// ============================================================================

/// eksctl `ClusterConfig` document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// `eksctl.io/v1alpha5`.
    pub api_version: &'static str,
    /// `ClusterConfig`.
    pub kind: &'static str,
    /// Name, region, version, tags.
    pub metadata: ClusterMetadata,
    /// Existing VPC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc: Option<VpcRef>,
    /// Managed node groups.
    pub managed_node_groups: Vec<ManagedNodeGroup>,
}

/// `metadata` block.
#[derive(Debug, Serialize)]
pub struct ClusterMetadata {
    /// Cluster name.
    pub name: String,
    /// Region.
    pub region: String,
    /// Kubernetes version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
}

/// `vpc` block.
#[derive(Debug, Serialize)]
pub struct VpcRef {
    /// VPC id.
    pub id: String,
}

/// Managed node group.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedNodeGroup {
    /// Name.
    pub name: String,
    /// Instance type.
    pub instance_type: String,
    /// Desired size.
    pub desired_capacity: u32,
    /// Minimum size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,
    /// Maximum size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    /// Node labels.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Node taints.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<NodeTaint>,
}

/// Node taint.
#[derive(Debug, Serialize)]
pub struct NodeTaint {
    /// Key.
    pub key: String,
    /// Value.
    pub value: String,
    /// Effect.
    pub effect: String,
}
