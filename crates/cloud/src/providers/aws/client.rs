//! EKS provider implementation over `eksctl` and the `aws` CLI.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::models::{
    CallerIdentity, ClusterConfig, ClusterMetadata, DescribeClusterResponse, EksCluster,
    EksctlNodeGroup, ListClustersResponse, ManagedNodeGroup, NodeTaint, VpcRef,
};
use crate::command::{CommandRunner, CommandSpec, ProcessRunner};
use crate::providers::pricing;
use crate::providers::registry::{config_string, ProviderConfig};
use crate::providers::traits::{ensure_spec_for, Provider, ProviderError};
use crate::providers::types::{
    cluster_id, parse_cluster_id, Cluster, ClusterSpec, ClusterStatus, CostEstimate, Credentials,
    NodeGroup, NodeGroupSpec, MANAGED_BY_TAG, NATIVE_ID_KEY,
};

/// Registry name.
pub const PROVIDER_NAME: &str = "aws";

const DEFAULT_REGION: &str = "us-east-1";

/// AWS provider.
#[derive(Clone)]
pub struct Aws {
    runner: Arc<dyn CommandRunner>,
    /// AWS region.
    region: String,
    /// Named CLI profile.
    profile: Option<String>,
}

impl Aws {
    /// Create a new AWS provider.
    pub fn new(runner: Arc<dyn CommandRunner>, region: impl Into<String>) -> Self {
        Self {
            runner,
            region: region.into(),
            profile: None,
        }
    }

    /// Use a named CLI profile.
    #[must_use]
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Build from registry configuration.
    ///
    /// Recognised keys: `region`, `profile`.
    ///
    /// # Errors
    /// Never fails today; the signature matches every other constructor.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let region = config_string(config, "region").unwrap_or_else(|| DEFAULT_REGION.to_string());
        let mut provider = Self::new(Arc::new(ProcessRunner), region);
        provider.profile = config_string(config, "profile");
        Ok(provider)
    }

    fn bare_name(id: &str) -> Result<&str, ProviderError> {
        parse_cluster_id(PROVIDER_NAME, id)
            .ok_or_else(|| ProviderError::NotFound(format!("{id} is not an aws cluster id")))
    }

    fn command(&self, program: &str) -> CommandSpec {
        let spec = CommandSpec::new(program);
        match &self.profile {
            Some(profile) => spec.env("AWS_PROFILE", profile),
            None => spec,
        }
    }

    fn aws(&self) -> CommandSpec {
        self.command("aws")
    }

    fn eksctl(&self) -> CommandSpec {
        self.command("eksctl")
    }

    /// Run and map AWS error codes onto provider errors.
    async fn run(&self, spec: &CommandSpec) -> Result<String, ProviderError> {
        let output = self.runner.run(spec).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        let stderr = output.stderr.trim().to_string();
        Err(
            if stderr.contains("ResourceNotFoundException") || stderr.contains("No cluster found") {
                ProviderError::NotFound(stderr)
            } else if stderr.contains("ExpiredToken")
                || stderr.contains("InvalidClientTokenId")
                || stderr.contains("Unable to locate credentials")
                || stderr.contains("AccessDenied")
            {
                ProviderError::Auth(stderr)
            } else {
                ProviderError::Command {
                    program: spec.program.clone(),
                    code: output.code,
                    stderr,
                }
            },
        )
    }

    async fn describe(&self, name: &str) -> Result<EksCluster, ProviderError> {
        let stdout = self
            .run(&self.aws().args([
                "eks",
                "describe-cluster",
                "--name",
                name,
                "--region",
                &self.region,
                "--output",
                "json",
            ]))
            .await?;
        let response: DescribeClusterResponse = serde_json::from_str(&stdout)?;
        Ok(response.cluster)
    }

    /// Render the eksctl `ClusterConfig` for `spec`.
    fn cluster_config(&self, spec: &ClusterSpec) -> ClusterConfig {
        let mut tags = spec.tags.clone();
        tags.insert(MANAGED_BY_TAG.to_string(), "adhar".to_string());
        ClusterConfig {
            api_version: "eksctl.io/v1alpha5",
            kind: "ClusterConfig",
            metadata: ClusterMetadata {
                name: spec.name.clone(),
                region: if spec.region.is_empty() {
                    self.region.clone()
                } else {
                    spec.region.clone()
                },
                version: (!spec.version.is_empty()).then(|| spec.version.clone()),
                tags,
            },
            vpc: spec.networking.vpc_id.clone().map(|id| VpcRef { id }),
            managed_node_groups: spec.node_groups.iter().map(Self::node_group).collect(),
        }
    }

    fn node_group(spec: &NodeGroupSpec) -> ManagedNodeGroup {
        ManagedNodeGroup {
            name: spec.name.clone(),
            instance_type: if spec.instance_type.is_empty() {
                pricing::AWS.default_instance.to_string()
            } else {
                spec.instance_type.clone()
            },
            desired_capacity: spec.replicas,
            min_size: spec.min_size,
            max_size: spec.max_size,
            labels: spec.labels.clone(),
            taints: spec
                .taints
                .iter()
                .map(|t| NodeTaint {
                    key: t.key.clone(),
                    value: t.value.clone(),
                    effect: t.effect.clone(),
                })
                .collect(),
        }
    }

    /// Convert EKS cluster to our type.
    fn to_cluster(cluster: &EksCluster) -> Cluster {
        let status = match cluster.status.as_str() {
            "CREATING" | "PENDING" => ClusterStatus::Creating,
            "ACTIVE" => ClusterStatus::Running,
            "UPDATING" => ClusterStatus::Updating,
            "DELETING" => ClusterStatus::Deleting,
            "FAILED" => ClusterStatus::Error,
            _ => ClusterStatus::Unknown,
        };

        // Extract region from ARN
        let region = cluster.arn.split(':').nth(3).unwrap_or("unknown").to_string();
        let created_at = cluster
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc));

        Cluster {
            id: cluster_id(PROVIDER_NAME, &cluster.name),
            name: cluster.name.clone(),
            provider: PROVIDER_NAME.to_string(),
            region,
            version: cluster.version.clone(),
            status,
            endpoint: cluster.endpoint.clone(),
            created_at,
            updated_at: Utc::now(),
            tags: cluster.tags.clone(),
            metadata: [(NATIVE_ID_KEY.to_string(), cluster.arn.clone().into())].into(),
        }
    }

    fn to_node_group(cluster_id: &str, group: &EksctlNodeGroup) -> NodeGroup {
        NodeGroup {
            name: group.name.clone(),
            cluster_id: cluster_id.to_string(),
            instance_type: group.instance_type.clone(),
            replicas: group.desired_capacity,
            min_size: group.min_size,
            max_size: group.max_size,
            status: group.status.to_lowercase(),
        }
    }

    /// Kubeconfig authenticating through `aws eks get-token`.
    fn render_kubeconfig(&self, cluster: &EksCluster) -> Result<String, ProviderError> {
        let endpoint = cluster
            .endpoint
            .as_deref()
            .ok_or_else(|| ProviderError::Config("Cluster endpoint not available".to_string()))?;
        let ca = cluster
            .certificate_authority
            .as_ref()
            .and_then(|c| c.data.as_deref())
            .unwrap_or_default();
        let name = &cluster.name;
        let region = &self.region;
        let profile_env = self.profile.as_ref().map_or_else(String::new, |p| {
            format!("      env:\n      - name: AWS_PROFILE\n        value: {p}\n")
        });

        Ok(format!(
            r"apiVersion: v1
kind: Config
clusters:
- cluster:
    server: {endpoint}
    certificate-authority-data: {ca}
  name: {name}
contexts:
- context:
    cluster: {name}
    user: {name}
  name: {name}
current-context: {name}
users:
- name: {name}
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: aws
      args:
        - eks
        - get-token
        - --cluster-name
        - {name}
        - --region
        - {region}
{profile_env}"
        ))
    }

    async fn nodegroups(&self, cluster: &str) -> Result<Vec<EksctlNodeGroup>, ProviderError> {
        let stdout = self
            .run(&self.eksctl().args([
                "get",
                "nodegroup",
                "--cluster",
                cluster,
                "--region",
                &self.region,
                "--output",
                "json",
            ]))
            .await?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&stdout)?)
    }
}

#[async_trait]
impl Provider for Aws {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ProviderError> {
        let mut spec = self.aws().args(["sts", "get-caller-identity", "--output", "json"]);
        for (key, var) in [
            ("accessKeyId", "AWS_ACCESS_KEY_ID"),
            ("secretAccessKey", "AWS_SECRET_ACCESS_KEY"),
            ("sessionToken", "AWS_SESSION_TOKEN"),
        ] {
            if let Some(value) = credentials.get(key) {
                spec = spec.env(var, value);
            }
        }
        let stdout = self.run(&spec).await?;
        let identity: CallerIdentity = serde_json::from_str(&stdout)?;
        debug!(account = %identity.account, arn = %identity.arn, "Authenticated with AWS");
        Ok(())
    }

    async fn validate_permissions(&self) -> Result<(), ProviderError> {
        self.run(&self.aws().args([
            "eks",
            "list-clusters",
            "--region",
            &self.region,
            "--output",
            "json",
        ]))
        .await?;
        Ok(())
    }

    // ========================================================================
    // EKS
    // ========================================================================

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        info!(name = %spec.name, region = %self.region, "Creating EKS cluster");

        let config = serde_yaml::to_string(&self.cluster_config(spec))?;
        self.run(&self.eksctl().args(["create", "cluster", "-f", "-"]).stdin(config))
            .await?;

        info!(name = %spec.name, "EKS cluster created");
        Ok(Self::to_cluster(&self.describe(&spec.name).await?))
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError> {
        let name = Self::bare_name(id)?;
        // Surface NotFound before eksctl reports it as a generic failure
        self.describe(name).await?;
        info!(cluster_name = %name, "Deleting EKS cluster");
        self.run(&self.eksctl().args([
            "delete",
            "cluster",
            "--name",
            name,
            "--region",
            &self.region,
            "--wait",
        ]))
        .await?;
        Ok(())
    }

    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        let cluster = self.describe(Self::bare_name(id)?).await?;
        if !spec.tags.is_empty() {
            let tags = spec
                .tags
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            self.run(&self.aws().args([
                "eks",
                "tag-resource",
                "--resource-arn",
                &cluster.arn,
                "--tags",
                &tags,
                "--region",
                &self.region,
            ]))
            .await?;
        }
        Ok(Self::to_cluster(&self.describe(&cluster.name).await?))
    }

    async fn upgrade_cluster(&self, id: &str, version: &str) -> Result<Cluster, ProviderError> {
        let name = Self::bare_name(id)?;
        info!(cluster_name = %name, version, "Upgrading EKS control plane");
        self.run(&self.eksctl().args([
            "upgrade",
            "cluster",
            "--name",
            name,
            "--region",
            &self.region,
            "--version",
            version,
            "--approve",
        ]))
        .await?;
        Ok(Self::to_cluster(&self.describe(name).await?))
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError> {
        Ok(Self::to_cluster(&self.describe(Self::bare_name(id)?).await?))
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError> {
        let stdout = self
            .run(&self.aws().args([
                "eks",
                "list-clusters",
                "--region",
                &self.region,
                "--output",
                "json",
            ]))
            .await?;
        let response: ListClustersResponse = serde_json::from_str(&stdout)?;
        let mut clusters = Vec::with_capacity(response.clusters.len());
        for name in &response.clusters {
            clusters.push(Self::to_cluster(&self.describe(name).await?));
        }
        Ok(clusters)
    }

    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        let cluster = self.describe(Self::bare_name(id)?).await?;
        self.render_kubeconfig(&cluster)
    }

    // ========================================================================
    // Node groups
    // ========================================================================

    async fn add_node_group(
        &self,
        cluster_id: &str,
        spec: &NodeGroupSpec,
    ) -> Result<NodeGroup, ProviderError> {
        let cluster = Self::bare_name(cluster_id)?;
        let group = Self::node_group(spec);
        let mut command = self.eksctl().args([
            "create",
            "nodegroup",
            "--cluster",
            cluster,
            "--region",
            &self.region,
            "--name",
            &group.name,
            "--node-type",
            &group.instance_type,
            "--nodes",
            &group.desired_capacity.to_string(),
            "--managed",
        ]);
        if let Some(min) = group.min_size {
            command = command.args(["--nodes-min".to_string(), min.to_string()]);
        }
        if let Some(max) = group.max_size {
            command = command.args(["--nodes-max".to_string(), max.to_string()]);
        }
        self.run(&command).await?;
        self.get_node_group(cluster_id, &spec.name).await
    }

    async fn remove_node_group(&self, cluster_id: &str, name: &str) -> Result<(), ProviderError> {
        let cluster = Self::bare_name(cluster_id)?;
        self.get_node_group(cluster_id, name).await?;
        self.run(&self.eksctl().args([
            "delete",
            "nodegroup",
            "--cluster",
            cluster,
            "--region",
            &self.region,
            "--name",
            name,
            "--approve",
        ]))
        .await?;
        Ok(())
    }

    async fn scale_node_group(
        &self,
        cluster_id: &str,
        name: &str,
        replicas: u32,
    ) -> Result<NodeGroup, ProviderError> {
        let cluster = Self::bare_name(cluster_id)?;
        let mut group = self.get_node_group(cluster_id, name).await?;
        self.run(&self.eksctl().args([
            "scale",
            "nodegroup",
            "--cluster",
            cluster,
            "--region",
            &self.region,
            "--name",
            name,
            "--nodes",
            &replicas.to_string(),
        ]))
        .await?;
        group.replicas = replicas;
        Ok(group)
    }

    async fn list_node_groups(&self, cluster_id: &str) -> Result<Vec<NodeGroup>, ProviderError> {
        let cluster = Self::bare_name(cluster_id)?;
        Ok(self
            .nodegroups(cluster)
            .await?
            .iter()
            .map(|g| Self::to_node_group(cluster_id, g))
            .collect())
    }

    async fn estimate_cost(&self, spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        Ok(pricing::AWS.estimate(spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::testing::ScriptedRunner;

    const DESCRIBE: &str = r#"{"cluster": {
        "name": "prod",
        "arn": "arn:aws:eks:eu-west-1:123456789012:cluster/prod",
        "version": "1.31",
        "status": "ACTIVE",
        "endpoint": "https://ABC.gr7.eu-west-1.eks.amazonaws.com",
        "certificateAuthority": {"data": "Q0E="},
        "createdAt": "2025-01-02T03:04:05.000000+00:00",
        "tags": {"adhar.io/managed-by": "adhar"}
    }}"#;

    fn provider(runner: &ScriptedRunner) -> Aws {
        Aws::new(Arc::new(runner.clone()), "eu-west-1")
    }

    #[tokio::test]
    async fn test_create_pipes_cluster_config_to_eksctl() {
        let runner = ScriptedRunner::new();
        runner.respond("eksctl create cluster", CommandOutput::ok(""));
        runner.respond("aws eks describe-cluster", CommandOutput::ok(DESCRIBE));

        let cluster = provider(&runner)
            .create_cluster(&ClusterSpec::new(PROVIDER_NAME, "prod"))
            .await
            .unwrap();
        assert_eq!(cluster.id, "aws-prod");
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert_eq!(cluster.region, "eu-west-1");
        assert_eq!(
            cluster.native_id(),
            Some("arn:aws:eks:eu-west-1:123456789012:cluster/prod")
        );

        let create = runner
            .calls()
            .into_iter()
            .find(|c| c.program == "eksctl")
            .unwrap();
        let config: serde_yaml::Value = serde_yaml::from_str(create.stdin.as_deref().unwrap()).unwrap();
        assert_eq!(config["kind"], "ClusterConfig");
        assert_eq!(config["metadata"]["region"], "eu-west-1");
        assert_eq!(config["metadata"]["tags"][MANAGED_BY_TAG], "adhar");
        assert_eq!(config["managedNodeGroups"][0]["instanceType"], "m5.large");
    }

    #[tokio::test]
    async fn test_missing_cluster_maps_to_not_found() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "aws eks describe-cluster",
            CommandOutput::failed(
                254,
                "An error occurred (ResourceNotFoundException) when calling the DescribeCluster operation",
            ),
        );

        let provider = provider(&runner);
        assert!(provider.get_cluster("aws-ghost").await.unwrap_err().is_not_found());
        assert!(provider.delete_cluster("aws-ghost").await.unwrap_err().is_not_found());
        assert!(!runner.was_called("eksctl delete"));
    }

    #[tokio::test]
    async fn test_kubeconfig_uses_get_token() {
        let runner = ScriptedRunner::new();
        runner.respond("aws eks describe-cluster", CommandOutput::ok(DESCRIBE));

        let kubeconfig = provider(&runner)
            .with_profile("platform")
            .get_kubeconfig("aws-prod")
            .await
            .unwrap();
        assert!(kubeconfig.contains("server: https://ABC.gr7.eu-west-1.eks.amazonaws.com"));
        assert!(kubeconfig.contains("- get-token"));
        assert!(kubeconfig.contains("value: platform"));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&kubeconfig).unwrap();
        assert_eq!(parsed["current-context"], "prod");
    }

    #[tokio::test]
    async fn test_scale_node_group() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "eksctl get nodegroup",
            CommandOutput::ok(
                r#"[{"Name": "default", "Status": "ACTIVE", "InstanceType": "m5.large",
                     "DesiredCapacity": 2, "MinSize": 1, "MaxSize": 4}]"#,
            ),
        );
        runner.respond("eksctl scale nodegroup", CommandOutput::ok(""));

        let group = provider(&runner)
            .scale_node_group("aws-prod", "default", 3)
            .await
            .unwrap();
        assert_eq!(group.replicas, 3);
        assert_eq!(group.max_size, Some(4));
        assert!(runner.was_called(
            "eksctl scale nodegroup --cluster prod --region eu-west-1 --name default --nodes 3"
        ));
    }
}
