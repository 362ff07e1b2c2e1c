//! Local kind provider.
//!
//! Clusters run as Docker containers on the developer's machine. kind has
//! no durable listing API with the metadata we need, so every cluster this
//! provider creates is recorded in a [`ClusterStore`], which is the source
//! of truth for "what local clusters exist".

mod config;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

pub use config::{render as render_config, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};

use crate::command::{run_checked, CommandRunner, CommandSpec, ProcessRunner};
use crate::providers::registry::{config_string, ProviderConfig};
use crate::providers::traits::{ensure_spec_for, Provider, ProviderError};
use crate::providers::types::{
    cluster_id, parse_cluster_id, Addon, AddonSpec, Cluster, ClusterSpec, ClusterStatus,
    CostEstimate, Credentials, Finding, Investigation, NodeGroup, Severity, KUBECONFIG_PATH_KEY,
};
use crate::providers::{addons, health};
use crate::store::{update_with, ClusterStore, FileClusterStore};

/// Registry name.
pub const PROVIDER_NAME: &str = "kind";

/// Upstream Cilium manifest applied when the `cilium` CLI is absent.
pub const CILIUM_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/cilium/cilium/v1.16.4/install/kubernetes/quick-install.yaml";

/// Local kind provider.
#[derive(Clone)]
pub struct Kind {
    runner: Arc<dyn CommandRunner>,
    store: Arc<dyn ClusterStore>,
    node_image: Option<String>,
    kubeconfig_dir: PathBuf,
}

impl Kind {
    /// Create a provider over an explicit runner and store.
    pub fn new(runner: Arc<dyn CommandRunner>, store: Arc<dyn ClusterStore>) -> Self {
        Self {
            runner,
            store,
            node_image: None,
            kubeconfig_dir: std::env::temp_dir().join("adhar").join("kubeconfigs"),
        }
    }

    /// Build from registry configuration.
    ///
    /// Recognised keys: `storePath`, `nodeImage`, `kubeconfigDir`.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature matches every other constructor.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let store = config_string(config, "storePath")
            .map_or_else(FileClusterStore::at_default_path, FileClusterStore::new);
        let mut provider = Self::new(Arc::new(ProcessRunner), Arc::new(store));
        provider.node_image = config_string(config, "nodeImage");
        if let Some(dir) = config_string(config, "kubeconfigDir") {
            provider.kubeconfig_dir = PathBuf::from(dir);
        }
        Ok(provider)
    }

    /// Use `image` for every node.
    #[must_use]
    pub fn with_node_image(mut self, image: impl Into<String>) -> Self {
        self.node_image = Some(image.into());
        self
    }

    /// Write exported kubeconfigs under `dir`.
    #[must_use]
    pub fn with_kubeconfig_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kubeconfig_dir = dir.into();
        self
    }

    fn bare_name<'a>(id: &'a str) -> Result<&'a str, ProviderError> {
        parse_cluster_id(PROVIDER_NAME, id)
            .ok_or_else(|| ProviderError::NotFound(format!("{id} is not a kind cluster id")))
    }

    async fn record(&self, id: &str) -> Result<Cluster, ProviderError> {
        self.store
            .load()
            .await?
            .remove(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_string()))
    }

    async fn set_status(&self, id: &str, status: ClusterStatus) -> Result<Cluster, ProviderError> {
        let id = id.to_string();
        update_with(self.store.as_ref(), move |clusters| {
            let cluster = clusters
                .get_mut(&id)
                .ok_or_else(|| ProviderError::NotFound(id.clone()))?;
            if !cluster.transition(status) {
                warn!(cluster_id = %id, from = %cluster.status, to = %status, "Ignoring illegal status transition");
            }
            Ok(cluster.clone())
        })
        .await
    }

    async fn existing_clusters(&self) -> Result<Vec<String>, ProviderError> {
        let stdout = run_checked(
            self.runner.as_ref(),
            &CommandSpec::new("kind").args(["get", "clusters"]),
        )
        .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("No kind clusters"))
            .map(ToString::to_string)
            .collect())
    }

    async fn raw_kubeconfig(&self, name: &str) -> Result<String, ProviderError> {
        run_checked(
            self.runner.as_ref(),
            &CommandSpec::new("kind").args(["get", "kubeconfig", "--name", name]),
        )
        .await
    }

    async fn export_kubeconfig(&self, name: &str, kubeconfig: &str) -> Result<PathBuf, ProviderError> {
        tokio::fs::create_dir_all(&self.kubeconfig_dir).await?;
        let path = self.kubeconfig_dir.join(format!("{name}.kubeconfig"));
        tokio::fs::write(&path, kubeconfig).await?;
        Ok(path)
    }

    /// Install Cilium with its CLI, or the upstream manifest when the CLI
    /// is not available.
    async fn install_cilium(&self, name: &str, kubeconfig_path: &str) -> Result<(), ProviderError> {
        if self.runner.exists("cilium").await {
            info!(cluster = name, "Installing Cilium with the cilium CLI");
            let spec = CommandSpec::new("cilium")
                .env("KUBECONFIG", kubeconfig_path)
                .args(["install", "--wait"]);
            match run_checked(self.runner.as_ref(), &spec).await {
                Ok(_) => return Ok(()),
                Err(e) => warn!(error = %e, "cilium CLI install failed, falling back to manifest"),
            }
        }

        info!(cluster = name, "Installing Cilium from upstream manifest");
        let spec = CommandSpec::new("kubectl")
            .args(["--kubeconfig", kubeconfig_path, "apply", "-f", CILIUM_MANIFEST_URL]);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }

    async fn provision(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        let name = spec.name.as_str();
        let rendered = render_config(spec, self.node_image.as_deref())?;
        let mut config_file = tempfile::Builder::new()
            .prefix(&format!("adhar-kind-{name}-"))
            .suffix(".yaml")
            .tempfile()?;
        config_file.write_all(rendered.as_bytes())?;
        config_file.flush()?;

        info!(cluster = name, "Creating kind cluster");
        let create = CommandSpec::new("kind").args([
            "create".to_string(),
            "cluster".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--config".to_string(),
            config_file.path().display().to_string(),
            "--wait".to_string(),
            "120s".to_string(),
        ]);
        run_checked(self.runner.as_ref(), &create).await?;

        let kubeconfig = self.raw_kubeconfig(name).await?;
        let kubeconfig_path = self.export_kubeconfig(name, &kubeconfig).await?;

        let cni = spec.networking.cni.as_str();
        if cni == "cilium" {
            self.install_cilium(name, &kubeconfig_path.display().to_string())
                .await?;
        }

        let id = cluster_id(PROVIDER_NAME, name);
        let endpoint = health::kubeconfig_server(&kubeconfig);
        update_with(self.store.as_ref(), move |clusters| {
            let cluster = clusters
                .get_mut(&id)
                .ok_or_else(|| ProviderError::NotFound(id.clone()))?;
            cluster.endpoint = endpoint;
            cluster.metadata.insert(
                KUBECONFIG_PATH_KEY.to_string(),
                kubeconfig_path.display().to_string().into(),
            );
            cluster.transition(ClusterStatus::Running);
            Ok(cluster.clone())
        })
        .await
    }
}

#[async_trait]
impl Provider for Kind {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn authenticate(&self, _credentials: &Credentials) -> Result<(), ProviderError> {
        for program in ["kind", "docker", "kubectl"] {
            if !self.runner.exists(program).await {
                return Err(ProviderError::Config(format!(
                    "{program} is required for local clusters but was not found on PATH"
                )));
            }
        }
        Ok(())
    }

    async fn validate_permissions(&self) -> Result<(), ProviderError> {
        run_checked(
            self.runner.as_ref(),
            &CommandSpec::new("docker").args(["info", "--format", "{{.ServerVersion}}"]),
        )
        .await
        .map_err(|e| ProviderError::Auth(format!("cannot talk to the Docker daemon: {e}")))?;
        Ok(())
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        let id = cluster_id(PROVIDER_NAME, &spec.name);

        // Re-running against a healthy cluster is a no-op
        if let Ok(existing) = self.record(&id).await {
            if existing.status == ClusterStatus::Running
                && self.existing_clusters().await?.contains(&spec.name)
            {
                info!(cluster_id = %id, "kind cluster already exists");
                return Ok(existing);
            }
        }

        let record = Cluster::new(PROVIDER_NAME, spec);
        self.store
            .update(Box::new(move |clusters| {
                clusters.insert(record.id.clone(), record);
                Ok(())
            }))
            .await?;

        match self.provision(spec).await {
            Ok(cluster) => {
                info!(cluster_id = %cluster.id, "kind cluster running");
                Ok(cluster)
            }
            Err(e) => {
                if let Err(store_err) = self.set_status(&id, ClusterStatus::Error).await {
                    warn!(error = %store_err, "Failed to record cluster error status");
                }
                Err(e)
            }
        }
    }

    async fn delete_cluster(&self, id: &str) -> Result<(), ProviderError> {
        let name = Self::bare_name(id)?.to_string();
        self.set_status(id, ClusterStatus::Deleting).await?;

        info!(cluster_id = %id, "Deleting kind cluster");
        let delete = CommandSpec::new("kind").args(["delete", "cluster", "--name", name.as_str()]);
        if let Err(e) = run_checked(self.runner.as_ref(), &delete).await {
            if let Err(store_err) = self.set_status(id, ClusterStatus::Error).await {
                warn!(error = %store_err, "Failed to record cluster error status");
            }
            return Err(e);
        }

        let owned = id.to_string();
        self.store
            .update(Box::new(move |clusters| {
                clusters.remove(&owned);
                Ok(())
            }))
            .await?;

        let kubeconfig = self.kubeconfig_dir.join(format!("{name}.kubeconfig"));
        if let Err(e) = tokio::fs::remove_file(&kubeconfig).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %kubeconfig.display(), error = %e, "Failed to remove kubeconfig");
            }
        }
        Ok(())
    }

    async fn update_cluster(&self, id: &str, spec: &ClusterSpec) -> Result<Cluster, ProviderError> {
        ensure_spec_for(PROVIDER_NAME, spec)?;
        // kind clusters are immutable; only the record's tags can change
        let id = id.to_string();
        let tags = spec.tags.clone();
        update_with(self.store.as_ref(), move |clusters| {
            let cluster = clusters
                .get_mut(&id)
                .ok_or_else(|| ProviderError::NotFound(id.clone()))?;
            cluster.tags.extend(tags);
            cluster.updated_at = Utc::now();
            Ok(cluster.clone())
        })
        .await
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster, ProviderError> {
        self.record(id).await
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>, ProviderError> {
        Ok(self.store.load().await?.into_values().collect())
    }

    async fn get_kubeconfig(&self, id: &str) -> Result<String, ProviderError> {
        let cluster = self.record(id).await?;
        self.raw_kubeconfig(&cluster.name).await
    }

    async fn list_node_groups(&self, cluster_id: &str) -> Result<Vec<NodeGroup>, ProviderError> {
        let cluster = self.record(cluster_id).await?;
        let stdout = run_checked(
            self.runner.as_ref(),
            &CommandSpec::new("kind").args(["get", "nodes", "--name", cluster.name.as_str()]),
        )
        .await?;

        let (control_planes, workers): (Vec<&str>, Vec<&str>) = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .partition(|n| n.contains("control-plane"));

        let group = |name: &str, count: usize| NodeGroup {
            name: name.to_string(),
            cluster_id: cluster_id.to_string(),
            instance_type: "docker".to_string(),
            replicas: u32::try_from(count).unwrap_or(u32::MAX),
            min_size: None,
            max_size: None,
            status: "running".to_string(),
        };
        let mut groups = vec![group("control-plane", control_planes.len())];
        if !workers.is_empty() {
            groups.push(group("workers", workers.len()));
        }
        Ok(groups)
    }

    async fn investigate_cluster(&self, id: &str) -> Result<Investigation, ProviderError> {
        let cluster = self.record(id).await?;
        let mut findings = Vec::new();

        let label = format!("label=io.x-k8s.kind.cluster={}", cluster.name);
        let probes = [
            (
                "kind nodes",
                CommandSpec::new("kind").args(["get", "nodes", "--name", cluster.name.as_str()]),
            ),
            (
                "node containers",
                CommandSpec::new("docker").args([
                    "ps",
                    "--all",
                    "--filter",
                    label.as_str(),
                    "--format",
                    "{{.Names}}\t{{.Status}}",
                ]),
            ),
        ];
        for (title, spec) in probes {
            let finding = match self.runner.run(&spec).await {
                Ok(out) if out.success() => Finding {
                    title: title.to_string(),
                    severity: if out.stdout.contains("Exited") {
                        Severity::Critical
                    } else {
                        Severity::Info
                    },
                    detail: out.stdout,
                },
                Ok(out) => Finding {
                    title: title.to_string(),
                    detail: out.stderr,
                    severity: Severity::Warning,
                },
                Err(e) => Finding {
                    title: title.to_string(),
                    detail: e.to_string(),
                    severity: Severity::Warning,
                },
            };
            findings.push(finding);
        }

        if cluster.status == ClusterStatus::Error {
            findings.push(Finding {
                title: "cluster status".to_string(),
                detail: "the last create or delete attempt failed".to_string(),
                severity: Severity::Critical,
            });
        }

        Ok(Investigation {
            cluster_id: id.to_string(),
            findings,
            collected_at: Utc::now(),
        })
    }

    async fn install_addon(&self, cluster_id: &str, addon: &AddonSpec) -> Result<(), ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::install(self.runner.as_ref(), &kubeconfig, addon).await
    }

    async fn uninstall_addon(
        &self,
        cluster_id: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::uninstall(self.runner.as_ref(), &kubeconfig, name, namespace).await
    }

    async fn list_addons(&self, cluster_id: &str) -> Result<Vec<Addon>, ProviderError> {
        let kubeconfig = self.get_kubeconfig(cluster_id).await?;
        addons::list(self.runner.as_ref(), &kubeconfig).await
    }

    async fn estimate_cost(&self, _spec: &ClusterSpec) -> Result<CostEstimate, ProviderError> {
        Ok(CostEstimate {
            currency: "USD".to_string(),
            hourly: 0.0,
            monthly: 0.0,
            items: Vec::new(),
        })
    }
}
