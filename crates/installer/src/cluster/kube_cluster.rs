use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use adhar_cloud::command::{run_checked, CommandRunner, CommandSpec};
use adhar_cloud::providers::{addons, health, AddonSpec};
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Pod, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, CustomResourceExt};
use serde_json::json;
use tracing::{debug, info};

use super::{AppStatus, PlatformCluster};
use crate::crd::{AdharPlatform, AdharPlatformStatus};

const FIELD_MANAGER: &str = "adhar";

/// Argo CD Application API resource definition.
fn argocd_application_api() -> ApiResource {
    ApiResource {
        group: "argoproj.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "Application".to_string(),
        plural: "applications".to_string(),
    }
}

fn status_field(app: &DynamicObject, section: &str, field: &str) -> Option<String> {
    app.data
        .get("status")
        .and_then(|s| s.get(section))
        .and_then(|s| s.get(field))
        .and_then(|s| s.as_str())
        .map(ToString::to_string)
}

/// [`PlatformCluster`] backed by a kube client and `kubectl`/`helm`.
pub struct KubeCluster {
    client: Client,
    runner: Arc<dyn CommandRunner>,
    kubeconfig_path: PathBuf,
}

impl KubeCluster {
    /// Connect using the kubeconfig at `kubeconfig_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a usable
    /// kubeconfig.
    pub async fn connect(kubeconfig_path: &Path, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let kubeconfig = tokio::fs::read_to_string(kubeconfig_path)
            .await
            .with_context(|| format!("Failed to read kubeconfig from {}", kubeconfig_path.display()))?;
        let client = health::client_from_kubeconfig(&kubeconfig)
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self {
            client,
            runner,
            kubeconfig_path: kubeconfig_path.to_path_buf(),
        })
    }

    fn kubectl(&self) -> CommandSpec {
        CommandSpec::new("kubectl").args([
            "--kubeconfig".to_string(),
            self.kubeconfig_path.display().to_string(),
        ])
    }

    fn platforms(&self, namespace: &str) -> Api<AdharPlatform> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PlatformCluster for KubeCluster {
    fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig_path
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        let spec = self.kubectl().args(["apply", "-f", "-"]).stdin(manifest);
        run_checked(self.runner.as_ref(), &spec)
            .await
            .context("kubectl apply failed")?;
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.get_opt(name).await?.is_some())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<bool> {
        if self.namespace_exists(name).await? {
            return Ok(false);
        }
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = name, "Created namespace");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to create namespace {name}")),
        }
    }

    async fn deployment_available(&self, namespace: &str, name: &str) -> Result<bool> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let Some(deployment) = deployments.get_opt(name).await? else {
            return Ok(false);
        };
        Ok(deployment
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Available" && c.status == "True"))
    }

    async fn daemonset_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        let daemonsets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let Some(daemonset) = daemonsets.get_opt(name).await? else {
            return Ok(false);
        };
        Ok(daemonset.status.is_some_and(|s| {
            s.desired_number_scheduled > 0 && s.number_ready == s.desired_number_scheduled
        }))
    }

    async fn pods_ready(&self, namespace: &str, selector: &str) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(selector)).await?;
        if list.items.is_empty() {
            return Ok(false);
        }
        Ok(list.items.iter().all(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                })
        }))
    }

    async fn service_has_endpoints(&self, namespace: &str, name: &str) -> Result<bool> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        let Some(endpoints) = endpoints.get_opt(name).await? else {
            return Ok(false);
        };
        Ok(endpoints
            .subsets
            .unwrap_or_default()
            .iter()
            .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty())))
    }

    async fn exec(&self, namespace: &str, target: &str, command: &[&str]) -> Result<String> {
        let spec = self
            .kubectl()
            .args(["-n", namespace, "exec", target, "--"])
            .args(command.iter().copied());
        debug!(namespace, target, "Executing in pod");
        Ok(run_checked(self.runner.as_ref(), &spec).await?)
    }

    async fn helm_install(&self, addon: &AddonSpec) -> Result<()> {
        let spec = addons::install_command(&self.kubeconfig_path.display().to_string(), addon);
        run_checked(self.runner.as_ref(), &spec)
            .await
            .with_context(|| format!("helm install of {} failed", addon.name))?;
        Ok(())
    }

    async fn install_platform_crd(&self) -> Result<()> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crd = AdharPlatform::crd();
        let name = AdharPlatform::crd_name();
        crds.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&crd),
        )
        .await
        .with_context(|| format!("Failed to apply CRD {name}"))?;
        info!(crd = name, "Applied platform CRD");
        Ok(())
    }

    async fn platform_crd_established(&self) -> Result<bool> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let Some(crd) = crds.get_opt(AdharPlatform::crd_name()).await? else {
            return Ok(false);
        };
        Ok(crd
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Established" && c.status == "True"))
    }

    async fn upsert_platform(&self, platform: &AdharPlatform) -> Result<()> {
        let namespace = platform
            .metadata
            .namespace
            .as_deref()
            .context("platform object has no namespace")?;
        let name = platform
            .metadata
            .name
            .as_deref()
            .context("platform object has no name")?;
        let api = self.platforms(namespace);

        if api.get_opt(name).await?.is_some() {
            let patch = json!({
                "metadata": { "annotations": platform.metadata.annotations },
                "spec": platform.spec,
            });
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .with_context(|| format!("Failed to update platform {namespace}/{name}"))?;
            info!(namespace, name, "Updated platform resource");
        } else {
            api.create(&PostParams::default(), platform)
                .await
                .with_context(|| format!("Failed to create platform {namespace}/{name}"))?;
            info!(namespace, name, "Created platform resource");
        }
        Ok(())
    }

    async fn platform(&self, namespace: &str, name: &str) -> Result<Option<AdharPlatform>> {
        Ok(self.platforms(namespace).get_opt(name).await?)
    }

    async fn patch_platform_status(
        &self,
        namespace: &str,
        name: &str,
        status: &AdharPlatformStatus,
    ) -> Result<()> {
        let patch = json!({ "status": status });
        self.platforms(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("Failed to update status of {namespace}/{name}"))?;
        Ok(())
    }

    async fn application_status(&self, namespace: &str, name: &str) -> Result<Option<AppStatus>> {
        let apps: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &argocd_application_api());
        let Some(app) = apps.get_opt(name).await? else {
            return Ok(None);
        };
        Ok(Some(AppStatus {
            name: name.to_string(),
            sync_status: status_field(&app, "sync", "status").unwrap_or_else(|| "Unknown".into()),
            health_status: status_field(&app, "health", "status")
                .unwrap_or_else(|| "Unknown".into()),
            message: status_field(&app, "health", "message"),
        }))
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get_opt(name).await?.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(config_maps
            .get_opt(name)
            .await?
            .map(|c| c.data.unwrap_or_default()))
    }

    async fn rollout_restart(&self, namespace: &str, deployment: &str) -> Result<()> {
        let spec = self.kubectl().args([
            "-n".to_string(),
            namespace.to_string(),
            "rollout".to_string(),
            "restart".to_string(),
            format!("deployment/{deployment}"),
        ]);
        run_checked(self.runner.as_ref(), &spec).await?;
        Ok(())
    }
}
