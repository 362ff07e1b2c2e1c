//! In-memory [`PlatformCluster`] for tests.
//!
//! Applied manifests are parsed so that namespaces, secrets and config maps
//! they contain become visible to later reads.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use adhar_cloud::providers::AddonSpec;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde::Deserialize;

use super::{AppStatus, ClusterConnector, PlatformCluster};
use crate::crd::{AdharPlatform, AdharPlatformStatus};

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    applied: Vec<String>,
    ready: BTreeSet<String>,
    exec_results: HashMap<String, VecDeque<Result<String, String>>>,
    exec_calls: Vec<String>,
    helm_releases: Vec<AddonSpec>,
    failing_releases: BTreeSet<String>,
    crd_installed: bool,
    platform: Option<AdharPlatform>,
    apps: BTreeMap<String, AppStatus>,
    secrets: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    config_maps: BTreeMap<String, BTreeMap<String, String>>,
    restarts: Vec<String>,
    fail_apply_containing: Option<String>,
    fail_platform_upsert: bool,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Scriptable in-memory cluster.
pub(crate) struct FakeCluster {
    path: PathBuf,
    state: Mutex<State>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self {
            path: PathBuf::from("/tmp/adhar-fake.kubeconfig"),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a deployment, daemonset, pod selector or service as ready.
    pub(crate) fn set_ready(&self, namespace: &str, name: &str) {
        self.state().ready.insert(key(namespace, name));
    }

    /// Mark everything the bootstrap sequence waits on as ready.
    pub(crate) fn all_ready(self) -> Self {
        for (ns, name) in [
            ("kube-system", "cilium"),
            ("kube-system", "coredns"),
            ("argocd", "argocd-server"),
            ("argocd", "argocd-repo-server"),
            ("argocd", "app.kubernetes.io/name=argocd-application-controller"),
            ("gitea", "gitea"),
            ("gitea", "app.kubernetes.io/name=gitea"),
            ("gitea", "gitea-http"),
            ("ingress-nginx", "ingress-nginx-controller"),
        ] {
            self.set_ready(ns, name);
        }
        self
    }

    pub(crate) fn with_namespace(self, name: &str) -> Self {
        self.state().namespaces.insert(name.to_string());
        self
    }

    /// Queue results for `exec` into `target`. Unscripted calls succeed
    /// with empty output.
    pub(crate) fn script_exec(&self, namespace: &str, target: &str, results: Vec<Result<&str, &str>>) {
        self.state().exec_results.insert(
            key(namespace, target),
            results
                .into_iter()
                .map(|r| r.map(str::to_string).map_err(str::to_string))
                .collect(),
        );
    }

    pub(crate) fn set_application(&self, namespace: &str, name: &str, sync: &str, health: &str) {
        self.state().apps.insert(
            key(namespace, name),
            AppStatus {
                name: name.to_string(),
                sync_status: sync.to_string(),
                health_status: health.to_string(),
                message: None,
            },
        );
    }

    pub(crate) fn set_config_map(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        self.state().config_maps.insert(key(namespace, name), data);
    }

    pub(crate) fn fail_helm(&self, release: &str) {
        self.state().failing_releases.insert(release.to_string());
    }

    pub(crate) fn fail_apply_containing(&self, needle: &str) {
        self.state().fail_apply_containing = Some(needle.to_string());
    }

    pub(crate) fn fail_platform_upsert(&self) {
        self.state().fail_platform_upsert = true;
    }

    pub(crate) fn applied(&self) -> Vec<String> {
        self.state().applied.clone()
    }

    pub(crate) fn applied_containing(&self, needle: &str) -> usize {
        self.state()
            .applied
            .iter()
            .filter(|m| m.contains(needle))
            .count()
    }

    pub(crate) fn helm_releases(&self) -> Vec<String> {
        self.state()
            .helm_releases
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    pub(crate) fn exec_calls(&self) -> Vec<String> {
        self.state().exec_calls.clone()
    }

    pub(crate) fn restarts(&self) -> Vec<String> {
        self.state().restarts.clone()
    }

    pub(crate) fn has_namespace(&self, name: &str) -> bool {
        self.state().namespaces.contains(name)
    }

    pub(crate) fn crd_installed(&self) -> bool {
        self.state().crd_installed
    }

    pub(crate) fn stored_platform(&self) -> Option<AdharPlatform> {
        self.state().platform.clone()
    }

    pub(crate) fn set_platform_ready(&self) {
        if let Some(platform) = self.state().platform.as_mut() {
            platform.status = Some(AdharPlatformStatus {
                repositories_created: true,
                ..AdharPlatformStatus::default()
            });
        }
    }

    fn absorb(state: &mut State, manifest: &str) -> Result<()> {
        for document in serde_yaml::Deserializer::from_str(manifest) {
            let value = serde_yaml::Value::deserialize(document)?;
            let kind = value.get("kind").and_then(|k| k.as_str()).unwrap_or_default();
            let meta = |field: &str| {
                value
                    .get("metadata")
                    .and_then(|m| m.get(field))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            match kind {
                "Namespace" => {
                    state.namespaces.insert(meta("name"));
                }
                "Secret" => {
                    let secret: Secret = serde_yaml::from_value(value.clone())?;
                    let data = secret
                        .data
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, v.0))
                        .collect();
                    state.secrets.insert(key(&meta("namespace"), &meta("name")), data);
                }
                "ConfigMap" => {
                    let config_map: ConfigMap = serde_yaml::from_value(value.clone())?;
                    state.config_maps.insert(
                        key(&meta("namespace"), &meta("name")),
                        config_map.data.unwrap_or_default(),
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformCluster for FakeCluster {
    fn kubeconfig_path(&self) -> &Path {
        &self.path
    }

    async fn apply_manifest(&self, manifest: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(needle) = &state.fail_apply_containing {
            if manifest.contains(needle.as_str()) {
                bail!("kubectl apply failed: admission webhook denied the request");
            }
        }
        state.applied.push(manifest.to_string());
        Self::absorb(&mut state, manifest)
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state().namespaces.contains(name))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<bool> {
        Ok(self.state().namespaces.insert(name.to_string()))
    }

    async fn deployment_available(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.state().ready.contains(&key(namespace, name)))
    }

    async fn daemonset_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.state().ready.contains(&key(namespace, name)))
    }

    async fn pods_ready(&self, namespace: &str, selector: &str) -> Result<bool> {
        Ok(self.state().ready.contains(&key(namespace, selector)))
    }

    async fn service_has_endpoints(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.state().ready.contains(&key(namespace, name)))
    }

    async fn exec(&self, namespace: &str, target: &str, command: &[&str]) -> Result<String> {
        let mut state = self.state();
        state
            .exec_calls
            .push(format!("{} {}", key(namespace, target), command.join(" ")));
        match state
            .exec_results
            .get_mut(&key(namespace, target))
            .and_then(VecDeque::pop_front)
        {
            Some(Ok(out)) => Ok(out),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok(String::new()),
        }
    }

    async fn helm_install(&self, addon: &AddonSpec) -> Result<()> {
        let mut state = self.state();
        if state.failing_releases.contains(&addon.name) {
            bail!("helm install of {} failed: chart not found", addon.name);
        }
        state.namespaces.insert(addon.namespace.clone());
        state.helm_releases.push(addon.clone());
        Ok(())
    }

    async fn install_platform_crd(&self) -> Result<()> {
        self.state().crd_installed = true;
        Ok(())
    }

    async fn platform_crd_established(&self) -> Result<bool> {
        Ok(self.state().crd_installed)
    }

    async fn upsert_platform(&self, platform: &AdharPlatform) -> Result<()> {
        let mut state = self.state();
        if state.fail_platform_upsert {
            bail!("AdharPlatform rejected: conversion webhook unavailable");
        }
        let status = state.platform.as_ref().and_then(|p| p.status.clone());
        let mut stored = platform.clone();
        stored.status = status;
        state.platform = Some(stored);
        Ok(())
    }

    async fn platform(&self, _namespace: &str, _name: &str) -> Result<Option<AdharPlatform>> {
        Ok(self.state().platform.clone())
    }

    async fn patch_platform_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &AdharPlatformStatus,
    ) -> Result<()> {
        match self.state().platform.as_mut() {
            Some(platform) => {
                platform.status = Some(status.clone());
                Ok(())
            }
            None => bail!("platform object not found"),
        }
    }

    async fn application_status(&self, namespace: &str, name: &str) -> Result<Option<AppStatus>> {
        Ok(self.state().apps.get(&key(namespace, name)).cloned())
    }

    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        Ok(self.state().secrets.get(&key(namespace, name)).cloned())
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self.state().config_maps.get(&key(namespace, name)).cloned())
    }

    async fn rollout_restart(&self, namespace: &str, deployment: &str) -> Result<()> {
        self.state().restarts.push(key(namespace, deployment));
        Ok(())
    }
}

#[async_trait]
impl ClusterConnector for Arc<FakeCluster> {
    async fn connect(&self, _kubeconfig_path: &Path) -> Result<Arc<dyn PlatformCluster>> {
        Ok(Arc::clone(self) as Arc<dyn PlatformCluster>)
    }
}
