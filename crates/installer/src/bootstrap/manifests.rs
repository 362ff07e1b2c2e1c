//! Charts, GitOps resources and repository contents for the bootstrap.

use std::collections::BTreeMap;

use adhar_cloud::providers::{AddonSpec, ChartRef};
use anyhow::Result;
use serde_json::{json, Value};

use super::BootstrapOptions;
use crate::readiness::RetryPolicy;

/// Namespace of the GitOps controller.
pub const ARGOCD_NAMESPACE: &str = "argocd";
/// Namespace of the Git server.
pub const GITEA_NAMESPACE: &str = "gitea";
/// Namespace of the ingress controller.
pub const INGRESS_NAMESPACE: &str = "ingress-nginx";

/// Name of the root Application.
pub const BOOTSTRAP_APPLICATION: &str = "bootstrap";

/// Default Argo CD chart version.
pub const ARGOCD_CHART_VERSION: &str = "7.7.11";
/// Default Gitea chart version.
pub const GITEA_CHART_VERSION: &str = "10.6.0";
/// Default ingress-nginx chart version.
pub const INGRESS_NGINX_CHART_VERSION: &str = "4.11.3";

/// The three GitOps repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RepoKind {
    /// Root manifests synced by the bootstrap Application.
    Bootstrap,
    /// Reusable packages, one directory per chart.
    Packages,
    /// Per-environment configuration.
    Environments,
}

impl RepoKind {
    /// All repositories.
    pub const ALL: [Self; 3] = [Self::Bootstrap, Self::Packages, Self::Environments];

    /// Repository name on the Git server.
    #[must_use]
    pub fn repo_name(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Packages => "packages",
            Self::Environments => "environments",
        }
    }
}

impl std::fmt::Display for RepoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.repo_name())
    }
}

/// A chart deployed by the packages ApplicationSet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Release and directory name.
    pub name: String,
    /// Chart reference.
    pub chart: ChartRef,
    /// Target namespace.
    pub namespace: String,
    /// Helm values.
    pub values: BTreeMap<String, String>,
}

impl From<&AddonSpec> for Package {
    fn from(addon: &AddonSpec) -> Self {
        Self {
            name: addon.name.clone(),
            chart: addon.chart.clone(),
            namespace: addon.namespace.clone(),
            values: addon.values.clone(),
        }
    }
}

/// Packages every platform gets.
#[must_use]
pub fn default_packages() -> Vec<Package> {
    vec![Package {
        name: "cert-manager".to_string(),
        chart: ChartRef {
            repo: "https://charts.jetstack.io".to_string(),
            name: "cert-manager".to_string(),
            version: Some("v1.16.2".to_string()),
        },
        namespace: "cert-manager".to_string(),
        values: BTreeMap::from([("crds.enabled".to_string(), "true".to_string())]),
    }]
}

fn to_yaml(value: &Value) -> Result<String> {
    Ok(serde_yaml::to_string(value)?)
}

fn join_documents(documents: &[String]) -> String {
    documents.join("---\n")
}

/// Argo CD chart.
#[must_use]
pub fn argocd_addon(options: &BootstrapOptions) -> AddonSpec {
    AddonSpec {
        name: "argocd".to_string(),
        namespace: ARGOCD_NAMESPACE.to_string(),
        chart: ChartRef {
            repo: "https://argoproj.github.io/argo-helm".to_string(),
            name: "argo-cd".to_string(),
            version: Some(
                options
                    .argocd_version
                    .clone()
                    .unwrap_or_else(|| ARGOCD_CHART_VERSION.to_string()),
            ),
        },
        values: BTreeMap::from([
            ("configs.params.server\\.insecure".to_string(), "true".to_string()),
            ("dex.enabled".to_string(), "false".to_string()),
            ("notifications.enabled".to_string(), "false".to_string()),
            ("global.domain".to_string(), format!("argocd.{}", options.domain)),
        ]),
    }
}

/// Gitea chart with SQLite storage and an ingress host.
#[must_use]
pub fn gitea_addon(options: &BootstrapOptions) -> AddonSpec {
    let host = format!("gitea.{}", options.domain);
    AddonSpec {
        name: "gitea".to_string(),
        namespace: GITEA_NAMESPACE.to_string(),
        chart: ChartRef {
            repo: "https://dl.gitea.com/charts/".to_string(),
            name: "gitea".to_string(),
            version: Some(
                options
                    .gitea_version
                    .clone()
                    .unwrap_or_else(|| GITEA_CHART_VERSION.to_string()),
            ),
        },
        values: BTreeMap::from([
            ("gitea.admin.username".to_string(), options.admin_user.clone()),
            ("gitea.admin.password".to_string(), options.admin_password.clone()),
            ("gitea.config.database.DB_TYPE".to_string(), "sqlite3".to_string()),
            ("gitea.config.server.ROOT_URL".to_string(), options.git_url.clone()),
            ("postgresql.enabled".to_string(), "false".to_string()),
            ("postgresql-ha.enabled".to_string(), "false".to_string()),
            ("redis-cluster.enabled".to_string(), "false".to_string()),
            ("ingress.enabled".to_string(), "true".to_string()),
            ("ingress.className".to_string(), "nginx".to_string()),
            ("ingress.hosts[0].host".to_string(), host),
            ("ingress.hosts[0].paths[0].path".to_string(), "/".to_string()),
            ("ingress.hosts[0].paths[0].pathType".to_string(), "Prefix".to_string()),
        ]),
    }
}

/// ingress-nginx chart. Local clusters bind host ports on the
/// `ingress-ready` node; cloud clusters get a load balancer.
#[must_use]
pub fn ingress_nginx_addon(options: &BootstrapOptions) -> AddonSpec {
    let mut values = BTreeMap::from([(
        "controller.extraArgs.default-ssl-certificate".to_string(),
        format!("{INGRESS_NAMESPACE}/{}", crate::tls::TLS_SECRET_NAME),
    )]);
    if options.local {
        values.extend([
            ("controller.hostPort.enabled".to_string(), "true".to_string()),
            ("controller.service.type".to_string(), "NodePort".to_string()),
            (
                "controller.nodeSelector.ingress-ready".to_string(),
                "true".to_string(),
            ),
            (
                "controller.tolerations[0].key".to_string(),
                "node-role.kubernetes.io/control-plane".to_string(),
            ),
            (
                "controller.tolerations[0].operator".to_string(),
                "Exists".to_string(),
            ),
        ]);
    }
    AddonSpec {
        name: "ingress-nginx".to_string(),
        namespace: INGRESS_NAMESPACE.to_string(),
        chart: ChartRef {
            repo: "https://kubernetes.github.io/ingress-nginx".to_string(),
            name: "ingress-nginx".to_string(),
            version: Some(
                options
                    .ingress_version
                    .clone()
                    .unwrap_or_else(|| INGRESS_NGINX_CHART_VERSION.to_string()),
            ),
        },
        values,
    }
}

/// The root Application pointing at the bootstrap repository.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn bootstrap_application(repo_url: &str, retry: &RetryPolicy) -> Result<String> {
    to_yaml(&json!({
        "apiVersion": "argoproj.io/v1alpha1",
        "kind": "Application",
        "metadata": {
            "name": BOOTSTRAP_APPLICATION,
            "namespace": ARGOCD_NAMESPACE,
            "finalizers": ["resources-finalizer.argocd.argoproj.io"],
        },
        "spec": {
            "project": "default",
            "source": {
                "repoURL": repo_url,
                "targetRevision": "HEAD",
                "path": ".",
                "directory": { "recurse": true },
            },
            "destination": {
                "server": "https://kubernetes.default.svc",
                "namespace": ARGOCD_NAMESPACE,
            },
            "syncPolicy": {
                "automated": { "prune": true, "selfHeal": true },
                "syncOptions": ["CreateNamespace=true"],
                "retry": {
                    "limit": retry.max_attempts,
                    "backoff": {
                        "duration": format!("{}s", retry.initial_delay.as_secs()),
                        "factor": retry.factor,
                        "maxDuration": format!("{}m", retry.max_delay.as_secs() / 60),
                    },
                },
            },
        },
    }))
}

/// ApplicationSets fanning out the packages and environments repositories.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn application_sets(packages_url: &str, environments_url: &str, environment: &str) -> Result<String> {
    let automated = json!({
        "automated": { "prune": true, "selfHeal": true },
        "syncOptions": ["CreateNamespace=true", "ServerSideApply=true"],
    });

    let packages = to_yaml(&json!({
        "apiVersion": "argoproj.io/v1alpha1",
        "kind": "ApplicationSet",
        "metadata": { "name": "packages", "namespace": ARGOCD_NAMESPACE },
        "spec": {
            "goTemplate": true,
            "generators": [{
                "git": {
                    "repoURL": packages_url,
                    "revision": "HEAD",
                    "files": [{ "path": "*/package.json" }],
                },
            }],
            "template": {
                "metadata": { "name": "{{.name}}" },
                "spec": {
                    "project": "default",
                    "sources": [
                        {
                            "repoURL": "{{.chart.repo}}",
                            "chart": "{{.chart.name}}",
                            "targetRevision": "{{.chart.version}}",
                            "helm": { "valueFiles": ["$values/{{.path.path}}/values.yaml"] },
                        },
                        { "repoURL": packages_url, "targetRevision": "HEAD", "ref": "values" },
                    ],
                    "destination": {
                        "server": "https://kubernetes.default.svc",
                        "namespace": "{{.namespace}}",
                    },
                    "syncPolicy": automated,
                },
            },
        },
    }))?;

    let environments = to_yaml(&json!({
        "apiVersion": "argoproj.io/v1alpha1",
        "kind": "ApplicationSet",
        "metadata": { "name": "environments", "namespace": ARGOCD_NAMESPACE },
        "spec": {
            "goTemplate": true,
            "generators": [{
                "git": {
                    "repoURL": environments_url,
                    "revision": "HEAD",
                    "directories": [{ "path": environment }],
                },
            }],
            "template": {
                "metadata": { "name": "env-{{.path.basename}}" },
                "spec": {
                    "project": "default",
                    "source": {
                        "repoURL": environments_url,
                        "targetRevision": "HEAD",
                        "path": "{{.path.path}}",
                    },
                    "destination": {
                        "server": "https://kubernetes.default.svc",
                        "namespace": "default",
                    },
                    "syncPolicy": automated,
                },
            },
        },
    }))?;

    Ok(join_documents(&[packages, environments]))
}

/// Files of a repository, keyed by path relative to its root.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn repo_contents(kind: RepoKind, options: &BootstrapOptions) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    match kind {
        RepoKind::Bootstrap => {
            files.insert(
                "README.md".to_string(),
                "# bootstrap\n\nRoot manifests synced by the `bootstrap` Application.\n".to_string(),
            );
            let namespaces: Vec<String> = options
                .namespaces
                .iter()
                .map(|ns| {
                    to_yaml(&json!({
                        "apiVersion": "v1",
                        "kind": "Namespace",
                        "metadata": { "name": ns },
                    }))
                })
                .collect::<Result<_>>()?;
            files.insert("namespaces.yaml".to_string(), join_documents(&namespaces));
        }
        RepoKind::Packages => {
            files.insert(
                "README.md".to_string(),
                "# packages\n\nOne directory per chart: `package.json` and `values.yaml`.\n"
                    .to_string(),
            );
            for package in &options.packages {
                files.insert(
                    format!("{}/package.json", package.name),
                    serde_json::to_string_pretty(&json!({
                        "name": package.name,
                        "namespace": package.namespace,
                        "chart": {
                            "repo": package.chart.repo,
                            "name": package.chart.name,
                            "version": package.chart.version.as_deref().unwrap_or("*"),
                        },
                    }))?,
                );
                files.insert(
                    format!("{}/values.yaml", package.name),
                    values_yaml(&package.values)?,
                );
            }
        }
        RepoKind::Environments => {
            files.insert(
                "README.md".to_string(),
                "# environments\n\nPer-environment configuration.\n".to_string(),
            );
            files.insert(
                format!("{}/platform-config.yaml", options.environment),
                to_yaml(&json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": "platform-config", "namespace": "default" },
                    "data": {
                        "environment": options.environment,
                        "domain": options.domain,
                        "gitUrl": options.git_url,
                    },
                }))?,
            );
        }
    }
    Ok(files)
}

/// Nest dotted helm `--set` keys into a values document.
fn values_yaml(values: &BTreeMap<String, String>) -> Result<String> {
    let mut root = serde_json::Map::new();
    for (key, value) in values {
        let parts: Vec<&str> = key.split('.').collect();
        let Some((leaf, parents)) = parts.split_last() else {
            continue;
        };
        let mut node = &mut root;
        for part in parents {
            node = node
                .entry((*part).to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .ok_or_else(|| anyhow::anyhow!("value key {key} conflicts with a scalar"))?;
        }
        node.insert((*leaf).to_string(), Value::String(value.clone()));
    }
    if root.is_empty() {
        return Ok("{}\n".to_string());
    }
    to_yaml(&Value::Object(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_application_retry_bounds() {
        let yaml = bootstrap_application(
            "http://gitea-http.gitea.svc:3000/adhar/bootstrap.git",
            &RetryPolicy::default(),
        )
        .unwrap();
        let value: Value = serde_yaml::from_str(&yaml).unwrap();
        let retry = &value["spec"]["syncPolicy"]["retry"];
        assert_eq!(retry["limit"], 30);
        assert_eq!(retry["backoff"]["duration"], "5s");
        assert_eq!(retry["backoff"]["factor"], 2.0);
        assert_eq!(retry["backoff"]["maxDuration"], "3m");
        assert_eq!(value["spec"]["syncPolicy"]["automated"]["selfHeal"], true);
    }

    #[test]
    fn test_application_sets_are_two_documents() {
        let yaml = application_sets("http://git/packages.git", "http://git/environments.git", "local")
            .unwrap();
        let docs: Vec<Value> = serde_yaml::Deserializer::from_str(&yaml)
            .map(|d| serde::Deserialize::deserialize(d).unwrap())
            .collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["metadata"]["name"], "packages");
        assert_eq!(docs[1]["spec"]["generators"][0]["git"]["directories"][0]["path"], "local");
    }

    #[test]
    fn test_values_are_nested() {
        let values = BTreeMap::from([
            ("controller.service.type".to_string(), "NodePort".to_string()),
            ("controller.replicas".to_string(), "2".to_string()),
        ]);
        let value: Value = serde_yaml::from_str(&values_yaml(&values).unwrap()).unwrap();
        assert_eq!(value["controller"]["service"]["type"], "NodePort");
        assert_eq!(value["controller"]["replicas"], "2");
        assert_eq!(values_yaml(&BTreeMap::new()).unwrap(), "{}\n");
    }

    #[test]
    fn test_repo_contents() {
        let options = BootstrapOptions::for_tests();
        let packages = repo_contents(RepoKind::Packages, &options).unwrap();
        assert!(packages.contains_key("cert-manager/package.json"));
        assert!(packages.contains_key("cert-manager/values.yaml"));

        let environments = repo_contents(RepoKind::Environments, &options).unwrap();
        assert!(environments["local/platform-config.yaml"].contains("adhar.localtest.me"));

        let bootstrap = repo_contents(RepoKind::Bootstrap, &options).unwrap();
        assert!(bootstrap["namespaces.yaml"].contains("kind: Namespace"));
    }
}
