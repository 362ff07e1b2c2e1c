//! Helm-based addon management shared by providers.

use std::io::Write;

use serde::Deserialize;
use tracing::info;

use super::traits::ProviderError;
use super::types::{Addon, AddonSpec};
use crate::command::{run_checked, CommandRunner, CommandSpec};

/// Kubeconfig written to a temp file for the duration of a helm call.
struct KubeconfigFile(tempfile::NamedTempFile);

impl KubeconfigFile {
    fn write(kubeconfig: &str) -> Result<Self, ProviderError> {
        let mut file = tempfile::Builder::new()
            .prefix("adhar-kubeconfig-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(kubeconfig.as_bytes())?;
        file.flush()?;
        Ok(Self(file))
    }

    fn path(&self) -> String {
        self.0.path().display().to_string()
    }
}

/// Build the `helm upgrade --install` invocation for an addon.
#[must_use]
pub fn install_command(kubeconfig_path: &str, addon: &AddonSpec) -> CommandSpec {
    let mut spec = CommandSpec::new("helm")
        .env("KUBECONFIG", kubeconfig_path)
        .args(["upgrade", "--install", addon.name.as_str(), addon.chart.name.as_str()])
        .args(["--repo", addon.chart.repo.as_str()])
        .args(["--namespace", addon.namespace.as_str(), "--create-namespace"]);
    if let Some(version) = &addon.chart.version {
        spec = spec.args(["--version", version.as_str()]);
    }
    for (key, value) in &addon.values {
        spec = spec.args(["--set".to_string(), format!("{key}={value}")]);
    }
    spec.arg("--wait")
}

/// Install or upgrade an addon.
///
/// # Errors
///
/// Returns an error if helm fails.
pub async fn install(
    runner: &dyn CommandRunner,
    kubeconfig: &str,
    addon: &AddonSpec,
) -> Result<(), ProviderError> {
    let file = KubeconfigFile::write(kubeconfig)?;
    info!(addon = %addon.name, namespace = %addon.namespace, "Installing addon");
    run_checked(runner, &install_command(&file.path(), addon)).await?;
    Ok(())
}

/// Uninstall an addon.
///
/// # Errors
///
/// Returns an error if helm fails.
pub async fn uninstall(
    runner: &dyn CommandRunner,
    kubeconfig: &str,
    name: &str,
    namespace: &str,
) -> Result<(), ProviderError> {
    let file = KubeconfigFile::write(kubeconfig)?;
    info!(addon = name, namespace, "Uninstalling addon");
    let spec = CommandSpec::new("helm")
        .env("KUBECONFIG", file.path())
        .args(["uninstall", name, "--namespace", namespace]);
    run_checked(runner, &spec).await?;
    Ok(())
}

#[derive(Deserialize)]
struct HelmRelease {
    name: String,
    namespace: String,
    chart: String,
    status: String,
}

/// List installed releases across namespaces.
///
/// # Errors
///
/// Returns an error if helm fails or prints unexpected JSON.
pub async fn list(runner: &dyn CommandRunner, kubeconfig: &str) -> Result<Vec<Addon>, ProviderError> {
    let file = KubeconfigFile::write(kubeconfig)?;
    let spec = CommandSpec::new("helm")
        .env("KUBECONFIG", file.path())
        .args(["list", "--all-namespaces", "--output", "json"]);
    let stdout = run_checked(runner, &spec).await?;
    parse_releases(&stdout)
}

fn parse_releases(json: &str) -> Result<Vec<Addon>, ProviderError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let releases: Vec<HelmRelease> = serde_json::from_str(json)?;
    Ok(releases
        .into_iter()
        .map(|r| Addon {
            name: r.name,
            namespace: r.namespace,
            chart: r.chart,
            status: r.status,
        })
        .collect())
}
