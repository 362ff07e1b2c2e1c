//! Kubeconfig export and merging into `~/.kube/config`.

use std::path::{Path, PathBuf};

use adhar_cloud::command::{run_checked, CommandRunner, CommandSpec};
use anyhow::{Context, Result};
use tracing::{info, warn};

/// Get the default kubeconfig path (~/.kube/config).
#[must_use]
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".kube").join("config"))
}

/// Path of the kubeconfig written for `cluster_id` under `output_dir`.
#[must_use]
pub fn cluster_kubeconfig_path(output_dir: &Path, cluster_id: &str) -> PathBuf {
    output_dir.join("kubeconfigs").join(format!("{cluster_id}.yaml"))
}

/// Write `contents` to the per-cluster kubeconfig file.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub async fn write_kubeconfig(output_dir: &Path, cluster_id: &str, contents: &str) -> Result<PathBuf> {
    let path = cluster_kubeconfig_path(output_dir, cluster_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&path, contents)
        .await
        .with_context(|| format!("Failed to write kubeconfig to {}", path.display()))?;
    info!(path = %path.display(), "Wrote kubeconfig");
    Ok(path)
}

/// Merge `source` into `target` and switch to `context`.
///
/// Uses `KUBECONFIG=target:source kubectl config view --flatten`; a missing
/// target is simply replaced by the source.
///
/// # Errors
///
/// Returns an error if the merge fails.
pub async fn merge_kubeconfig(
    runner: &dyn CommandRunner,
    source: &Path,
    target: &Path,
    context: &str,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create kubeconfig directory")?;
    }

    info!(source = %source.display(), target = %target.display(), "Merging kubeconfig");

    if !tokio::fs::try_exists(target).await.unwrap_or(false) {
        tokio::fs::copy(source, target)
            .await
            .context("Failed to write kubeconfig")?;
        info!(target = %target.display(), "Created new kubeconfig");
    } else {
        let merged = run_checked(
            runner,
            &CommandSpec::new("kubectl")
                .args(["config", "view", "--flatten"])
                .env("KUBECONFIG", format!("{}:{}", target.display(), source.display())),
        )
        .await
        .context("Failed to merge kubeconfig")?;
        tokio::fs::write(target, merged)
            .await
            .context("Failed to write merged kubeconfig")?;
    }

    let use_context = CommandSpec::new("kubectl")
        .args(["config", "use-context", context])
        .env("KUBECONFIG", target.display().to_string());
    if let Err(e) = run_checked(runner, &use_context).await {
        warn!(context, error = %e, "Could not switch kubectl context");
    } else {
        info!(context, "Merged kubeconfig and set current context");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adhar_cloud::command::CommandOutput;
    use adhar_cloud::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_missing_target_is_copied() {
        let tmp = tempfile::tempdir().unwrap();
        let source = write_kubeconfig(tmp.path(), "kind-dev", "apiVersion: v1\n")
            .await
            .unwrap();
        let target = tmp.path().join("home/.kube/config");
        let runner = ScriptedRunner::new();
        runner.respond("kubectl config use-context", CommandOutput::ok(""));

        merge_kubeconfig(&runner, &source, &target, "kind-dev")
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "apiVersion: v1\n");
        assert!(!runner.was_called("kubectl config view"));
    }

    #[tokio::test]
    async fn test_existing_target_is_flattened() {
        let tmp = tempfile::tempdir().unwrap();
        let source = write_kubeconfig(tmp.path(), "kind-dev", "new").await.unwrap();
        let target = tmp.path().join("config");
        std::fs::write(&target, "old").unwrap();
        let runner = ScriptedRunner::new();
        runner.respond("kubectl config view --flatten", CommandOutput::ok("merged"));
        runner.respond("kubectl config use-context", CommandOutput::failed(1, "no context"));

        merge_kubeconfig(&runner, &source, &target, "kind-dev")
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "merged");
        let view = &runner.calls()[0];
        assert_eq!(
            view.env,
            vec![(
                "KUBECONFIG".to_string(),
                format!("{}:{}", target.display(), source.display())
            )]
        );
    }

    #[test]
    fn test_kubeconfig_path_layout() {
        let path = cluster_kubeconfig_path(Path::new("/home/u/.adhar"), "kind-dev");
        assert_eq!(path, PathBuf::from("/home/u/.adhar/kubeconfigs/kind-dev.yaml"));
    }
}
