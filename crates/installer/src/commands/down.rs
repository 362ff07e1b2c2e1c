//! `adhar down`: delete a cluster.

use std::path::PathBuf;
use std::sync::Arc;

use adhar_cloud::providers::{cluster_id, registry, DEFAULT_PROVIDER};
use adhar_cloud::{Provider, ProviderConfig};
use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};
use tracing::{debug, info};

use super::{load_config, CONFIG_ENV};
use crate::config::GlobalSettings;
use crate::kubeconfig::cluster_kubeconfig_path;
use crate::local::DEFAULT_CLUSTER_NAME;
use crate::ui;

/// Delete a local cluster or the cluster of a configured environment.
#[derive(Args)]
pub struct DownCommand {
    /// Name of the local cluster
    #[arg(long, value_name = "NAME", default_value = DEFAULT_CLUSTER_NAME, conflicts_with = "env")]
    name: String,

    /// Platform configuration file
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV, requires = "env")]
    config: Option<PathBuf>,

    /// Environment whose cluster is deleted
    #[arg(short, long, value_name = "NAME")]
    env: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
}

/// What `down` deletes.
struct Target {
    provider: Arc<dyn Provider>,
    id: String,
    settings: GlobalSettings,
}

impl DownCommand {
    pub async fn run(&self) -> Result<()> {
        let target = self.target()?;

        if !self.yes {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("Delete cluster {}?", target.id))
                .default(false)
                .interact()?;
            if !proceed {
                println!("{}", "Deletion cancelled.".yellow());
                return Ok(());
            }
        }

        ui::print_section(&format!("Deleting {}", target.id));
        match target.provider.delete_cluster(&target.id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                ui::print_warning(&format!("Cluster {} does not exist", target.id));
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to delete {}", target.id)),
        }

        let kubeconfig = cluster_kubeconfig_path(&target.settings.output_dir(), &target.id);
        if kubeconfig.exists() {
            tokio::fs::remove_file(&kubeconfig)
                .await
                .with_context(|| format!("Failed to remove {}", kubeconfig.display()))?;
            debug!(path = %kubeconfig.display(), "Removed kubeconfig");
        }
        info!(id = %target.id, "Cluster deleted");
        ui::print_success(&format!("Cluster {} deleted", target.id));
        Ok(())
    }

    fn target(&self) -> Result<Target> {
        match (&self.config, &self.env) {
            (Some(path), Some(env)) => {
                let config = load_config(path)?;
                let env = config.resolve(env)?;
                let provider = registry::global()
                    .create_provider(&env.provider_type, &env.provider_config)
                    .with_context(|| format!("Failed to create {} provider", env.provider_type))?;
                Ok(Target {
                    id: cluster_id(provider.name(), &env.cluster_name()),
                    provider,
                    settings: env.global,
                })
            }
            (None, Some(_)) => bail!("--env needs --config (or {CONFIG_ENV})"),
            _ => {
                let provider = registry::global()
                    .get_or_create(DEFAULT_PROVIDER, &ProviderConfig::new())
                    .context("Failed to create the local provider")?;
                Ok(Target {
                    id: cluster_id(provider.name(), &self.name),
                    provider,
                    settings: GlobalSettings::default(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        down: DownCommand,
    }

    #[test]
    #[serial_test::serial]
    fn test_environment_target_uses_configured_provider() {
        std::env::remove_var(CONFIG_ENV);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.yaml");
        std::fs::write(
            &path,
            "providers:\n  custom:\n    region: on-prem\n    kubeconfigPath: /tmp/kubeconfig\nenvironments:\n  staging:\n    provider: custom\n    clusterConfig:\n      name: shared\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from(["adhar", "--config", path.to_str().unwrap(), "--env", "staging", "-y"]).unwrap();
        let target = cli.down.target().unwrap();
        assert_eq!(target.id, "custom-shared");
        assert_eq!(target.provider.name(), "custom");
    }

    #[test]
    #[serial_test::serial]
    fn test_name_conflicts_with_env() {
        std::env::remove_var(CONFIG_ENV);
        assert!(Cli::try_parse_from(["adhar", "--name", "dev", "--env", "prod"]).is_err());
        assert!(Cli::try_parse_from(["adhar", "--config", "platform.yaml"]).is_err());
    }
}
