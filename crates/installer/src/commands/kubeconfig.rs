//! `adhar kubeconfig`: export a cluster's kubeconfig.

use std::path::PathBuf;

use adhar_cloud::command::ProcessRunner;
use adhar_cloud::providers::registry;
use anyhow::{Context, Result};
use clap::Args;

use super::{load_config, CONFIG_ENV};
use crate::config::GlobalSettings;
use crate::kubeconfig::{default_kubeconfig_path, merge_kubeconfig, write_kubeconfig};
use crate::locator::ClusterLocator;
use crate::ui;

/// Print a cluster's kubeconfig, or merge it into ~/.kube/config.
#[derive(Args)]
pub struct KubeconfigCommand {
    /// Cluster id as shown by `adhar get clusters`
    #[arg(value_name = "ID")]
    id: String,

    /// Merge into ~/.kube/config and switch to the cluster's context
    #[arg(long)]
    merge: bool,

    /// Platform configuration file naming the providers to query
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV)]
    config: Option<PathBuf>,
}

impl KubeconfigCommand {
    pub async fn run(&self) -> Result<()> {
        let config = self.config.as_deref().map(load_config).transpose()?;
        let locator = ClusterLocator::from_config(config.as_ref(), registry::global())?;
        let contents = locator
            .kubeconfig(&self.id)
            .await
            .with_context(|| format!("Failed to get kubeconfig for {}", self.id))?;

        if !self.merge {
            print!("{contents}");
            return Ok(());
        }

        let output_dir = config
            .map_or_else(GlobalSettings::default, |c| c.global_settings)
            .output_dir();
        let path = write_kubeconfig(&output_dir, &self.id, &contents).await?;
        let target = default_kubeconfig_path().context("Cannot determine the home directory")?;
        merge_kubeconfig(&ProcessRunner, &path, &target, &self.id).await?;
        ui::print_success(&format!("Merged {} into {}", self.id, target.display()));
        Ok(())
    }
}
