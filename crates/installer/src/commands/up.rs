//! `adhar up`: provision a local or cloud platform.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use adhar_cloud::command::{CommandRunner, ProcessRunner};
use adhar_cloud::providers::{registry, DEFAULT_PROVIDER};
use adhar_cloud::{ProviderConfig, ProviderRegistry};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::{load_config, CONFIG_ENV};
use crate::cluster::{ClusterConnector, KubeConnector, PlatformCluster};
use crate::config::{CoreServices, GlobalSettings};
use crate::context::RunContext;
use crate::local::{ControllerManager, LocalOptions, LocalPipeline, ManagerFactory, DEFAULT_CLUSTER_NAME};
use crate::pipeline::PipelineReport;
use crate::production::{EnvironmentResult, Plan, ProductionOptions, ProviderManager};
use crate::reconciler::PlatformReconciler;
use crate::tools;
use crate::ui::{self, ConsoleSink};

/// Provision the platform.
#[derive(Args)]
pub struct UpCommand {
    /// Platform configuration file. Without one a local kind platform is created.
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Provision only this environment from the configuration file
    #[arg(short, long, value_name = "NAME", requires = "config")]
    env: Option<String>,

    /// Show what would be created without creating anything
    #[arg(long)]
    dry_run: bool,

    /// Exit once the platform has synced instead of keeping the controller running
    #[arg(long)]
    exit_on_sync: bool,

    /// Name of the local cluster
    #[arg(long, value_name = "NAME", default_value = DEFAULT_CLUSTER_NAME)]
    name: String,

    /// Do not merge the kubeconfig into ~/.kube/config
    #[arg(long)]
    no_merge: bool,
}

impl UpCommand {
    pub async fn run(&self, ctx: RunContext) -> Result<()> {
        ui::print_banner();
        let ctx = ctx.with_exit_on_sync(self.exit_on_sync);
        match &self.config {
            Some(path) => self.run_production(path, ctx).await,
            None => self.run_local(ctx).await,
        }
    }

    fn local_options(&self) -> LocalOptions {
        LocalOptions {
            cluster_name: self.name.clone(),
            merge_kubeconfig: !self.no_merge,
            ..LocalOptions::default()
        }
    }

    async fn run_local(&self, ctx: RunContext) -> Result<()> {
        ui::print_section("Local platform");
        let options = self.local_options();
        let provider = registry::global()
            .get_or_create(DEFAULT_PROVIDER, &ProviderConfig::new())
            .context("Failed to create the local provider")?;

        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        let connector: Arc<dyn ClusterConnector> = Arc::new(KubeConnector::new(Arc::clone(&runner)));
        let pipeline = LocalPipeline::new(
            provider,
            connector,
            Arc::clone(&runner),
            reconciler_factory(Arc::clone(&runner), options.settings.clone(), options.core_services.clone()),
            options.clone(),
        );

        if self.dry_run {
            let plan = Plan {
                environment: "local".to_string(),
                provider: DEFAULT_PROVIDER.to_string(),
                spec: pipeline.cluster_spec(),
                core_services: options.core_services.enabled_summary(),
                addons: Vec::new(),
                cost: None,
            };
            print_plan(&plan);
            return Ok(());
        }

        tools::require(runner.as_ref(), &tools::local_tools(), false).await?;
        let sink = ConsoleSink::new(ctx.suppress_output());
        let outcome = pipeline.run(&ctx, &sink).await?;

        println!();
        print_report(&outcome.report);
        if let Some(id) = &outcome.cluster_id {
            ui::print_kv("Cluster", id);
        }
        if let Some(path) = &outcome.kubeconfig_path {
            ui::print_kv("Kubeconfig", &path.display().to_string());
        }
        print_urls(&options.settings);
        if ctx.cancelled_by_sync() {
            ui::print_info("Platform synced, controller stopped");
        }
        Ok(())
    }

    async fn run_production(&self, path: &Path, ctx: RunContext) -> Result<()> {
        let config = load_config(path)?;
        ui::print_section(&format!("Cloud platform from {}", path.display()));

        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        let connector: Arc<dyn ClusterConnector> = Arc::new(KubeConnector::new(Arc::clone(&runner)));
        let options = ProductionOptions {
            dry_run: self.dry_run,
            ..ProductionOptions::default()
        };
        let manager = ProviderManager::new(
            config,
            Arc::new(ProviderRegistry::with_builtins()),
            runner,
            connector,
            options,
        );

        let sink = ConsoleSink::new(ctx.suppress_output());
        let report = match self.env.as_deref() {
            Some(name) => manager.run(Some(name), &ctx, &sink).await?,
            None => {
                let report = manager.provision_all(&ctx, &sink).await;
                for (name, result) in &report.environments {
                    print_environment(name, result);
                }
                println!();
                return report.into_result().map(|report| {
                    ui::print_success(&report.summary());
                });
            }
        };
        for (name, result) in &report.environments {
            print_environment(name, result);
        }
        Ok(())
    }
}

/// Each connected cluster gets its own platform reconciler.
fn reconciler_factory(
    runner: Arc<dyn CommandRunner>,
    settings: GlobalSettings,
    services: CoreServices,
) -> ManagerFactory {
    Arc::new(move |cluster: Arc<dyn PlatformCluster>| {
        Arc::new(
            PlatformReconciler::new(cluster, Arc::clone(&runner), settings.clone())
                .with_core_services(services.clone()),
        ) as Arc<dyn ControllerManager>
    })
}

fn print_plan(plan: &Plan) {
    ui::print_section(&format!("Plan for {}", plan.environment));
    for line in plan.lines() {
        ui::print_list_item(&line);
    }
}

fn print_report(report: &PipelineReport) {
    let warnings = report.warnings();
    for (phase, message) in &warnings {
        ui::print_warning(&format!("{phase}: {message}"));
    }
    if warnings.is_empty() {
        ui::print_success(&report.summary());
    } else {
        ui::print_warning(&report.summary());
    }
}

fn print_environment(name: &str, result: &EnvironmentResult) {
    match result {
        EnvironmentResult::Planned(plan) => print_plan(plan),
        EnvironmentResult::Provisioned(outcome) => {
            ui::print_section(&format!("Environment {name}"));
            print_report(&outcome.report);
            if let Some(id) = &outcome.cluster_id {
                ui::print_kv("Cluster", id);
            }
            if let Some(path) = &outcome.kubeconfig_path {
                ui::print_kv("Kubeconfig", &path.display().to_string());
            }
        }
        EnvironmentResult::Failed(message) => {
            ui::print_error(&format!("{name}: {message}"));
        }
        EnvironmentResult::NotAttempted => {
            ui::print_warning(&format!("{name}: not attempted"));
        }
    }
}

fn print_urls(settings: &GlobalSettings) {
    let port = if settings.https_port == 443 {
        String::new()
    } else {
        format!(":{}", settings.https_port)
    };
    println!();
    println!("{}", "Endpoints".bold());
    ui::print_kv("Argo CD", &format!("https://argocd.{}{port}", settings.domain));
    ui::print_kv("Gitea", &format!("https://gitea.{}{port}", settings.domain));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        up: UpCommand,
    }

    #[test]
    fn test_local_defaults() {
        let cli = Cli::try_parse_from(["adhar"]).unwrap();
        let options = cli.up.local_options();
        assert_eq!(options.cluster_name, DEFAULT_CLUSTER_NAME);
        assert!(options.merge_kubeconfig);
        assert!(!cli.up.exit_on_sync);
    }

    #[test]
    fn test_name_and_merge_flags() {
        let cli = Cli::try_parse_from(["adhar", "--name", "dev", "--no-merge", "--exit-on-sync"]).unwrap();
        let options = cli.up.local_options();
        assert_eq!(options.cluster_name, "dev");
        assert!(!options.merge_kubeconfig);
        assert!(cli.up.exit_on_sync);
    }

    #[test]
    #[serial_test::serial]
    fn test_env_requires_config() {
        std::env::remove_var(CONFIG_ENV);
        assert!(Cli::try_parse_from(["adhar", "--env", "prod"]).is_err());
        let cli = Cli::try_parse_from(["adhar", "--config", "platform.yaml", "--env", "prod"]).unwrap();
        assert_eq!(cli.up.env.as_deref(), Some("prod"));
    }
}
