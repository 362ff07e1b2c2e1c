//! `adhar validate`: check a platform configuration file.

use std::path::PathBuf;

use adhar_cloud::providers::registry;
use adhar_cloud::ProviderRegistry;
use anyhow::{bail, Result};
use clap::Args;

use super::{load_config, CONFIG_ENV};
use crate::config::PlatformConfig;
use crate::production::preflight::CheckResult;
use crate::ui;

/// Validate a platform configuration file without provisioning anything.
#[derive(Args)]
pub struct ValidateCommand {
    /// Platform configuration file
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV)]
    config: PathBuf,
}

impl ValidateCommand {
    /// # Errors
    ///
    /// Unreadable files and any failed check.
    pub async fn run(&self) -> Result<()> {
        ui::print_section(&format!("Validating {}", self.config.display()));
        let config = load_config(&self.config)?;

        let checks = checks(&config, registry::global());
        for check in &checks {
            ui::print_check_result(&check.name, check.passed, check.message.as_deref());
        }

        let failed = checks.iter().filter(|c| !c.passed).count();
        if failed > 0 {
            bail!("Validation found {failed} problem(s)");
        }
        ui::print_success("Configuration is valid");
        Ok(())
    }
}

/// One check for the provider rules, one per provider entry and one per
/// environment.
fn checks(config: &PlatformConfig, registry: &ProviderRegistry) -> Vec<CheckResult> {
    let mut checks = vec![match config.validate_providers() {
        Ok(()) => CheckResult {
            name: "providers".to_string(),
            passed: true,
            message: config.primary_provider().map(|p| format!("primary: {p}")),
        },
        Err(e) => CheckResult {
            name: "providers".to_string(),
            passed: false,
            message: Some(e.to_string()),
        },
    }];

    for key in config.providers.keys() {
        let name = format!("provider {key}");
        checks.push(match config.provider_settings(key) {
            Ok((provider_type, _)) if registry.is_registered(&provider_type) => CheckResult {
                name,
                passed: true,
                message: Some(provider_type),
            },
            Ok((provider_type, _)) => CheckResult {
                name,
                passed: false,
                message: Some(format!("unknown provider type '{provider_type}'")),
            },
            Err(e) => CheckResult {
                name,
                passed: false,
                message: Some(e.to_string()),
            },
        });
    }

    for env in config.environments.keys() {
        let name = format!("environment {env}");
        checks.push(match config.resolve(env) {
            Ok(resolved) => CheckResult {
                name,
                passed: true,
                message: Some(format!("{} in {}", resolved.provider_key, resolved.region)),
            },
            Err(e) => CheckResult {
                name,
                passed: false,
                message: Some(e.to_string()),
            },
        });
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_file_passes_every_check() {
        let config = PlatformConfig::from_yaml(
            r"
providers:
  digitalocean:
    region: nyc3
environments:
  dev:
    provider: digitalocean
    clusterConfig:
      nodeCount: 2
",
        )
        .unwrap();

        let checks = checks(&config, &ProviderRegistry::with_builtins());
        let names: Vec<_> = checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["providers", "provider digitalocean", "environment dev"]);
        assert!(checks.iter().all(|c| c.passed));
        assert_eq!(checks[2].message.as_deref(), Some("digitalocean in nyc3"));
    }

    #[test]
    fn test_problems_are_reported_per_entry() {
        let config = PlatformConfig::from_yaml(
            r"
providers:
  vultr:
    region: ams
environments:
  dev:
    provider: vultr
  prod:
    provider: vultr
    clusterConfig:
      name: prod-1
",
        )
        .unwrap();

        let checks = checks(&config, &ProviderRegistry::with_builtins());
        let failed: Vec<_> = checks.iter().filter(|c| !c.passed).map(|c| c.name.as_str()).collect();
        assert_eq!(failed, ["provider vultr", "environment dev"]);
    }
}
