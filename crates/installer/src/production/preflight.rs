//! Pre-flight checks run before any cloud resource is created.

use std::time::Duration;

use adhar_cloud::command::CommandRunner;
use adhar_cloud::providers::{Credentials, QuotaReport};
use adhar_cloud::{ClusterSpec, Provider};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ResolvedEnvironment;
use crate::tools;
use crate::ui;

/// Upper bound on worker nodes when the provider has no quota API.
pub const GENERIC_NODE_LIMIT: u32 = 100;

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

/// Every check run for an environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    fn record(&mut self, name: &str, passed: bool, message: Option<String>, quiet: bool) {
        if !quiet {
            ui::print_check_result(name, passed, message.as_deref());
        }
        self.checks.push(CheckResult {
            name: name.to_string(),
            passed,
            message,
        });
    }

    /// Whether every check passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

/// Credentials from the string-valued provider settings.
#[must_use]
pub fn credentials(env: &ResolvedEnvironment) -> Credentials {
    env.provider_config
        .iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k.clone(), s.clone())),
            _ => None,
        })
        .collect()
}

/// Run tool, authentication, permission, quota and network checks.
///
/// Authentication, permission and quota failures abort immediately. A
/// failed network check is fatal too, after all checks have been printed.
///
/// # Errors
///
/// The first fatal check.
pub async fn run(
    provider: &dyn Provider,
    env: &ResolvedEnvironment,
    runner: &dyn CommandRunner,
    quiet: bool,
) -> Result<PreflightReport> {
    let mut report = PreflightReport::default();
    let name = provider.name().to_string();

    let required = tools::production_tools([env.provider_type.as_str()]);
    tools::require(runner, &required, quiet).await?;

    provider
        .authenticate(&credentials(env))
        .await
        .with_context(|| format!("Authentication with {name} failed"))?;
    report.record("authentication", true, None, quiet);

    provider
        .validate_permissions()
        .await
        .with_context(|| format!("Insufficient permissions on {name}"))?;
    report.record("permissions", true, None, quiet);

    let spec = env.cluster_spec();
    let quota = provider
        .quotas()
        .check_quotas(&spec)
        .await
        .context("Quota check failed")?;
    let quota_message = check_quota(&spec, &quota)?;
    report.record("quotas", true, Some(quota_message), quiet);

    match provider.api_endpoint() {
        Some(endpoint) => {
            let result = check_endpoint(endpoint).await;
            let passed = result.is_ok();
            report.record(
                "network",
                passed,
                Some(result.as_ref().map_or_else(|e| format!("{e:#}"), Clone::clone)),
                quiet,
            );
            result.with_context(|| format!("{name} API is not reachable"))?;
        }
        None => {
            debug!(provider = %name, "Provider has no API endpoint, skipping network check");
        }
    }

    info!(environment = %env.name, provider = %name, "Pre-flight checks passed");
    Ok(report)
}

fn check_quota(spec: &ClusterSpec, report: &QuotaReport) -> Result<String> {
    if report.checked {
        let exceeded = report.exceeded();
        if !exceeded.is_empty() {
            let lines: Vec<String> = exceeded
                .iter()
                .map(|i| format!("{} ({} used + {} needed > {})", i.resource, i.used, i.required, i.limit))
                .collect();
            bail!("quota exceeded: {}", lines.join(", "));
        }
        return Ok(format!("{} quota lines checked", report.items.len()));
    }

    let nodes = spec.total_nodes();
    if nodes == 0 {
        bail!("cluster {} requests no worker nodes", spec.name);
    }
    if nodes > GENERIC_NODE_LIMIT {
        bail!("cluster {} requests {nodes} nodes, more than the {GENERIC_NODE_LIMIT} allowed without a quota check", spec.name);
    }
    warn!(provider = %spec.provider, "Provider has no quota API, only the node count was checked");
    Ok(format!("{nodes} nodes requested, provider quotas not checked"))
}

/// Resolve the endpoint host and make one HTTP request to it. Any HTTP
/// response, including 401/403, counts as reachable.
async fn check_endpoint(endpoint: &str) -> Result<String> {
    let url = reqwest::Url::parse(endpoint).with_context(|| format!("invalid endpoint {endpoint}"))?;
    let host = url.host_str().context("endpoint has no host")?;
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("DNS lookup of {host} failed"))?
        .collect();
    if addrs.is_empty() {
        bail!("DNS lookup of {host} returned no addresses");
    }

    let client = reqwest::Client::builder()
        .timeout(REACHABILITY_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")?;
    let response = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("{endpoint} did not respond"))?;
    Ok(format!("{host} resolved, HTTP {}", response.status().as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use adhar_cloud::providers::QuotaItem;
    use adhar_cloud::testing::{FakeProvider, ScriptedRunner};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn environment() -> ResolvedEnvironment {
        PlatformConfig::from_yaml(
            r"
providers:
  fake:
    region: nyc3
    token: abc
environments:
  dev:
    provider: fake
    clusterConfig:
      nodeCount: 3
",
        )
        .unwrap()
        .resolve("dev")
        .unwrap()
    }

    fn runner() -> ScriptedRunner {
        let runner = ScriptedRunner::new();
        for tool in ["kubectl", "helm", "git"] {
            runner.install_program(tool);
        }
        runner
    }

    #[tokio::test]
    async fn test_all_checks_pass_against_reachable_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let provider = FakeProvider::new("fake").with_endpoint(&server.uri());

        let report = run(&provider, &environment(), &runner(), true).await.unwrap();

        assert!(report.passed());
        let names: Vec<_> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["authentication", "permissions", "quotas", "network"]);
        assert!(report.checks[3].message.as_deref().unwrap().contains("HTTP 401"));
        assert_eq!(
            provider.calls(),
            ["authenticate", "validate_permissions", "check_quotas"]
        );
    }

    #[tokio::test]
    async fn test_auth_failure_stops_before_quota() {
        let provider = FakeProvider::new("fake").with_failing_auth("token revoked");
        let err = run(&provider, &environment(), &runner(), true).await.unwrap_err();
        assert!(format!("{err:#}").contains("token revoked"));
        assert_eq!(provider.calls(), ["authenticate"]);
    }

    #[tokio::test]
    async fn test_exceeded_quota_is_fatal() {
        let provider = FakeProvider::new("fake").with_quota(QuotaReport {
            checked: true,
            items: vec![QuotaItem {
                resource: "droplets".to_string(),
                used: 9,
                limit: 10,
                required: 3,
            }],
        });
        let err = run(&provider, &environment(), &runner(), true).await.unwrap_err();
        assert!(format!("{err:#}").contains("droplets (9 used + 3 needed > 10)"));
    }

    #[test]
    fn test_generic_quota_fallback_bounds_node_count() {
        let mut spec = ClusterSpec::new("fake", "big");
        spec.node_groups[0].replicas = GENERIC_NODE_LIMIT + 1;
        assert!(check_quota(&spec, &QuotaReport::unchecked()).is_err());
        spec.node_groups[0].replicas = 3;
        assert!(check_quota(&spec, &QuotaReport::unchecked())
            .unwrap()
            .contains("not checked"));
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint_fails_network_check() {
        let provider = FakeProvider::new("fake").with_endpoint("https://api.invalid");
        let err = run(&provider, &environment(), &runner(), true).await.unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }

    #[test]
    fn test_credentials_take_string_settings() {
        let creds = credentials(&environment());
        assert_eq!(creds.get("token"), Some("abc"));
        assert_eq!(creds.get("region"), Some("nyc3"));
    }
}
