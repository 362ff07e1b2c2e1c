//! Prerequisite CLI tools.

use adhar_cloud::command::CommandRunner;
use anyhow::{bail, Result};
use tracing::debug;

use crate::ui;

/// An external program the installer shells out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tool {
    /// Executable name.
    pub name: &'static str,
    /// Whether provisioning cannot proceed without it.
    pub required: bool,
    /// Install hint shown when missing.
    pub hint: &'static str,
}

impl Tool {
    const fn required(name: &'static str, hint: &'static str) -> Self {
        Self {
            name,
            required: true,
            hint,
        }
    }

    const fn optional(name: &'static str, hint: &'static str) -> Self {
        Self {
            name,
            required: false,
            hint,
        }
    }
}

const KUBECTL: Tool = Tool::required("kubectl", "https://kubernetes.io/docs/tasks/tools/");
const HELM: Tool = Tool::required("helm", "https://helm.sh/docs/intro/install/");
const GIT: Tool = Tool::required("git", "https://git-scm.com/downloads");

/// Tools needed for a local platform.
#[must_use]
pub fn local_tools() -> Vec<Tool> {
    vec![
        Tool::required("docker", "https://docs.docker.com/get-docker/"),
        Tool::required("kind", "https://kind.sigs.k8s.io/docs/user/quick-start/"),
        KUBECTL,
        HELM,
        GIT,
        Tool::optional("cilium", "falls back to kubectl apply of the Cilium manifest"),
    ]
}

/// Tools needed to provision through the given provider types.
#[must_use]
pub fn production_tools<'a>(provider_types: impl IntoIterator<Item = &'a str>) -> Vec<Tool> {
    let mut tools = vec![KUBECTL, HELM, GIT];
    for provider in provider_types {
        match provider {
            "aws" => {
                tools.push(Tool::required("aws", "https://aws.amazon.com/cli/"));
                tools.push(Tool::required("eksctl", "https://eksctl.io/installation/"));
            }
            "kind" => tools.extend(local_tools()),
            _ => {}
        }
    }
    tools.sort_by_key(|t| t.name);
    tools.dedup_by_key(|t| t.name);
    tools
}

/// Result of a prerequisite check.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ToolReport {
    /// Required tools that are missing.
    pub missing_required: Vec<&'static str>,
    /// Optional tools that are missing.
    pub missing_optional: Vec<&'static str>,
}

impl ToolReport {
    /// Whether every required tool is present.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.missing_required.is_empty()
    }
}

/// Look up every tool and print one line per tool unless `quiet`.
pub async fn check(runner: &dyn CommandRunner, tools: &[Tool], quiet: bool) -> ToolReport {
    let mut report = ToolReport::default();
    for tool in tools {
        let found = runner.exists(tool.name).await;
        debug!(tool = tool.name, found, "Checked prerequisite");
        if !quiet {
            ui::print_check_result(tool.name, found, (!found).then_some(tool.hint));
        }
        if !found {
            if tool.required {
                report.missing_required.push(tool.name);
            } else {
                report.missing_optional.push(tool.name);
            }
        }
    }
    report
}

/// Fail unless every required tool is installed.
///
/// # Errors
///
/// Lists the missing required tools.
pub async fn require(runner: &dyn CommandRunner, tools: &[Tool], quiet: bool) -> Result<ToolReport> {
    let report = check(runner, tools, quiet).await;
    if !report.ok() {
        bail!(
            "missing required tools: {}",
            report.missing_required.join(", ")
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use adhar_cloud::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_missing_required_tool_fails() {
        let runner = ScriptedRunner::new();
        for program in ["docker", "kind", "kubectl", "helm"] {
            runner.install_program(program);
        }
        let err = require(&runner, &local_tools(), true).await.unwrap_err();
        assert_eq!(err.to_string(), "missing required tools: git");
    }

    #[tokio::test]
    async fn test_missing_optional_tool_is_reported_only() {
        let runner = ScriptedRunner::new();
        for program in ["docker", "kind", "kubectl", "helm", "git"] {
            runner.install_program(program);
        }
        let report = require(&runner, &local_tools(), true).await.unwrap();
        assert_eq!(report.missing_optional, vec!["cilium"]);
    }

    #[test]
    fn test_production_tools_per_provider() {
        let names: Vec<_> = production_tools(["aws", "digitalocean"])
            .iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["aws", "eksctl", "git", "helm", "kubectl"]);
    }
}
