//! `adhar get`: inspect provisioned resources.

use std::path::PathBuf;

use adhar_cloud::providers::registry;
use adhar_cloud::Cluster;
use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::warn;

use super::{load_config, CONFIG_ENV};
use crate::locator::ClusterLocator;
use crate::ui;

/// Show provisioned resources.
#[derive(Args)]
pub struct GetCommand {
    #[command(subcommand)]
    resource: Resource,
}

#[derive(Subcommand)]
enum Resource {
    /// List clusters across every configured provider
    Clusters(ClustersArgs),
}

#[derive(Args)]
struct ClustersArgs {
    /// Platform configuration file naming the providers to query
    #[arg(short, long, value_name = "FILE", env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

impl GetCommand {
    pub async fn run(&self) -> Result<()> {
        match &self.resource {
            Resource::Clusters(args) => args.run().await,
        }
    }
}

impl ClustersArgs {
    async fn run(&self) -> Result<()> {
        let config = self.config.as_deref().map(load_config).transpose()?;
        let locator = ClusterLocator::from_config(config.as_ref(), registry::global())?;

        let mut clusters = Vec::new();
        for (provider, result) in locator.list().await {
            match result {
                Ok(found) => clusters.extend(found),
                Err(e) if e.is_not_supported() => {}
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Failed to list clusters");
                    ui::print_warning(&format!("{provider}: {e}"));
                }
            }
        }
        clusters.sort_by(|a, b| a.id.cmp(&b.id));

        match self.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&clusters)?),
            OutputFormat::Table if clusters.is_empty() => ui::print_info("No clusters found"),
            OutputFormat::Table => {
                let rows = table(&clusters, Utc::now());
                println!("{}", rows[0].bold());
                for row in &rows[1..] {
                    println!("{row}");
                }
            }
        }
        Ok(())
    }
}

const HEADERS: [&str; 6] = ["ID", "PROVIDER", "REGION", "VERSION", "STATUS", "AGE"];

/// Aligned table lines, header first.
fn table(clusters: &[Cluster], now: DateTime<Utc>) -> Vec<String> {
    let cells: Vec<[String; 6]> = clusters
        .iter()
        .map(|c| {
            [
                c.id.clone(),
                c.provider.clone(),
                or_dash(&c.region),
                or_dash(&c.version),
                c.status.to_string(),
                age(c.created_at, now),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let render = |row: &[&str]| {
        row.iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![render(&HEADERS)];
    lines.extend(
        cells
            .iter()
            .map(|row| render(&row.each_ref().map(String::as_str))),
    );
    lines
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

fn age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now - created;
    if elapsed.num_days() > 0 {
        format!("{}d", elapsed.num_days())
    } else if elapsed.num_hours() > 0 {
        format!("{}h", elapsed.num_hours())
    } else if elapsed.num_minutes() > 0 {
        format!("{}m", elapsed.num_minutes())
    } else {
        format!("{}s", elapsed.num_seconds().max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adhar_cloud::{ClusterSpec, ClusterStatus};
    use chrono::Duration;

    #[test]
    fn test_table_aligns_columns() {
        let now = Utc::now();
        let mut local = Cluster::new("kind", &ClusterSpec::new("kind", "adhar"));
        local.transition(ClusterStatus::Running);
        local.created_at = now - Duration::hours(3);
        let mut remote = Cluster::new("digitalocean", &ClusterSpec::new("digitalocean", "prod"));
        remote.region = "nyc3".to_string();
        remote.version = "1.30.1".to_string();
        remote.created_at = now - Duration::days(2);

        let lines = table(&[local, remote], now);

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID"));
        assert!(lines[1].starts_with("kind-adhar "));
        assert!(lines[1].contains("running"));
        assert!(lines[1].ends_with("3h"));
        assert!(lines[2].contains("nyc3"));
        assert!(lines[2].ends_with("2d"));
        let status_column = lines[0].find("STATUS").unwrap();
        assert_eq!(lines[2].find("creating"), Some(status_column));
    }

    #[test]
    fn test_age_units() {
        let now = Utc::now();
        assert_eq!(age(now - Duration::seconds(42), now), "42s");
        assert_eq!(age(now - Duration::minutes(5), now), "5m");
        assert_eq!(age(now + Duration::seconds(5), now), "0s");
    }
}
