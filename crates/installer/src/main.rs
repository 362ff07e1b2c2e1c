//! Adhar platform CLI.
//!
//! Provisions a local kind platform or cloud environments from a
//! declarative configuration file and bootstraps GitOps on top.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use adhar_cli::commands::down::DownCommand;
use adhar_cli::commands::get::GetCommand;
use adhar_cli::commands::kubeconfig::KubeconfigCommand;
use adhar_cli::commands::up::UpCommand;
use adhar_cli::commands::validate::ValidateCommand;
use adhar_cli::RunContext;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Adhar - internal developer platform provisioning.
#[derive(Parser)]
#[command(
    name = "adhar",
    version,
    about = "Adhar platform provisioning CLI",
    long_about = "Provision the Adhar internal developer platform.\n\n\
                  Without a configuration file `adhar up` creates a local kind\n\
                  cluster; with one it provisions every configured cloud\n\
                  environment and bootstraps Argo CD and Gitea on each.\n\n\
                  Re-running a command reuses clusters that already exist."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a cluster and install the platform.
    ///
    /// Runs the local pipeline when no configuration file is given,
    /// otherwise provisions the configured environments.
    Up(UpCommand),

    /// Delete a cluster.
    Down(DownCommand),

    /// Show provisioned resources.
    Get(GetCommand),

    /// Print or merge a cluster's kubeconfig.
    Kubeconfig(KubeconfigCommand),

    /// Validate a platform configuration file.
    Validate(ValidateCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("info,adhar_cli=debug,adhar_cloud=debug")
        } else {
            EnvFilter::new("warn,adhar_cli=info,adhar_cloud=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Up(cmd) => {
            let ctx = RunContext::new();
            ctx.install_interrupt_handler();
            cmd.run(ctx).await
        }
        Commands::Down(cmd) => cmd.run().await,
        Commands::Get(cmd) => cmd.run().await,
        Commands::Kubeconfig(cmd) => cmd.run().await,
        Commands::Validate(cmd) => cmd.run().await,
    }
}
