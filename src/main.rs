use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "mender")]
#[command(version, about = "Automated remediation of recurring build failures")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliStatus {
    Success,
    Failure,
}

#[derive(Subcommand)]
pub enum Commands {
    /// React to one observed build outcome
    Run {
        /// Observed build status
        #[arg(long, value_enum)]
        status: CliStatus,

        /// Branch the build ran on (defaults to the checked-out branch)
        #[arg(long)]
        branch: Option<String>,

        /// Path to the failure log
        #[arg(long)]
        log: Option<PathBuf>,

        /// Worker identity (defaults to $BUILD_FLAVOR, then a generated id)
        #[arg(long)]
        worker: Option<String>,

        /// Write the structured result as JSON to this path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            status,
            branch,
            log,
            worker,
            output,
        } => {
            cmd::run_remediation(
                &project_dir,
                *status,
                branch.clone(),
                log.as_deref(),
                worker.clone(),
                output.as_deref(),
            )
            .await?;
        }
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, command.clone())?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "mender=debug" } else { "mender=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
