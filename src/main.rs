use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod cmd;

#[derive(Parser)]
#[command(name = "trendsmith")]
#[command(version, about = "Turn trending posts into t-shirt designs")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a full session: scan, transform, generate, organize
    Run {
        /// Subreddit to scan (repeatable). Overrides [scan].subreddits
        #[arg(short, long)]
        subreddit: Vec<String>,

        /// Workflow script for the generation engine
        #[arg(short, long)]
        workflow: Option<PathBuf>,

        /// Stop after scanning
        #[arg(long)]
        no_transform: bool,

        /// Stop after transforming
        #[arg(long)]
        no_generate: bool,

        /// UI output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
    },
    /// Find the overridable parameters in a workflow script
    Analyze {
        /// Path to the workflow script
        script: PathBuf,

        /// Print slots as JSON
        #[arg(long)]
        json: bool,

        /// Save the slot mapping under .trendsmith/workflows for later runs
        #[arg(long)]
        save: bool,
    },
    /// Check which engine execution path is usable
    Probe,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default trendsmith.toml file
    Init,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "trendsmith=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            subreddit,
            workflow,
            no_transform,
            no_generate,
            ui,
        } => {
            cmd::cmd_run(
                &cli,
                project_dir,
                subreddit.clone(),
                workflow.clone(),
                *no_transform,
                *no_generate,
                ui,
            )
            .await?;
        }
        Commands::Analyze { script, json, save } => {
            cmd::cmd_analyze(&project_dir, script, *json, *save)?;
        }
        Commands::Probe => cmd::cmd_probe(&cli, project_dir).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
