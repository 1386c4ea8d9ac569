//! Engine capability check: `trendsmith probe`.

use anyhow::Result;
use console::style;
use std::path::PathBuf;
use std::time::Duration;

use super::super::Cli;

pub async fn cmd_probe(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    use trendsmith::bridge::ExecutionBridge;
    use trendsmith::config::TrendsmithConfig;
    use trendsmith::ui::icons::{CHECK, CROSS};

    let config = TrendsmithConfig::with_cli_args(project_dir, cli.verbose, Vec::new(), None)?;
    let collaborators = config.collaborators();
    let bridge = ExecutionBridge::new(
        collaborators.in_process,
        collaborators.subprocess,
        Duration::from_secs(config.toml.engine.probe_timeout_secs),
    );

    println!("Probing engine at {} ...", config.comfy_endpoint());
    match bridge.select_path().await {
        Ok(path) => {
            println!("{}Execution path: {}", CHECK, style(path).green().bold());
            Ok(())
        }
        Err(e) => {
            println!("{}{}", CROSS, style(&e).red());
            anyhow::bail!("No usable engine execution path")
        }
    }
}
