//! Configuration view and validation commands: `trendsmith config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use trendsmith::config::{CONFIG_DIR, CONFIG_FILE, TrendsmithConfig, TrendsmithToml};

    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Trendsmith Configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = TrendsmithConfig::new(project_dir.to_path_buf())?;
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Effective values (with env overrides):");
            println!("  model endpoint = \"{}\"", config.model_endpoint());
            println!("  engine endpoint = \"{}\"", config.comfy_endpoint());
            println!("  python = \"{}\"", config.python());
            match config.workflow_script() {
                Some(script) => println!("  workflow = \"{}\"", script.display()),
                None => println!("  workflow = (none)"),
            }
            println!("  output = \"{}\"", config.output_dir().display());
            println!();

            if !config_path.exists() {
                println!("Run 'trendsmith config init' to create a {} file.", CONFIG_FILE);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = TrendsmithConfig::new(project_dir.to_path_buf())?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(config_dir.join("workflows"))
                .with_context(|| format!("Failed to create {}", config_dir.display()))?;

            TrendsmithToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [scan] subreddits, min_score, max_posts, time_filter");
            println!("  - [model] endpoint, model");
            println!("  - [engine] api_endpoint, python, engine_dir, executor");
            println!("  - [workflow] script, roles");
            println!();
        }
    }

    Ok(())
}
