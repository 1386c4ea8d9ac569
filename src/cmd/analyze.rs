//! Workflow parameter discovery: `trendsmith analyze <script>`.

use anyhow::{Context, Result};
use std::path::Path;

pub fn cmd_analyze(project_dir: &Path, script: &Path, json: bool, save: bool) -> Result<()> {
    use trendsmith::analyzer::{SlotMapping, analyze_with_roles};
    use trendsmith::config::TrendsmithConfig;
    use trendsmith::ui::icons::CHECK;
    use trendsmith::ui::progress::print_slots;

    let config = TrendsmithConfig::new(project_dir.to_path_buf())?;
    let script = config.resolve(script);
    let text = std::fs::read_to_string(&script)
        .with_context(|| format!("Failed to read workflow script: {}", script.display()))?;

    let overrides = config.role_overrides(&script);
    let slots = analyze_with_roles(&text, &overrides)
        .with_context(|| format!("Failed to analyze {}", script.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&slots).context("Failed to serialize slots")?
        );
    } else {
        println!("Parameters in {}:", script.display());
        print_slots(&slots);
    }

    if save {
        let path = SlotMapping::path_for(&config.workflows_dir(), &script);
        SlotMapping::new(&script, slots).save(&path)?;
        if !json {
            println!("{}Saved slot mapping to {}", CHECK, path.display());
        }
    }
    Ok(())
}
