//! Full pipeline session: `trendsmith run`.

use anyhow::{Context, Result};
use console::style;
use std::path::PathBuf;

use super::super::Cli;

pub async fn cmd_run(
    cli: &Cli,
    project_dir: PathBuf,
    subreddits: Vec<String>,
    workflow: Option<PathBuf>,
    no_transform: bool,
    no_generate: bool,
    ui_mode: &str,
) -> Result<()> {
    use trendsmith::config::TrendsmithConfig;
    use trendsmith::organizer::FileOrganizer;
    use trendsmith::progress::EventKind;
    use trendsmith::session::{SessionController, SessionStage};
    use trendsmith::ui::{SessionUI, UiMode};

    let config = TrendsmithConfig::with_cli_args(project_dir, cli.verbose, subreddits, workflow)?;
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }

    let mut session_config = config.session_config();
    if no_transform {
        session_config.auto_transform = false;
    }
    if no_generate {
        session_config.auto_generate = false;
    }

    let controller = SessionController::new(config.collaborators());
    let mut handle = controller
        .start(&session_config)
        .await
        .context("Failed to start session")?;
    tracing::info!(session_id = %handle.id(), "session started");

    let ui = SessionUI::new(UiMode::parse(ui_mode), cli.verbose);
    let mut events = handle
        .subscribe()
        .context("Progress channel already taken")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                ui.handle_event(&event);
                if event.kind == EventKind::Terminal {
                    break;
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                eprintln!("{}", style("Cancelling: waiting for running items to finish...").yellow());
                controller.cancel(&handle);
            }
        }
    }
    drop(events);

    let state = handle.wait().await;
    ui.finish(&state);

    if state.stage != SessionStage::Failed && ui_mode != "json" {
        let organizer = FileOrganizer::new(config.output_dir());
        let summary = organizer.summary().await;
        println!(
            "   output     {} ({} designs, {} prompts, {} metadata, {} logs)",
            organizer.base_dir().display(),
            summary.designs,
            summary.prompts,
            summary.metadata,
            summary.logs
        );
    }

    if state.stage == SessionStage::Failed {
        anyhow::bail!(
            "Session failed: {}",
            state.failure.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
