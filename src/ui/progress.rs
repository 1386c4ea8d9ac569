//! Session progress UI.
//!
//! Renders progress events from a running session. Output modes:
//! - `full`: stage spinners with per-item lines and colors
//! - `minimal`: one line per stage change, error and final result
//! - `json`: one JSON event per line for machine consumption

use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use crate::analyzer::ParameterSlot;
use crate::progress::{EventKind, EventPayload, ProgressEvent};
use crate::session::{SessionStage, SessionState, StageKind};
use crate::ui::icons::{
    CHECK, CROSS, GENERATE, ORGANIZE, SCAN, SLOT, SPARKLE, STOP, TRANSFORM, WARN,
};

/// Output mode for the session UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    /// Spinners and colored per-item lines
    #[default]
    Full,
    /// Single-line status updates
    Minimal,
    /// JSON-formatted events
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Tallies for the stage currently on screen.
#[derive(Debug)]
struct StageBar {
    bar: ProgressBar,
    stage: SessionStage,
    succeeded: usize,
    failed: usize,
}

fn stage_icon(stage: SessionStage) -> console::Emoji<'static, 'static> {
    match stage.executor() {
        Some(StageKind::Scan) => SCAN,
        Some(StageKind::Transform) => TRANSFORM,
        Some(StageKind::Generate) => GENERATE,
        Some(StageKind::Organize) => ORGANIZE,
        None => SPARKLE,
    }
}

/// Terminal renderer for one session.
///
/// Events are handled from a single task; the mutex only guards the stage
/// bar between `handle_event` and `finish`.
pub struct SessionUI {
    mode: UiMode,
    multi: MultiProgress,
    current: Mutex<Option<StageBar>>,
    verbose: bool,
    term: Term,
}

impl SessionUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        Self {
            mode,
            multi: MultiProgress::new(),
            current: Mutex::new(None),
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn handle_event(&self, event: &ProgressEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => self.handle_minimal(event),
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &ProgressEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn handle_minimal(&self, event: &ProgressEvent) {
        match event.kind {
            EventKind::StageTransition | EventKind::Terminal => {
                let _ = writeln!(&self.term, "{}", event.message);
            }
            EventKind::Error => {
                let _ = writeln!(&self.term, "✗ {}", event.message);
            }
            EventKind::Warning if self.verbose => {
                let _ = writeln!(&self.term, "! {}", event.message);
            }
            _ => {}
        }
    }

    fn handle_full(&self, event: &ProgressEvent) {
        match (&event.kind, &event.payload) {
            (EventKind::StageTransition, Some(EventPayload::Transition { to, .. })) => {
                self.on_stage_started(*to);
            }
            (EventKind::Success, _) => {
                self.bump(true);
                if self.verbose {
                    self.print_line(format!("  {}{}", CHECK, event.message));
                }
            }
            (EventKind::Error, _) => {
                if event.item_id().is_some() {
                    self.bump(false);
                }
                self.print_line(format!("  {}{}", CROSS, style(&event.message).red()));
            }
            (EventKind::Warning, _) => {
                self.print_line(format!("  {}{}", WARN, style(&event.message).yellow()));
            }
            (EventKind::Info, _) => {
                if self.verbose {
                    self.print_line(format!("  {}", style(&event.message).dim()));
                }
            }
            (EventKind::Terminal, _) => self.close_stage(),
            _ => {}
        }
    }

    fn on_stage_started(&self, stage: SessionStage) {
        self.close_stage();
        if stage.is_terminal() {
            return;
        }
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {prefix:.bold} {msg}")
                .expect("progress bar template is a valid static string"),
        );
        bar.set_prefix(format!("{}{}", stage_icon(stage), stage));
        bar.set_message("starting...");
        bar.enable_steady_tick(Duration::from_millis(100));
        let mut current = self.current.lock().unwrap();
        *current = Some(StageBar {
            bar,
            stage,
            succeeded: 0,
            failed: 0,
        });
    }

    fn bump(&self, success: bool) {
        let mut current = self.current.lock().unwrap();
        if let Some(state) = current.as_mut() {
            if success {
                state.succeeded += 1;
            } else {
                state.failed += 1;
            }
            state.bar.set_message(format!(
                "{} ok, {} failed",
                style(state.succeeded).green(),
                style(state.failed).red()
            ));
        }
    }

    fn close_stage(&self) {
        let mut current = self.current.lock().unwrap();
        if let Some(state) = current.take() {
            state.bar.finish_with_message(format!(
                "{} {} ok, {} failed",
                if state.failed == 0 { CHECK } else { WARN },
                state.succeeded,
                state.failed
            ));
            tracing::trace!(stage = %state.stage, "stage bar closed");
        }
    }

    /// Print above the bars, or to stderr when no terminal is attached.
    fn print_line(&self, line: String) {
        if self.multi.println(&line).is_err() {
            eprintln!("{}", line);
        }
    }

    /// Print the final summary of a session.
    pub fn finish(&self, state: &SessionState) {
        self.close_stage();
        if self.mode == UiMode::Json {
            if let Ok(json) = serde_json::to_string(state) {
                let _ = writeln!(&self.term, "{}", json);
            }
            return;
        }

        let (icon, verdict) = match state.stage {
            SessionStage::Completed => (SPARKLE, style("completed").green().bold()),
            SessionStage::Cancelled => (STOP, style("cancelled").yellow().bold()),
            _ => (CROSS, style("failed").red().bold()),
        };
        let _ = writeln!(&self.term);
        let _ = writeln!(&self.term, "{}Session {}", icon, verdict);
        if let Some(reason) = &state.failure {
            let _ = writeln!(&self.term, "   {}", style(reason).red());
        }
        if self.mode == UiMode::Minimal {
            return;
        }
        for stage in StageKind::ALL {
            let counters = state.counters.get(stage);
            if counters.attempted == 0 {
                continue;
            }
            let _ = writeln!(
                &self.term,
                "   {:<10} {} attempted, {} succeeded, {} failed",
                stage.to_string(),
                counters.attempted,
                style(counters.succeeded).green(),
                style(counters.failed).red()
            );
        }
        if let Some(path) = state.execution_path {
            let _ = writeln!(&self.term, "   engine     {}", style(path).cyan());
        }
        if let Some(ended) = state.ended_at {
            let elapsed = (ended - state.started_at).to_std().unwrap_or_default();
            let _ = writeln!(
                &self.term,
                "   duration   {}",
                style(format_duration(elapsed)).cyan()
            );
        }
    }
}

/// Print the slots found in a workflow script.
pub fn print_slots(slots: &[ParameterSlot]) {
    if slots.is_empty() {
        println!("{}No overridable parameters found", WARN);
        return;
    }
    for slot in slots {
        println!(
            "{}{:<14} {:<24} {}",
            SLOT,
            style(slot.role).cyan(),
            style(&slot.name).bold(),
            style(&slot.value).dim()
        );
    }
}

/// Format a duration for display.
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
