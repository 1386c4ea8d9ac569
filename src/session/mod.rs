//! Pipeline sessions.
//!
//! A [`SessionController`] starts one session at a time. The session runs
//! on its own tokio task; the caller observes it through the
//! [`SessionHandle`]: progress events (push) and state snapshots (pull).

mod controller;
mod state;

pub use controller::{Collaborators, SessionController};
pub use state::{
    SessionCounters, SessionStage, SessionState, StageCounters, StageKind, is_valid_transition,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::SlotRole;
use crate::collectors::SourceConfig;
use crate::progress::ProgressReceiver;
use crate::stages::{GenerationDefaults, RetryPolicy};

/// Everything one session run needs to know.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sources: Vec<SourceConfig>,
    /// Workflow script whose slots the Generate stage fills.
    pub workflow: Option<PathBuf>,
    pub role_overrides: HashMap<String, SlotRole>,
    /// Chain Scan into Transform. When off the session completes after Scan.
    pub auto_transform: bool,
    /// Chain Transform into Generate. When off the session completes after Transform.
    pub auto_generate: bool,
    pub retry: RetryPolicy,
    pub pool_size: usize,
    pub channel_capacity: usize,
    pub max_prompt_chars: usize,
    pub probe_timeout: Duration,
    /// Per-attempt bound for Scan, Transform and Organize.
    pub call_timeout: Duration,
    /// Per-attempt bound for Generate, excluding the one-time probe.
    pub generate_timeout: Duration,
    pub generation: GenerationDefaults,
    /// Where the engine writes artifacts before Organize moves them.
    pub generation_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            workflow: None,
            role_overrides: HashMap::new(),
            auto_transform: true,
            auto_generate: true,
            retry: RetryPolicy::default(),
            pool_size: 2,
            channel_capacity: 256,
            max_prompt_chars: 2000,
            probe_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(120),
            generate_timeout: Duration::from_secs(600),
            generation: GenerationDefaults::default(),
            generation_dir: std::env::temp_dir().join("trendsmith"),
        }
    }
}

/// The caller's view of a running session.
pub struct SessionHandle {
    id: Uuid,
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    events: Option<ProgressReceiver>,
    join: Option<JoinHandle<SessionState>>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: Uuid,
        state: watch::Receiver<SessionState>,
        cancel: CancellationToken,
        events: ProgressReceiver,
        join: JoinHandle<SessionState>,
    ) -> Self {
        Self {
            id,
            state,
            cancel,
            events: Some(events),
            join: Some(join),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Take the progress receiver. Only the first call returns it.
    pub fn subscribe(&mut self) -> Option<ProgressReceiver> {
        self.events.take()
    }

    /// Latest state snapshot.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Request cooperative cancellation. Items already running finish first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the session to reach a terminal stage.
    ///
    /// An untaken progress receiver is dropped first so the worker never
    /// blocks on a full channel nobody reads.
    pub async fn wait(mut self) -> SessionState {
        self.events.take();
        match self.join.take() {
            Some(join) => match join.await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "session task died");
                    self.state()
                }
            },
            None => self.state(),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("stage", &self.state.borrow().stage)
            .finish()
    }
}
