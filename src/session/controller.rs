//! Session controller and the per-session worker task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{SessionConfig, SessionHandle, SessionStage, SessionState};
use crate::analyzer::WorkflowDefinition;
use crate::bridge::{EngineRuntime, ExecutionBridge};
use crate::collectors::SourceCollector;
use crate::errors::{SessionError, StageError};
use crate::item::{ItemStatus, WorkItem};
use crate::organizer::ArtifactOrganizer;
use crate::progress::{self, EventKind, ProgressEvent, ProgressSender};
use crate::stages::{
    BatchReport, GenerateStep, ItemStep, OrganizeStep, OutcomeKind, ScanStep, SourceTask,
    StageContext, StageOutcome, Tracked, TransformStep, collect_unique, run_batch,
};
use crate::transformer::PromptTransformer;

/// External services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub collector: Arc<dyn SourceCollector>,
    pub transformer: Arc<dyn PromptTransformer>,
    pub organizer: Arc<dyn ArtifactOrganizer>,
    /// Runtime tried first by each session's execution bridge.
    pub in_process: Arc<dyn EngineRuntime>,
    pub subprocess: Arc<dyn EngineRuntime>,
}

struct ActiveSession {
    id: Uuid,
    state: watch::Receiver<SessionState>,
}

impl ActiveSession {
    fn is_running(&self) -> bool {
        !self.state.borrow().is_terminal()
    }
}

/// Starts sessions and enforces one running session at a time.
pub struct SessionController {
    collaborators: Collaborators,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionController {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            active: Mutex::new(None),
        }
    }

    /// Validate `config`, analyze the workflow and launch a session.
    ///
    /// Returns as soon as the worker task is spawned, with the session in
    /// `Scanning`.
    pub async fn start(&self, config: &SessionConfig) -> Result<SessionHandle, SessionError> {
        if config.sources.is_empty() {
            return Err(SessionError::ConfigInvalid(
                "no sources configured".to_string(),
            ));
        }
        let workflow_path = config.workflow.as_ref().ok_or_else(|| {
            SessionError::ConfigInvalid("no workflow definition selected".to_string())
        })?;
        if let Some(id) = self.running_id() {
            return Err(SessionError::AlreadyRunning { id });
        }

        let text = tokio::fs::read_to_string(workflow_path).await.map_err(|e| {
            SessionError::ConfigInvalid(format!(
                "cannot read workflow {}: {}",
                workflow_path.display(),
                e
            ))
        })?;
        let workflow = WorkflowDefinition::parse(workflow_path.clone(), text, &config.role_overrides)?;
        tracing::debug!(workflow = %workflow_path.display(), slots = workflow.slots.len(), "workflow analyzed");

        let id = Uuid::new_v4();
        let mut state = SessionState::new(id);
        state.transition_to(SessionStage::Scanning)?;
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (progress, events) = progress::channel(config.channel_capacity);
        let cancel = CancellationToken::new();

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = active.as_ref()
                && current.is_running()
            {
                return Err(SessionError::AlreadyRunning { id: current.id });
            }
            *active = Some(ActiveSession {
                id,
                state: state_rx.clone(),
            });
        }

        let bridge = Arc::new(ExecutionBridge::new(
            self.collaborators.in_process.clone(),
            self.collaborators.subprocess.clone(),
            config.probe_timeout,
        ));
        let worker = Worker {
            config: config.clone(),
            collaborators: self.collaborators.clone(),
            workflow: Arc::new(workflow),
            bridge,
            state,
            state_tx,
            progress,
            cancel: cancel.clone(),
            seen_origins: HashSet::new(),
        };
        tracing::info!(session_id = %id, sources = config.sources.len(), "session started");
        let join = tokio::spawn(worker.run());

        Ok(SessionHandle::new(id, state_rx, cancel, events, join))
    }

    pub fn cancel(&self, handle: &SessionHandle) {
        tracing::info!(session_id = %handle.id(), "cancellation requested");
        handle.cancel();
    }

    pub fn current_state(&self, handle: &SessionHandle) -> SessionState {
        handle.state()
    }

    /// Forget the last finished session. Fails while one is still running.
    pub fn reset(&self) -> Result<(), SessionError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref()
            && current.is_running()
        {
            return Err(SessionError::AlreadyRunning { id: current.id });
        }
        *active = None;
        Ok(())
    }

    fn running_id(&self) -> Option<Uuid> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active
            .as_ref()
            .filter(|current| current.is_running())
            .map(|current| current.id)
    }
}

/// Owns the session state for the lifetime of one session.
struct Worker {
    config: SessionConfig,
    collaborators: Collaborators,
    workflow: Arc<WorkflowDefinition>,
    bridge: Arc<ExecutionBridge>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    progress: ProgressSender,
    cancel: CancellationToken,
    seen_origins: HashSet<String>,
}

impl Worker {
    async fn run(mut self) -> SessionState {
        self.progress
            .send(ProgressEvent::transition(
                SessionStage::Idle,
                SessionStage::Scanning,
            ))
            .await;
        let end = self.pipeline().await;
        self.finish(end).await
    }

    /// Run the stages in order and return the terminal stage.
    async fn pipeline(&mut self) -> SessionStage {
        // Scan
        let tasks: Vec<SourceTask> = self
            .config
            .sources
            .iter()
            .cloned()
            .map(SourceTask::new)
            .collect();
        let scan = ScanStep::new(self.collaborators.collector.clone());
        let report = self.run_stage(Arc::new(scan), tasks, self.config.call_timeout).await;
        if let Some(end) = self.stopped(report.fatal.clone()) {
            return end;
        }
        let items = collect_unique(&mut self.seen_origins, report.items);
        if items.is_empty() {
            self.progress.info("No trending posts found").await;
            return SessionStage::Completed;
        }
        self.progress
            .info(format!("Collected {} trending posts", items.len()))
            .await;
        if !self.config.auto_transform {
            return SessionStage::Completed;
        }

        // Transform
        self.advance(SessionStage::Transforming).await;
        let transform = TransformStep::new(
            self.collaborators.transformer.clone(),
            self.config.max_prompt_chars,
        );
        let report = self
            .run_stage(Arc::new(transform), items, self.config.call_timeout)
            .await;
        if let Some(end) = self.stopped(report.fatal.clone()) {
            return end;
        }
        let items = self.carry_forward(report, "generate").await;
        if items.is_empty() || !self.config.auto_generate {
            return SessionStage::Completed;
        }

        // Generate
        self.advance(SessionStage::Generating).await;
        if let Some(end) = self.select_execution_path().await {
            return end;
        }
        let generate = GenerateStep::new(
            self.bridge.clone(),
            self.workflow.clone(),
            self.config.generation.clone(),
            self.config.generation_dir.clone(),
        );
        let report = self
            .run_stage(Arc::new(generate), items, self.config.generate_timeout)
            .await;
        if let Some(end) = self.stopped(report.fatal.clone()) {
            return end;
        }
        let items = self.carry_forward(report, "organize").await;
        if items.is_empty() {
            return SessionStage::Completed;
        }

        // Organize
        self.advance(SessionStage::Organizing).await;
        let organize = OrganizeStep::new(self.collaborators.organizer.clone());
        let report = self
            .run_stage(Arc::new(organize), items, self.config.call_timeout)
            .await;
        if let Some(end) = self.stopped(report.fatal.clone()) {
            return end;
        }
        SessionStage::Completed
    }

    /// Run one stage, folding its outcomes into the counters as they arrive.
    async fn run_stage<T, S>(
        &mut self,
        step: Arc<S>,
        items: Vec<T>,
        call_timeout: Duration,
    ) -> BatchReport<T>
    where
        T: Tracked,
        S: ItemStep<T>,
    {
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let ctx = StageContext {
            progress: self.progress.clone(),
            outcomes: outcome_tx,
            cancel: self.cancel.clone(),
            retry: self.config.retry.clone(),
            pool_size: self.config.pool_size,
            call_timeout,
        };
        let cancel = self.cancel.clone();

        let report = {
            let batch = run_batch(&ctx, step, items);
            tokio::pin!(batch);
            loop {
                tokio::select! {
                    report = &mut batch => break report,
                    Some(outcome) = outcome_rx.recv() => self.record(outcome),
                    _ = cancel.cancelled(), if !self.state.cancelled => {
                        self.state.cancelled = true;
                        self.publish();
                        self.progress
                            .warning("Cancellation requested, finishing items in flight")
                            .await;
                    }
                }
            }
        };
        drop(ctx);
        while let Ok(outcome) = outcome_rx.try_recv() {
            self.record(outcome);
        }
        self.publish();
        report
    }

    fn record(&mut self, outcome: StageOutcome) {
        let counters = self.state.counters.get_mut(outcome.stage);
        match outcome.kind {
            OutcomeKind::Attempted => counters.attempted += 1,
            OutcomeKind::Succeeded => counters.succeeded += 1,
            OutcomeKind::Failed => counters.failed += 1,
        }
        self.publish();
    }

    /// Probe the engine once, before any generation request is timed.
    async fn select_execution_path(&mut self) -> Option<SessionStage> {
        let bridge = self.bridge.clone();
        let cancel = self.cancel.clone();
        let selected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.stopped(None),
            selected = bridge.select_path() => selected,
        };
        match selected {
            Ok(path) => {
                tracing::info!(session_id = %self.state.id, %path, "engine execution path selected");
                self.state.execution_path = Some(path);
                self.publish();
                self.progress
                    .info(format!("Engine execution path: {}", path))
                    .await;
                None
            }
            Err(err) => {
                self.progress
                    .send(ProgressEvent::new(
                        EventKind::Error,
                        format!("No usable engine execution path: {}", err),
                    ))
                    .await;
                self.stopped(Some(StageError::from(err)))
            }
        }
    }

    /// Terminal stage if the session must stop after the stage just run.
    fn stopped(&mut self, fatal: Option<StageError>) -> Option<SessionStage> {
        if let Some(err) = fatal {
            tracing::error!(session_id = %self.state.id, stage = %self.state.stage, error = %err, "session failed");
            self.state.failure = Some(err.to_string());
            return Some(SessionStage::Failed);
        }
        if self.cancel.is_cancelled() {
            self.state.cancelled = true;
            return Some(SessionStage::Cancelled);
        }
        None
    }

    /// Succeeded items, reset for the next stage. Every other item gets a warning.
    async fn carry_forward(&mut self, report: BatchReport<WorkItem>, next: &str) -> Vec<WorkItem> {
        let mut carried = Vec::new();
        for mut item in report.items {
            if item.status == ItemStatus::Done {
                item.enter_stage();
                carried.push(item);
                continue;
            }
            let reason = item.failure.as_deref().unwrap_or("not processed");
            self.progress
                .send(ProgressEvent::new(
                    EventKind::Warning,
                    format!("Skipping {} for {}: {}", item.id, next, reason),
                ))
                .await;
        }
        carried
    }

    async fn advance(&mut self, to: SessionStage) {
        let from = self.state.stage;
        if let Err(e) = self.state.transition_to(to) {
            tracing::error!(error = %e, "rejected session transition");
            return;
        }
        tracing::info!(session_id = %self.state.id, %from, %to, "session stage changed");
        self.publish();
        self.progress
            .send(ProgressEvent::transition(from, to))
            .await;
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    async fn finish(mut self, end: SessionStage) -> SessionState {
        if let Err(e) = self.state.transition_to(end) {
            tracing::error!(error = %e, "rejected terminal transition");
        }
        self.publish();

        if let Err(e) = self.collaborators.organizer.log_session(&self.state).await {
            tracing::warn!(session_id = %self.state.id, error = %e, "session log not written");
            self.progress
                .warning(format!("Session log not written: {}", e))
                .await;
        }

        tracing::info!(
            session_id = %self.state.id,
            stage = %self.state.stage,
            counters = ?self.state.counters,
            "session finished"
        );
        self.progress
            .send(ProgressEvent::terminal(
                self.state.stage,
                self.state.counters,
                self.state.failure.clone(),
            ))
            .await;
        self.state
    }
}
