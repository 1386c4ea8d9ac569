//! Session state machine and per-stage counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bridge::ExecutionPath;
use crate::errors::SessionError;

/// The stage a session is in.
///
/// `Idle` is the state before `start` and after `reset`. `Completed`,
/// `Cancelled` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    #[default]
    Idle,
    Scanning,
    Transforming,
    Generating,
    Organizing,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStage::Completed | SessionStage::Cancelled | SessionStage::Failed
        )
    }

    /// The stage executor that runs while the session is in this stage.
    pub fn executor(&self) -> Option<StageKind> {
        match self {
            SessionStage::Scanning => Some(StageKind::Scan),
            SessionStage::Transforming => Some(StageKind::Transform),
            SessionStage::Generating => Some(StageKind::Generate),
            SessionStage::Organizing => Some(StageKind::Organize),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStage::Idle => "idle",
            SessionStage::Scanning => "scanning",
            SessionStage::Transforming => "transforming",
            SessionStage::Generating => "generating",
            SessionStage::Organizing => "organizing",
            SessionStage::Completed => "completed",
            SessionStage::Cancelled => "cancelled",
            SessionStage::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Validate that a session stage transition is allowed.
///
/// Every active stage may end the session. Stages only move forward, and
/// Organizing is only reachable from Generating.
pub fn is_valid_transition(from: &SessionStage, to: &SessionStage) -> bool {
    use SessionStage::*;
    matches!(
        (from, to),
        (Idle, Scanning)
            | (Scanning, Transforming)
            | (Transforming, Generating)
            | (Generating, Organizing)
            | (Scanning | Transforming | Generating | Organizing, Completed)
            | (Scanning | Transforming | Generating | Organizing, Cancelled)
            | (Scanning | Transforming | Generating | Organizing, Failed)
    )
}

/// One of the four fixed pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Scan,
    Transform,
    Generate,
    Organize,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Scan,
        StageKind::Transform,
        StageKind::Generate,
        StageKind::Organize,
    ];
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageKind::Scan => "scan",
            StageKind::Transform => "transform",
            StageKind::Generate => "generate",
            StageKind::Organize => "organize",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounters {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub scan: StageCounters,
    pub transform: StageCounters,
    pub generate: StageCounters,
    pub organize: StageCounters,
}

impl SessionCounters {
    pub fn get(&self, stage: StageKind) -> &StageCounters {
        match stage {
            StageKind::Scan => &self.scan,
            StageKind::Transform => &self.transform,
            StageKind::Generate => &self.generate,
            StageKind::Organize => &self.organize,
        }
    }

    pub fn get_mut(&mut self, stage: StageKind) -> &mut StageCounters {
        match stage {
            StageKind::Scan => &mut self.scan,
            StageKind::Transform => &mut self.transform,
            StageKind::Generate => &mut self.generate,
            StageKind::Organize => &mut self.organize,
        }
    }
}

/// Snapshot of a session. Only the session worker mutates it; readers
/// receive clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub id: Uuid,
    pub stage: SessionStage,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub counters: SessionCounters,
    pub cancelled: bool,
    pub failure: Option<String>,
    pub execution_path: Option<ExecutionPath>,
}

impl SessionState {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            stage: SessionStage::Idle,
            started_at: Utc::now(),
            ended_at: None,
            counters: SessionCounters::default(),
            cancelled: false,
            failure: None,
            execution_path: None,
        }
    }

    /// Move to `to`, stamping `ended_at` on terminal stages.
    pub fn transition_to(&mut self, to: SessionStage) -> Result<(), SessionError> {
        if !is_valid_transition(&self.stage, &to) {
            return Err(SessionError::InvalidTransition {
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }
        self.stage = to;
        if to.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}
