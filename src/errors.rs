//! Typed error hierarchy for the trendsmith pipeline.
//!
//! Four enums cover the subsystems:
//! - `SessionError`: failures to start or manage a session
//! - `AnalyzerError`: workflow definitions that cannot be inspected or rewritten
//! - `BridgeError`: generation engine probe and execution failures
//! - `StageError`: per-item failures raised inside a stage executor

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by the session controller before or around a run.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Session {id} is still running")]
    AlreadyRunning { id: Uuid },

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

/// Errors from the workflow parameter analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzerError {
    #[error("Unparsable workflow definition at byte {offset}: {reason}")]
    UnparsableDefinition { offset: usize, reason: String },

    #[error("Cannot substitute slot '{slot}': {reason}")]
    InvalidSubstitution { slot: String, reason: String },
}

/// Errors from the external execution bridge and its runtimes.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Engine environment mismatch: {0}")]
    EnvironmentMismatch(String),

    #[error("Generation engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Engine call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Failed to write engine request at {path}: {source}")]
    RequestWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

impl BridgeError {
    /// Errors that mean no request can succeed on this bridge.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::EnvironmentMismatch(_) | BridgeError::EngineUnavailable(_)
        )
    }
}

/// Errors raised while processing a single item inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Credentials rejected: {0}")]
    CredentialRejected(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Generation engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Engine environment mismatch: {0}")]
    EnvironmentMismatch(String),
}

impl StageError {
    /// Whether this error terminates the whole session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            StageError::CredentialRejected(_)
                | StageError::EngineUnavailable(_)
                | StageError::EnvironmentMismatch(_)
        )
    }

    /// Whether the failed attempt may be repeated for the same item.
    pub fn is_retryable(&self) -> bool {
        !self.is_session_fatal()
    }
}

impl From<BridgeError> for StageError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::EnvironmentMismatch(reason) => StageError::EnvironmentMismatch(reason),
            BridgeError::EngineUnavailable(reason) => StageError::EngineUnavailable(reason),
            BridgeError::Timeout { secs } => StageError::Timeout { secs },
            other => StageError::GenerationFailed(other.to_string()),
        }
    }
}
