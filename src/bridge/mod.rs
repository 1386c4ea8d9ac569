//! External execution bridge for the image generation engine.
//!
//! Two runtimes implement [`EngineRuntime`]:
//! - [`ComfyApiRuntime`] drives a running engine directly from this process
//!   over its HTTP API (the in-process path)
//! - [`SubprocessRuntime`] launches a separate interpreter process per
//!   request (the subprocess path)
//!
//! [`ExecutionBridge`] hides the choice. The first path selection runs a
//! capability probe: the in-process runtime is tried first, and an
//! `EnvironmentMismatch` falls back to the subprocess runtime. The decision
//! is cached for the lifetime of the bridge, which is one session.

mod comfy_api;
mod request;
mod subprocess;

pub use comfy_api::ComfyApiRuntime;
pub use request::{GenerationRequest, GenerationResult};
pub use subprocess::SubprocessRuntime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::errors::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    InProcess,
    Subprocess,
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionPath::InProcess => write!(f, "in-process"),
            ExecutionPath::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// One way of running the generation engine.
#[async_trait]
pub trait EngineRuntime: Send + Sync {
    fn path(&self) -> ExecutionPath;

    /// Check that this runtime can serve requests. Returns
    /// `EnvironmentMismatch` when the runtime is not usable here.
    async fn probe(&self) -> Result<(), BridgeError>;

    /// Run one request, returning the produced artifact files.
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<PathBuf>, BridgeError>;
}

pub struct ExecutionBridge {
    in_process: Arc<dyn EngineRuntime>,
    subprocess: Arc<dyn EngineRuntime>,
    probe_timeout: Duration,
    decision: OnceCell<Result<ExecutionPath, String>>,
}

impl ExecutionBridge {
    pub fn new(
        in_process: Arc<dyn EngineRuntime>,
        subprocess: Arc<dyn EngineRuntime>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            in_process,
            subprocess,
            probe_timeout,
            decision: OnceCell::new(),
        }
    }

    /// The execution path, probing on first use.
    ///
    /// Concurrent callers share a single probe. A failed probe is cached
    /// too: every later call reports the same `EngineUnavailable`.
    pub async fn select_path(&self) -> Result<ExecutionPath, BridgeError> {
        self.decision
            .get_or_init(|| self.probe())
            .await
            .clone()
            .map_err(BridgeError::EngineUnavailable)
    }

    async fn probe(&self) -> Result<ExecutionPath, String> {
        let mut mismatches = Vec::new();
        for runtime in [&self.in_process, &self.subprocess] {
            let path = runtime.path();
            match tokio::time::timeout(self.probe_timeout, runtime.probe()).await {
                Err(_) => {
                    tracing::warn!(%path, timeout = ?self.probe_timeout, "engine probe timed out");
                    return Err(format!(
                        "{} probe did not answer within {}s",
                        path,
                        self.probe_timeout.as_secs_f64()
                    ));
                }
                Ok(Ok(())) => {
                    tracing::info!(%path, "engine execution path selected");
                    return Ok(path);
                }
                Ok(Err(BridgeError::EnvironmentMismatch(reason))) => {
                    tracing::info!(%path, %reason, "engine runtime not usable, trying next");
                    mismatches.push(format!("{}: {}", path, reason));
                }
                Ok(Err(other)) => return Err(format!("{}: {}", path, other)),
            }
        }
        Err(format!(
            "no usable execution path ({})",
            mismatches.join("; ")
        ))
    }

    /// Execute one request on the selected path.
    ///
    /// Probe failures and environment errors are returned as `Err`; they
    /// end the session. Per-request failures come back as an unsuccessful
    /// [`GenerationResult`]. Nothing is retried here.
    pub async fn execute(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, BridgeError> {
        let path = self.select_path().await?;
        let runtime = match path {
            ExecutionPath::InProcess => &self.in_process,
            ExecutionPath::Subprocess => &self.subprocess,
        };
        match runtime.generate(request).await {
            Ok(artifacts) => Ok(GenerationResult::succeeded(request, path, artifacts)),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => Ok(GenerationResult::failed(request, path, err.to_string())),
        }
    }
}
