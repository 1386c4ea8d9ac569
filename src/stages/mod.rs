//! Stage executors.
//!
//! Every stage processes a batch of items through [`run_batch`]: a bounded
//! pool of tokio tasks, per-item retry with increasing delay, and
//! cooperative cancellation at item granularity. What a stage does with one
//! item is an [`ItemStep`].
//!
//! | Module      | Step            | Items          |
//! |-------------|-----------------|----------------|
//! | `scan`      | `ScanStep`      | `SourceTask`   |
//! | `transform` | `TransformStep` | `WorkItem`     |
//! | `generate`  | `GenerateStep`  | `WorkItem`     |
//! | `organize`  | `OrganizeStep`  | `WorkItem`     |

mod batch;
pub mod generate;
pub mod organize;
mod retry;
pub mod scan;
pub mod transform;

pub use batch::{BatchReport, run_batch};
pub use generate::{GenerateStep, GenerationDefaults};
pub use organize::OrganizeStep;
pub use retry::{RetryOutcome, RetryPolicy, run_with_retry};
pub use scan::{ScanStep, SourceTask, collect_unique};
pub use transform::{TransformStep, clean_prompt};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::StageError;
use crate::item::{ItemStatus, WorkItem};
use crate::progress::ProgressSender;
use crate::session::StageKind;

/// Counter update reported by a stage task to the session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Attempted,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub kind: OutcomeKind,
}

/// Everything a stage task needs besides its step and item.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub progress: ProgressSender,
    pub outcomes: mpsc::UnboundedSender<StageOutcome>,
    /// Session cancellation token. Stages derive child tokens from it.
    pub cancel: CancellationToken,
    pub retry: RetryPolicy,
    pub pool_size: usize,
    /// Upper bound for a single attempt.
    pub call_timeout: Duration,
}

impl StageContext {
    fn record(&self, stage: StageKind, kind: OutcomeKind) {
        if self.outcomes.send(StageOutcome { stage, kind }).is_err() {
            tracing::trace!(%stage, ?kind, "session worker gone, outcome dropped");
        }
    }
}

/// Per-item bookkeeping the batch runner maintains.
pub trait Tracked: Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn status(&self) -> ItemStatus;
    fn set_status(&mut self, status: ItemStatus);
    fn set_failure(&mut self, reason: Option<String>);
    fn set_retries(&mut self, retries: u32);
}

impl Tracked for WorkItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ItemStatus {
        self.status
    }

    fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
    }

    fn set_failure(&mut self, reason: Option<String>) {
        self.failure = reason;
    }

    fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }
}

/// The work one stage performs on one item.
#[async_trait]
pub trait ItemStep<T: Tracked>: Send + Sync + 'static {
    type Output: Send;

    fn kind(&self) -> StageKind;

    /// One attempt. Called again on retryable errors.
    async fn attempt(&self, item: &T) -> Result<Self::Output, StageError>;

    /// Store a successful attempt's output on the item.
    fn apply(&self, item: &mut T, output: Self::Output);

    fn success_message(&self, item: &T) -> String {
        format!("{} {} done", self.kind(), item.id())
    }
}
