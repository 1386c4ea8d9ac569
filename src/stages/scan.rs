//! Scan stage: one task per configured source.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::{ItemStep, Tracked};
use crate::collectors::{SourceCollector, SourceConfig};
use crate::errors::StageError;
use crate::item::{ItemStatus, WorkItem};
use crate::session::StageKind;

/// A source being scanned. Scan counters count these, not posts.
#[derive(Debug, Clone)]
pub struct SourceTask {
    pub source: SourceConfig,
    pub status: ItemStatus,
    pub failure: Option<String>,
    pub retries: u32,
    pub collected: Vec<WorkItem>,
}

impl SourceTask {
    pub fn new(source: SourceConfig) -> Self {
        Self {
            source,
            status: ItemStatus::Pending,
            failure: None,
            retries: 0,
            collected: Vec::new(),
        }
    }
}

impl Tracked for SourceTask {
    fn id(&self) -> &str {
        &self.source.subreddit
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

pub struct ScanStep {
    collector: Arc<dyn SourceCollector>,
}

impl ScanStep {
    pub fn new(collector: Arc<dyn SourceCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl ItemStep<SourceTask> for ScanStep {
    type Output = Vec<WorkItem>;

    fn kind(&self) -> StageKind {
        StageKind::Scan
    }

    async fn attempt(&self, task: &SourceTask) -> Result<Vec<WorkItem>, StageError> {
        self.collector.fetch(&task.source).await
    }

    fn apply(&self, task: &mut SourceTask, posts: Vec<WorkItem>) {
        let fetched = posts.len();
        task.collected = posts
            .into_iter()
            .filter(|post| post.payload.score >= task.source.min_score)
            .take(task.source.max_posts)
            .collect();
        tracing::debug!(
            subreddit = %task.source.subreddit,
            fetched,
            kept = task.collected.len(),
            "source scanned"
        );
    }

    fn success_message(&self, task: &SourceTask) -> String {
        format!(
            "r/{}: {} trending posts",
            task.source.subreddit,
            task.collected.len()
        )
    }
}

/// Merge the posts of finished sources, dropping origins already in `seen`.
pub fn collect_unique(seen: &mut HashSet<String>, tasks: Vec<SourceTask>) -> Vec<WorkItem> {
    tasks
        .into_iter()
        .flat_map(|task| task.collected)
        .filter(|item| seen.insert(item.origin.clone()))
        .map(|mut item| {
            item.enter_stage();
            item
        })
        .collect()
}
