//! Organize stage: hand generated artifacts to the organizer.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use super::ItemStep;
use crate::errors::StageError;
use crate::item::WorkItem;
use crate::organizer::ArtifactOrganizer;
use crate::session::StageKind;

pub struct OrganizeStep {
    organizer: Arc<dyn ArtifactOrganizer>,
}

impl OrganizeStep {
    pub fn new(organizer: Arc<dyn ArtifactOrganizer>) -> Self {
        Self { organizer }
    }
}

#[async_trait]
impl ItemStep<WorkItem> for OrganizeStep {
    type Output = Vec<PathBuf>;

    fn kind(&self) -> StageKind {
        StageKind::Organize
    }

    async fn attempt(&self, item: &WorkItem) -> Result<Vec<PathBuf>, StageError> {
        self.organizer.store(item, &item.payload.artifacts).await
    }

    fn apply(&self, item: &mut WorkItem, stored: Vec<PathBuf>) {
        item.payload.stored = stored;
    }

    fn success_message(&self, item: &WorkItem) -> String {
        match item.payload.stored.first() {
            Some(path) => format!("Saved {} to {}", item.id, path.display()),
            None => format!("Saved {}", item.id),
        }
    }
}
