//! Artifact storage.
//!
//! [`FileOrganizer`] lays results out under the output directory:
//!
//! ```text
//! <output>/
//!   generated_designs/design_<id>.png
//!   prompts/prompt_<id>.md
//!   metadata/design_<id>.json
//!   logs/session_<timestamp>.json
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::errors::StageError;
use crate::item::WorkItem;
use crate::session::SessionState;

const DESIGNS_DIR: &str = "generated_designs";
const PROMPTS_DIR: &str = "prompts";
const METADATA_DIR: &str = "metadata";
const LOGS_DIR: &str = "logs";

#[async_trait]
pub trait ArtifactOrganizer: Send + Sync {
    /// Move an item's artifacts to their final location; returns the stored paths.
    async fn store(&self, item: &WorkItem, artifacts: &[PathBuf])
    -> Result<Vec<PathBuf>, StageError>;

    /// Record a finished session.
    async fn log_session(&self, state: &SessionState) -> Result<PathBuf, StageError>;
}

/// File counts per output folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputSummary {
    pub designs: usize,
    pub prompts: usize,
    pub metadata: usize,
    pub logs: usize,
}

pub struct FileOrganizer {
    base_dir: PathBuf,
}

fn storage_error(action: &str, path: &Path, err: impl std::fmt::Display) -> StageError {
    StageError::StorageUnavailable(format!("{} {}: {}", action, path.display(), err))
}

async fn ensure_dir(path: &Path) -> Result<(), StageError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| storage_error("cannot create", path, e))
}

async fn write_file(path: &Path, content: &str) -> Result<(), StageError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| storage_error("cannot write", path, e))
}

impl FileOrganizer {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Rename, falling back to copy+remove across filesystems.
    async fn move_file(from: &Path, to: &Path) -> Result<(), StageError> {
        if tokio::fs::rename(from, to).await.is_ok() {
            return Ok(());
        }
        tokio::fs::copy(from, to)
            .await
            .map_err(|e| storage_error("cannot copy", from, e))?;
        if let Err(e) = tokio::fs::remove_file(from).await {
            tracing::warn!(path = %from.display(), error = %e, "copied artifact but could not remove source");
        }
        Ok(())
    }

    fn prompt_document(item: &WorkItem) -> String {
        let payload = &item.payload;
        let mut doc = format!("# T-Shirt Design Prompt: {}\n\n", payload.title);
        doc.push_str(&format!("- **Source:** r/{}\n", payload.source));
        doc.push_str(&format!("- **Origin:** {}\n", item.origin));
        doc.push_str(&format!("- **Score:** {}\n", payload.score));
        if let Some(text) = &payload.text_content {
            doc.push_str(&format!("- **Text:** {}\n", text));
        }
        doc.push_str(&format!(
            "- **Type:** {}\n\n",
            if payload.image_url.is_some() {
                "Multimodal"
            } else {
                "Text-only"
            }
        ));
        doc.push_str("## Prompt\n\n```\n");
        doc.push_str(payload.prompt.as_deref().unwrap_or_default());
        doc.push_str("\n```\n");
        doc
    }

    /// Count files in each output folder. Missing folders count as empty.
    pub async fn summary(&self) -> OutputSummary {
        async fn count(dir: PathBuf) -> usize {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                return 0;
            };
            let mut n = 0;
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    n += 1;
                }
            }
            n
        }
        OutputSummary {
            designs: count(self.base_dir.join(DESIGNS_DIR)).await,
            prompts: count(self.base_dir.join(PROMPTS_DIR)).await,
            metadata: count(self.base_dir.join(METADATA_DIR)).await,
            logs: count(self.base_dir.join(LOGS_DIR)).await,
        }
    }
}

#[async_trait]
impl ArtifactOrganizer for FileOrganizer {
    async fn store(
        &self,
        item: &WorkItem,
        artifacts: &[PathBuf],
    ) -> Result<Vec<PathBuf>, StageError> {
        let designs = self.base_dir.join(DESIGNS_DIR);
        let prompts = self.base_dir.join(PROMPTS_DIR);
        let metadata = self.base_dir.join(METADATA_DIR);
        for dir in [&designs, &prompts, &metadata] {
            ensure_dir(dir).await?;
        }

        let mut stored = Vec::with_capacity(artifacts.len());
        for (index, artifact) in artifacts.iter().enumerate() {
            let ext = artifact
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png");
            let name = if index == 0 {
                format!("design_{}.{}", item.id, ext)
            } else {
                format!("design_{}_{}.{}", item.id, index + 1, ext)
            };
            let dest = designs.join(name);
            if artifact.exists() {
                Self::move_file(artifact, &dest).await?;
            } else if !dest.exists() {
                return Err(StageError::StorageUnavailable(format!(
                    "artifact {} does not exist",
                    artifact.display()
                )));
            }
            stored.push(dest);
        }

        let prompt_file = prompts.join(format!("prompt_{}.md", item.id));
        write_file(&prompt_file, &Self::prompt_document(item)).await?;

        let meta = json!({
            "design_id": format!("design_{}", item.id),
            "created_at": Utc::now().to_rfc3339(),
            "origin": item.origin,
            "source": item.payload.source,
            "title": item.payload.title,
            "score": item.payload.score,
            "text_content": item.payload.text_content,
            "prompt": item.payload.prompt,
            "prompt_file": prompt_file,
            "files": stored,
        });
        let meta_file = metadata.join(format!("design_{}.json", item.id));
        let body = serde_json::to_string_pretty(&meta)
            .map_err(|e| storage_error("cannot serialize", &meta_file, e))?;
        write_file(&meta_file, &body).await?;

        tracing::debug!(item_id = %item.id, files = stored.len(), "artifacts stored");
        Ok(stored)
    }

    async fn log_session(&self, state: &SessionState) -> Result<PathBuf, StageError> {
        let logs = self.base_dir.join(LOGS_DIR);
        ensure_dir(&logs).await?;
        let stamp = state.ended_at.unwrap_or_else(Utc::now).format("%Y%m%d_%H%M%S");
        let path = logs.join(format!("session_{}_{}.json", stamp, state.id.simple()));
        let body = serde_json::to_string_pretty(state)
            .map_err(|e| storage_error("cannot serialize", &path, e))?;
        write_file(&path, &body).await?;
        Ok(path)
    }
}
