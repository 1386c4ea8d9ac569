//! Work items flowing between stages.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Content carried by a work item, accumulated as it moves through stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Subreddit (or other source) the post came from.
    pub source: String,
    pub title: String,
    /// Short slogan-like text extracted from the title, if any.
    pub text_content: Option<String>,
    pub image_url: Option<String>,
    pub score: i64,
    /// Generation prompt produced by the Transform stage.
    pub prompt: Option<String>,
    /// Files produced by the Generate stage.
    pub artifacts: Vec<PathBuf>,
    /// Final locations written by the Organize stage.
    pub stored: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    /// Permalink or URL of the original post.
    pub origin: String,
    pub payload: Payload,
    pub status: ItemStatus,
    pub failure: Option<String>,
    /// Retries spent in the current stage.
    pub retries: u32,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, origin: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            origin: origin.into(),
            payload,
            status: ItemStatus::Pending,
            failure: None,
            retries: 0,
        }
    }

    /// Reset per-stage bookkeeping before the item enters a new stage.
    pub fn enter_stage(&mut self) {
        self.status = ItemStatus::Pending;
        self.failure = None;
        self.retries = 0;
    }

    /// Text the prompt is built around: extracted text, else the title.
    pub fn subject(&self) -> &str {
        self.payload
            .text_content
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.payload.title)
    }
}

/// Pull a short printable phrase out of a post title.
///
/// Quoted text wins; otherwise titles of at most four words are used as-is.
pub fn extract_text_from_title(title: &str) -> Option<String> {
    let title = title.trim();
    for (open, close) in [('"', '"'), ('\u{201c}', '\u{201d}')] {
        if let Some(start) = title.find(open) {
            let rest = &title[start + open.len_utf8()..];
            if let Some(end) = rest.find(close) {
                let quoted = rest[..end].trim();
                if !quoted.is_empty() {
                    return Some(quoted.to_string());
                }
            }
        }
    }
    let words = title.split_whitespace().count();
    if words > 0 && words <= 4 {
        Some(title.to_string())
    } else {
        None
    }
}
