//! Transform stage: one model request per item, validated.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};

use super::ItemStep;
use crate::errors::StageError;
use crate::item::WorkItem;
use crate::session::StageKind;
use crate::transformer::PromptTransformer;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid think-block regex"));
static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[a-zA-Z]*\n?(.*?)```").expect("valid fence regex"));

pub struct TransformStep {
    transformer: Arc<dyn PromptTransformer>,
    max_chars: usize,
}

impl TransformStep {
    pub fn new(transformer: Arc<dyn PromptTransformer>, max_chars: usize) -> Self {
        Self {
            transformer,
            max_chars,
        }
    }
}

#[async_trait]
impl ItemStep<WorkItem> for TransformStep {
    type Output = String;

    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    async fn attempt(&self, item: &WorkItem) -> Result<String, StageError> {
        let raw = self.transformer.transform(item).await?;
        clean_prompt(&raw, self.max_chars)
    }

    fn apply(&self, item: &mut WorkItem, prompt: String) {
        item.payload.prompt = Some(prompt);
    }

    fn success_message(&self, item: &WorkItem) -> String {
        format!("Prompt ready for {}", item.id)
    }
}

/// Reduce raw model output to a usable prompt.
///
/// Reasoning blocks are dropped, a fenced block is unwrapped, and
/// surrounding quotes are trimmed. Empty output and output longer than
/// `max_chars` characters are `InvalidResponse`.
pub fn clean_prompt(raw: &str, max_chars: usize) -> Result<String, StageError> {
    let without_thinking = THINK_BLOCK.replace_all(raw, "");
    let body = match FENCED_BLOCK.captures(&without_thinking) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()).to_string(),
        None => without_thinking.to_string(),
    };
    let prompt = body
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string();

    if prompt.is_empty() {
        return Err(StageError::InvalidResponse("model returned no prompt text".into()));
    }
    let chars = prompt.chars().count();
    if chars > max_chars {
        return Err(StageError::InvalidResponse(format!(
            "prompt is {} characters, limit is {}",
            chars, max_chars
        )));
    }
    Ok(prompt)
}
