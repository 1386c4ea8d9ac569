//! Language-model prompt transformer.
//!
//! [`LmStudioTransformer`] talks to any OpenAI-compatible chat completions
//! endpoint (LM Studio by default). Posts with an image are sent as
//! multimodal messages.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use crate::errors::StageError;
use crate::item::WorkItem;

#[async_trait]
pub trait PromptTransformer: Send + Sync {
    /// Raw model output for one item. Validation happens in the Transform stage.
    async fn transform(&self, item: &WorkItem) -> Result<String, StageError>;
}

pub const DEFAULT_MODEL: &str = "qwen/qwen3-vl-30b";

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

pub struct LmStudioTransformer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl LmStudioTransformer {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        }
    }

    fn request_body(&self, item: &WorkItem) -> Value {
        let text = design_instructions(item);
        let content = match &item.payload.image_url {
            Some(url) => json!([
                { "type": "text", "text": text },
                { "type": "image_url", "image_url": { "url": url } }
            ]),
            None => Value::String(text),
        };
        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "temperature": 0.7,
            "stream": false
        })
    }
}

#[async_trait]
impl PromptTransformer for LmStudioTransformer {
    async fn transform(&self, item: &WorkItem) -> Result<String, StageError> {
        let url = format!("{}/chat/completions", self.endpoint);
        tracing::debug!(item_id = %item.id, model = %self.model, "requesting prompt");
        let resp = self
            .client
            .post(&url)
            .json(&self.request_body(item))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| StageError::ModelUnavailable(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StageError::ModelUnavailable(format!(
                "model endpoint returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let completion: Completion = resp
            .json()
            .await
            .map_err(|e| StageError::InvalidResponse(format!("unreadable completion: {}", e)))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| StageError::InvalidResponse("completion has no content".into()))
    }
}

/// Instructions sent to the model for one post.
pub fn design_instructions(item: &WorkItem) -> String {
    let payload = &item.payload;
    let (text, text_source) = match &payload.text_content {
        Some(text) if text != &payload.title => (text.as_str(), "extracted"),
        Some(text) => (text.as_str(), "title"),
        None => ("N/A", "title"),
    };
    let has_image = payload.image_url.is_some();
    let mut out = String::new();
    out.push_str(
        "You are a professional t-shirt design prompt engineer. Transform this Reddit trend \
         into a detailed image-generation prompt for a trendy visual t-shirt design.\n\n",
    );
    out.push_str("Reddit content:\n");
    out.push_str(&format!("- Title: {}\n", payload.title));
    out.push_str(&format!("- Text content: {} (source: {})\n", text, text_source));
    out.push_str(&format!("- Popularity score: {}\n", payload.score));
    out.push_str(&format!(
        "- Content type: {}\n\n",
        if has_image { "Image + Text" } else { "Text-only post" }
    ));
    out.push_str("Requirements:\n");
    out.push_str("- Create a VISUAL GRAPHIC design, not just text\n");
    out.push_str("- Include illustrations, characters or symbols that represent the trend\n");
    if has_image {
        out.push_str("- Incorporate visual elements and themes from the attached image\n");
    }
    out.push_str("- Suitable for t-shirt printing: 768x1024px, high contrast, bold graphics\n");
    out.push_str("- Name a specific art style and the colors and composition\n");
    out.push_str("- Keep any text on the design minimal\n\n");
    out.push_str("Output only the prompt text, no other explanation.\n");
    out
}
