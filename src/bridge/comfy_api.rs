//! In-process runtime: drive a running ComfyUI server over its HTTP API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{EngineRuntime, ExecutionPath, GenerationRequest};
use crate::errors::BridgeError;

/// Hops followed from a sampler input back to its text encoder.
const MAX_CONDITIONING_HOPS: usize = 8;

pub struct ComfyApiRuntime {
    client: reqwest::Client,
    endpoint: String,
    /// API-format workflow export (`Save (API)` in the ComfyUI menu).
    workflow: Option<PathBuf>,
    timeout: Duration,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct QueuedPrompt {
    prompt_id: String,
}

#[derive(Debug, Deserialize)]
struct OutputImage {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default)]
    kind: String,
}

impl ComfyApiRuntime {
    pub fn new(endpoint: impl Into<String>, workflow: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            workflow,
            timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn load_graph(&self) -> Result<Value, BridgeError> {
        let path = self.workflow.as_ref().ok_or_else(|| {
            BridgeError::EnvironmentMismatch("no API-format workflow configured".into())
        })?;
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            BridgeError::EnvironmentMismatch(format!(
                "cannot read API workflow {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            BridgeError::EnvironmentMismatch(format!(
                "API workflow {} is not valid JSON: {}",
                path.display(),
                e
            ))
        })
    }

    async fn queue(&self, graph: Value, client_id: &str) -> Result<String, BridgeError> {
        let resp = self
            .client
            .post(format!("{}/prompt", self.endpoint))
            .json(&json!({ "prompt": graph, "client_id": client_id }))
            .send()
            .await
            .map_err(|e| BridgeError::GenerationFailed(format!("failed to queue prompt: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::GenerationFailed(format!(
                "engine rejected workflow ({}): {}",
                status, body
            )));
        }
        let queued: QueuedPrompt = resp.json().await.map_err(|e| {
            BridgeError::GenerationFailed(format!("unexpected queue response: {}", e))
        })?;
        Ok(queued.prompt_id)
    }

    async fn wait_for_images(&self, prompt_id: &str) -> Result<Vec<OutputImage>, BridgeError> {
        let url = format!("{}/history/{}", self.endpoint, prompt_id);
        loop {
            let history: Value = self
                .client
                .get(&url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| BridgeError::GenerationFailed(format!("history request failed: {}", e)))?
                .json()
                .await
                .map_err(|e| BridgeError::GenerationFailed(format!("unexpected history response: {}", e)))?;

            if let Some(entry) = history.get(prompt_id) {
                if entry["status"]["status_str"] == "error" {
                    return Err(BridgeError::GenerationFailed(format!(
                        "engine reported an error for prompt {}",
                        prompt_id
                    )));
                }
                let images = collect_output_images(entry);
                if !images.is_empty() || entry["status"]["completed"] == true {
                    return Ok(images);
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn download(
        &self,
        images: Vec<OutputImage>,
        request: &GenerationRequest,
    ) -> Result<Vec<PathBuf>, BridgeError> {
        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| write_failed(&request.output_dir, e))?;
        let mut artifacts = Vec::with_capacity(images.len());
        for (index, image) in images.into_iter().enumerate() {
            let bytes = self
                .client
                .get(format!("{}/view", self.endpoint))
                .query(&[
                    ("filename", image.filename.as_str()),
                    ("subfolder", image.subfolder.as_str()),
                    ("type", image.kind.as_str()),
                ])
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| BridgeError::GenerationFailed(format!("image download failed: {}", e)))?
                .bytes()
                .await
                .map_err(|e| BridgeError::GenerationFailed(format!("image download failed: {}", e)))?;

            let extension = Path::new(&image.filename)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("png");
            let target = if index == 0 {
                request
                    .output_dir
                    .join(format!("{}.{}", request.correlation_id, extension))
            } else {
                request
                    .output_dir
                    .join(format!("{}_{}.{}", request.correlation_id, index, extension))
            };
            tokio::fs::write(&target, &bytes)
                .await
                .map_err(|e| write_failed(&target, e))?;
            artifacts.push(target);
        }
        Ok(artifacts)
    }
}

fn write_failed(path: &Path, err: std::io::Error) -> BridgeError {
    BridgeError::GenerationFailed(format!("cannot write {}: {}", path.display(), err))
}

#[async_trait]
impl EngineRuntime for ComfyApiRuntime {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::InProcess
    }

    async fn probe(&self) -> Result<(), BridgeError> {
        self.load_graph().await?;
        let resp = self
            .client
            .get(format!("{}/system_stats", self.endpoint))
            .send()
            .await
            .map_err(|e| {
                BridgeError::EnvironmentMismatch(format!(
                    "engine API not reachable at {}: {}",
                    self.endpoint, e
                ))
            })?;
        if !resp.status().is_success() {
            return Err(BridgeError::EnvironmentMismatch(format!(
                "engine API at {} answered {}",
                self.endpoint,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<PathBuf>, BridgeError> {
        let mut graph = self.load_graph().await?;
        apply_request(&mut graph, request)?;

        let run = async {
            let prompt_id = self.queue(graph, &request.correlation_id).await?;
            tracing::debug!(item_id = %request.correlation_id, %prompt_id, "prompt queued");
            let images = self.wait_for_images(&prompt_id).await?;
            if images.is_empty() {
                return Err(BridgeError::GenerationFailed(
                    "engine finished without saving an image".into(),
                ));
            }
            self.download(images, request).await
        };
        tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| BridgeError::Timeout {
                secs: self.timeout.as_secs(),
            })?
    }
}

fn collect_output_images(entry: &Value) -> Vec<OutputImage> {
    let Some(outputs) = entry["outputs"].as_object() else {
        return Vec::new();
    };
    outputs
        .values()
        .filter_map(|output| output["images"].as_array())
        .flatten()
        .filter_map(|image| serde_json::from_value::<OutputImage>(image.clone()).ok())
        .filter(|image| image.kind.is_empty() || image.kind == "output")
        .collect()
}

fn class_type(node: &Value) -> &str {
    node["class_type"].as_str().unwrap_or_default()
}

/// Node id referenced by a link input such as `["35", 0]`.
fn link_target(input: &Value) -> Option<String> {
    match input.as_array()?.first()? {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Follow conditioning links from `id` back to a text encoder node.
fn resolve_encoder(nodes: &Map<String, Value>, mut id: String) -> Option<String> {
    for _ in 0..MAX_CONDITIONING_HOPS {
        let node = nodes.get(&id)?;
        if class_type(node).starts_with("CLIPTextEncode") {
            return Some(id);
        }
        id = link_target(&node["inputs"]["conditioning"])?;
    }
    None
}

/// Write the request's values into an API-format workflow graph.
fn apply_request(graph: &mut Value, request: &GenerationRequest) -> Result<(), BridgeError> {
    let nodes = graph.as_object_mut().ok_or_else(|| {
        BridgeError::GenerationFailed("API workflow is not a JSON object of nodes".into())
    })?;

    let mut positive = None;
    let mut negative = None;
    let view: &Map<String, Value> = nodes;
    for node in view.values() {
        if class_type(node).starts_with("KSampler") {
            positive = link_target(&node["inputs"]["positive"])
                .and_then(|id| resolve_encoder(view, id));
            negative = link_target(&node["inputs"]["negative"])
                .and_then(|id| resolve_encoder(view, id));
        }
    }

    let mut prompt_set = false;
    for (id, node) in nodes.iter_mut() {
        let class = class_type(node).to_string();
        let title = node["_meta"]["title"]
            .as_str()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };

        if class.starts_with("CLIPTextEncode") {
            let is_negative = match &negative {
                Some(neg) => neg == id,
                None => title.contains("negative"),
            };
            let is_positive = match &positive {
                Some(pos) => pos == id,
                None => !is_negative,
            };
            if is_negative {
                if let Some(text) = &request.negative_prompt {
                    inputs.insert("text".into(), json!(text));
                }
            } else if is_positive {
                inputs.insert("text".into(), json!(request.prompt));
                prompt_set = true;
            }
        } else if class.starts_with("Empty") && class.ends_with("LatentImage") {
            inputs.insert("width".into(), json!(request.width));
            inputs.insert("height".into(), json!(request.height));
        } else if class.starts_with("KSampler") || class == "RandomNoise" {
            if let Some(seed) = request.seed {
                let key = if inputs.contains_key("noise_seed") {
                    "noise_seed"
                } else {
                    "seed"
                };
                inputs.insert(key.into(), json!(seed));
            }
            if let Some(steps) = request.steps
                && inputs.contains_key("steps")
            {
                inputs.insert("steps".into(), json!(steps));
            }
        } else if class == "SaveImage" {
            inputs.insert("filename_prefix".into(), json!(request.correlation_id));
        }
    }

    if !prompt_set {
        return Err(BridgeError::GenerationFailed(
            "API workflow has no text encoder for the prompt".into(),
        ));
    }
    Ok(())
}
