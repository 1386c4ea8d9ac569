//! Generate stage: one engine request per prompted item via the bridge.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use super::ItemStep;
use crate::analyzer::WorkflowDefinition;
use crate::bridge::{ExecutionBridge, GenerationRequest};
use crate::errors::StageError;
use crate::item::WorkItem;
use crate::session::StageKind;

/// Request fields that do not come from the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationDefaults {
    pub width: u32,
    pub height: u32,
    pub seed: Option<i64>,
    pub steps: Option<u32>,
    pub negative_prompt: Option<String>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            width: 768,
            height: 1024,
            seed: None,
            steps: None,
            negative_prompt: None,
        }
    }
}

pub struct GenerateStep {
    bridge: Arc<ExecutionBridge>,
    workflow: Arc<WorkflowDefinition>,
    defaults: GenerationDefaults,
    output_dir: PathBuf,
}

impl GenerateStep {
    pub fn new(
        bridge: Arc<ExecutionBridge>,
        workflow: Arc<WorkflowDefinition>,
        defaults: GenerationDefaults,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            bridge,
            workflow,
            defaults,
            output_dir,
        }
    }

    pub fn request_for(&self, item: &WorkItem) -> Result<GenerationRequest, StageError> {
        let prompt = item
            .payload
            .prompt
            .clone()
            .ok_or_else(|| StageError::GenerationFailed(format!("{} has no prompt", item.id)))?;
        let mut request = GenerationRequest::new(&item.id, prompt, self.output_dir.clone());
        request.width = self.defaults.width;
        request.height = self.defaults.height;
        request.seed = self.defaults.seed;
        request.steps = self.defaults.steps;
        request.negative_prompt = self.defaults.negative_prompt.clone();
        request.workflow = Some(self.workflow.clone());
        Ok(request)
    }
}

#[async_trait]
impl ItemStep<WorkItem> for GenerateStep {
    type Output = Vec<PathBuf>;

    fn kind(&self) -> StageKind {
        StageKind::Generate
    }

    async fn attempt(&self, item: &WorkItem) -> Result<Vec<PathBuf>, StageError> {
        let request = self.request_for(item)?;
        let result = self.bridge.execute(&request).await?;
        if result.success {
            tracing::debug!(item_id = %item.id, path = %result.path, artifacts = result.artifacts.len(), "generated");
            Ok(result.artifacts)
        } else {
            Err(StageError::GenerationFailed(
                result
                    .failure
                    .unwrap_or_else(|| "engine reported failure".to_string()),
            ))
        }
    }

    fn apply(&self, item: &mut WorkItem, artifacts: Vec<PathBuf>) {
        item.payload.artifacts = artifacts;
    }

    fn success_message(&self, item: &WorkItem) -> String {
        format!(
            "Generated {} artifact(s) for {}",
            item.payload.artifacts.len(),
            item.id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{EngineRuntime, ExecutionPath};
    use crate::errors::BridgeError;
    use crate::item::Payload;
    use std::collections::HashMap;
    use std::time::Duration;

    struct Runtime {
        path: ExecutionPath,
        usable: bool,
        fail_generate: bool,
    }

    #[async_trait]
    impl EngineRuntime for Runtime {
        fn path(&self) -> ExecutionPath {
            self.path
        }

        async fn probe(&self) -> Result<(), BridgeError> {
            if self.usable {
                Ok(())
            } else {
                Err(BridgeError::EnvironmentMismatch("not here".into()))
            }
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<Vec<PathBuf>, BridgeError> {
            if self.fail_generate {
                Err(BridgeError::GenerationFailed("sampler crashed".into()))
            } else {
                Ok(vec![request.output_file()])
            }
        }
    }

    fn step(in_process: bool, subprocess: bool, fail_generate: bool) -> GenerateStep {
        let bridge = ExecutionBridge::new(
            Arc::new(Runtime {
                path: ExecutionPath::InProcess,
                usable: in_process,
                fail_generate,
            }),
            Arc::new(Runtime {
                path: ExecutionPath::Subprocess,
                usable: subprocess,
                fail_generate,
            }),
            Duration::from_secs(1),
        );
        let script = r#"parser.add_argument("--prompt", default="cat")"#.to_string();
        let workflow = WorkflowDefinition::parse("flow.py", script, &HashMap::new()).unwrap();
        GenerateStep::new(
            Arc::new(bridge),
            Arc::new(workflow),
            GenerationDefaults::default(),
            PathBuf::from("/tmp/out"),
        )
    }

    fn prompted(id: &str) -> WorkItem {
        let mut item = WorkItem::new(id, "origin", Payload::default());
        item.payload.prompt = Some("neon cat".into());
        item
    }

    #[tokio::test]
    async fn test_generate_sets_artifacts() {
        let step = step(true, true, false);
        let mut item = prompted("p1");
        let artifacts = step.attempt(&item).await.unwrap();
        step.apply(&mut item, artifacts);
        assert_eq!(item.payload.artifacts, vec![PathBuf::from("/tmp/out/p1.png")]);
    }

    #[tokio::test]
    async fn test_per_item_failure_is_retryable() {
        let err = step(true, true, true).attempt(&prompted("p1")).await.unwrap_err();
        assert_eq!(err, StageError::GenerationFailed("Generation failed: sampler crashed".into()));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_no_execution_path_is_session_fatal() {
        let err = step(false, false, false)
            .attempt(&prompted("p1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::EngineUnavailable(_)));
        assert!(err.is_session_fatal());
    }

    #[test]
    fn test_request_carries_defaults() {
        let step = step(true, true, false);
        let request = step.request_for(&prompted("p9")).unwrap();
        assert_eq!((request.width, request.height), (768, 1024));
        assert_eq!(request.correlation_id, "p9");
        assert!(request.workflow.is_some());
        assert!(step.request_for(&WorkItem::new("x", "o", Payload::default())).is_err());
    }
}
