use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ExecutionPath;
use crate::analyzer::{SlotRole, SlotValue, WorkflowDefinition};

/// Everything the engine needs to render one design.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// Work item id; used to name request files and artifacts.
    pub correlation_id: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub seed: Option<i64>,
    pub steps: Option<u32>,
    /// Directory artifacts are written to.
    pub output_dir: PathBuf,
    /// Analyzed workflow script used by the subprocess path.
    #[serde(skip)]
    pub workflow: Option<Arc<WorkflowDefinition>>,
}

impl GenerationRequest {
    pub fn new(
        correlation_id: impl Into<String>,
        prompt: impl Into<String>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            prompt: prompt.into(),
            negative_prompt: None,
            width: 768,
            height: 1024,
            seed: None,
            steps: None,
            output_dir,
            workflow: None,
        }
    }

    /// Default artifact location for single-image workflows.
    pub fn output_file(&self) -> PathBuf {
        self.output_dir.join(format!("{}.png", self.correlation_id))
    }

    /// Values to write into the workflow's slots.
    pub fn role_values(&self, output: &Path) -> Vec<(SlotRole, SlotValue)> {
        let mut values = vec![
            (SlotRole::Prompt, SlotValue::Text(self.prompt.clone())),
            (SlotRole::Width, SlotValue::Integer(self.width as i64)),
            (SlotRole::Height, SlotValue::Integer(self.height as i64)),
            (
                SlotRole::OutputPath,
                SlotValue::Text(output.to_string_lossy().into_owned()),
            ),
        ];
        if let Some(negative) = &self.negative_prompt {
            values.push((SlotRole::NegativePrompt, SlotValue::Text(negative.clone())));
        }
        if let Some(seed) = self.seed {
            values.push((SlotRole::Seed, SlotValue::Integer(seed)));
        }
        if let Some(steps) = self.steps {
            values.push((SlotRole::Steps, SlotValue::Integer(steps as i64)));
        }
        values
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub correlation_id: String,
    pub success: bool,
    pub artifacts: Vec<PathBuf>,
    pub failure: Option<String>,
    pub path: ExecutionPath,
}

impl GenerationResult {
    pub fn succeeded(
        request: &GenerationRequest,
        path: ExecutionPath,
        artifacts: Vec<PathBuf>,
    ) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            success: true,
            artifacts,
            failure: None,
            path,
        }
    }

    pub fn failed(request: &GenerationRequest, path: ExecutionPath, failure: String) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            success: false,
            artifacts: Vec::new(),
            failure: Some(failure),
            path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_values_skip_unset_options() {
        let request = GenerationRequest::new("abc", "a fox", PathBuf::from("/out"));
        let roles: Vec<SlotRole> = request
            .role_values(Path::new("/out/abc.png"))
            .into_iter()
            .map(|(role, _)| role)
            .collect();
        assert_eq!(
            roles,
            vec![
                SlotRole::Prompt,
                SlotRole::Width,
                SlotRole::Height,
                SlotRole::OutputPath
            ]
        );
    }

    #[test]
    fn test_role_values_include_options() {
        let mut request = GenerationRequest::new("abc", "a fox", PathBuf::from("/out"));
        request.negative_prompt = Some("blurry".into());
        request.seed = Some(7);
        request.steps = Some(30);
        let values = request.role_values(Path::new("/out/abc.png"));
        assert!(values.contains(&(SlotRole::Seed, SlotValue::Integer(7))));
        assert!(values.contains(&(SlotRole::Steps, SlotValue::Integer(30))));
        assert!(values.contains(&(
            SlotRole::NegativePrompt,
            SlotValue::Text("blurry".into())
        )));
    }

    #[test]
    fn test_output_file_uses_correlation_id() {
        let request = GenerationRequest::new("p42", "x", PathBuf::from("/work"));
        assert_eq!(request.output_file(), PathBuf::from("/work/p42.png"));
    }
}
