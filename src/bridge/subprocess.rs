//! Subprocess runtime: run the engine in a separate interpreter process.
//!
//! Two invocation styles are supported:
//! - with an `executor` script: `<python> <executor> --request <file>`, where
//!   the request file is the serialized [`GenerationRequest`] plus the path
//!   of the prepared workflow script. The executor may list its outputs in
//!   `<correlation>.result.json` as `{"artifacts": [...]}`.
//! - without one: the workflow script itself, with its slots rewritten, is
//!   run as `<python> <script> --output <file>`.
//!
//! Exit code 0 means success. Artifacts not listed in a result file are
//! discovered by globbing the output directory for the correlation id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::{EngineRuntime, ExecutionPath, GenerationRequest};
use crate::errors::BridgeError;

/// Trailing stderr kept in failure messages.
const STDERR_TAIL_CHARS: usize = 600;

pub struct SubprocessRuntime {
    python: String,
    /// Working directory for the process (the engine checkout).
    engine_dir: Option<PathBuf>,
    executor: Option<PathBuf>,
    /// Where request files and prepared scripts are written.
    work_dir: PathBuf,
    timeout: Duration,
}

#[derive(Serialize)]
struct ExecutorRequest<'a> {
    #[serde(flatten)]
    request: &'a GenerationRequest,
    workflow: Option<&'a Path>,
    output_file: &'a Path,
}

#[derive(Deserialize)]
struct ExecutorResult {
    #[serde(default)]
    artifacts: Vec<PathBuf>,
}

impl SubprocessRuntime {
    pub fn new(python: impl Into<String>, work_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            engine_dir: None,
            executor: None,
            work_dir,
            timeout,
        }
    }

    pub fn with_engine_dir(mut self, engine_dir: Option<PathBuf>) -> Self {
        self.engine_dir = engine_dir;
        self
    }

    pub fn with_executor(mut self, executor: Option<PathBuf>) -> Self {
        self.executor = executor;
        self
    }

    async fn write_file(&self, path: &Path, content: &str) -> Result<(), BridgeError> {
        tokio::fs::write(path, content)
            .await
            .map_err(|source| BridgeError::RequestWriteFailed {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write the rewritten workflow script, if the request carries one.
    async fn prepare_script(
        &self,
        request: &GenerationRequest,
        output_file: &Path,
    ) -> Result<Option<PathBuf>, BridgeError> {
        let Some(workflow) = &request.workflow else {
            return Ok(None);
        };
        let script = workflow.render(&request.role_values(output_file))?;
        let path = self
            .work_dir
            .join(format!("{}.workflow.py", request.correlation_id));
        self.write_file(&path, &script).await?;
        Ok(Some(path))
    }

    async fn run(&self, args: Vec<std::ffi::OsString>, request: &GenerationRequest) -> Result<(), BridgeError> {
        let mut cmd = Command::new(&self.python);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TRENDSMITH_CORRELATION_ID", &request.correlation_id)
            .kill_on_drop(true);
        if let Some(dir) = &self.engine_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(
            item_id = %request.correlation_id,
            python = %self.python,
            ?args,
            "launching engine process"
        );
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BridgeError::EnvironmentMismatch(format!(
                    "interpreter '{}' not found",
                    self.python
                ))
            } else {
                BridgeError::GenerationFailed(format!("failed to spawn '{}': {}", self.python, e))
            }
        })?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                BridgeError::GenerationFailed(format!("failed to wait for engine process: {}", e))
            })?,
            // kill_on_drop reaps the child once the future is dropped
            Err(_) => {
                return Err(BridgeError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let tail_start = stderr
                .char_indices()
                .rev()
                .nth(STDERR_TAIL_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(0);
            return Err(BridgeError::GenerationFailed(format!(
                "engine process exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                &stderr[tail_start..]
            )));
        }
        Ok(())
    }

    /// Outputs named in the executor's result file, else files in the
    /// output directory whose names contain the correlation id.
    async fn collect_artifacts(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<PathBuf>, BridgeError> {
        let result_file = self
            .work_dir
            .join(format!("{}.result.json", request.correlation_id));
        if let Ok(content) = tokio::fs::read_to_string(&result_file).await {
            let result: ExecutorResult = serde_json::from_str(&content).map_err(|e| {
                BridgeError::GenerationFailed(format!(
                    "unreadable result file {}: {}",
                    result_file.display(),
                    e
                ))
            })?;
            let missing: Vec<_> = result.artifacts.iter().filter(|p| !p.exists()).collect();
            if !missing.is_empty() {
                return Err(BridgeError::GenerationFailed(format!(
                    "executor listed missing artifacts: {:?}",
                    missing
                )));
            }
            return Ok(result.artifacts);
        }

        let pattern = request
            .output_dir
            .join(format!("*{}*.png", glob::Pattern::escape(&request.correlation_id)));
        let artifacts: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| BridgeError::GenerationFailed(format!("bad artifact pattern: {}", e)))?
            .filter_map(Result::ok)
            .collect();
        Ok(artifacts)
    }
}

#[async_trait]
impl EngineRuntime for SubprocessRuntime {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Subprocess
    }

    async fn probe(&self) -> Result<(), BridgeError> {
        if let Some(dir) = &self.engine_dir
            && !dir.is_dir()
        {
            return Err(BridgeError::EnvironmentMismatch(format!(
                "engine directory {} does not exist",
                dir.display()
            )));
        }
        if let Some(executor) = &self.executor
            && !executor.is_file()
        {
            return Err(BridgeError::EnvironmentMismatch(format!(
                "executor script {} does not exist",
                executor.display()
            )));
        }

        let output = Command::new(&self.python)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                BridgeError::EnvironmentMismatch(format!(
                    "interpreter '{}' cannot be started: {}",
                    self.python, e
                ))
            })?;
        if !output.status.success() {
            return Err(BridgeError::EnvironmentMismatch(format!(
                "interpreter '{}' --version exited with {}",
                self.python, output.status
            )));
        }
        Ok(())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<PathBuf>, BridgeError> {
        for dir in [&self.work_dir, &request.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| BridgeError::RequestWriteFailed {
                    path: dir.clone(),
                    source,
                })?;
        }
        let output_file = request.output_file();
        let script = self.prepare_script(request, &output_file).await?;

        let args: Vec<std::ffi::OsString> = match (&self.executor, &script) {
            (Some(executor), _) => {
                let request_file = self
                    .work_dir
                    .join(format!("{}.request.json", request.correlation_id));
                let payload = ExecutorRequest {
                    request,
                    workflow: script.as_deref(),
                    output_file: &output_file,
                };
                let json = serde_json::to_string_pretty(&payload).map_err(|e| {
                    BridgeError::GenerationFailed(format!("cannot serialize request: {}", e))
                })?;
                self.write_file(&request_file, &json).await?;
                vec![
                    executor.clone().into(),
                    "--request".into(),
                    request_file.into(),
                ]
            }
            (None, Some(script)) => vec![
                script.clone().into(),
                "--output".into(),
                output_file.clone().into(),
            ],
            (None, None) => {
                return Err(BridgeError::EnvironmentMismatch(
                    "subprocess path needs an executor or a workflow script".into(),
                ));
            }
        };

        self.run(args, request).await?;

        let artifacts = self.collect_artifacts(request).await?;
        if artifacts.is_empty() {
            return Err(BridgeError::GenerationFailed(
                "engine process succeeded but produced no artifacts".into(),
            ));
        }
        Ok(artifacts)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::analyzer::WorkflowDefinition;
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Fake interpreter: answers `--version`, otherwise runs the executor
    /// protocol by writing an artifact and a result file.
    fn fake_python(dir: &Path) -> PathBuf {
        write_script(
            dir,
            "fake-python",
            r#"if [ "$1" = "--version" ]; then echo "Python 3.12.1"; exit 0; fi
req="$3"
base="${req%.request.json}"
out="$(dirname "$req")/../out/${TRENDSMITH_CORRELATION_ID}.png"
echo png > "$out"
printf '{"artifacts":["%s"]}' "$out" > "$base.result.json"
"#,
        )
    }

    fn runtime(tmp: &TempDir, python: &Path) -> SubprocessRuntime {
        let executor = write_script(tmp.path(), "executor.py", "exit 0\n");
        SubprocessRuntime::new(
            python.to_string_lossy(),
            tmp.path().join("work"),
            Duration::from_secs(10),
        )
        .with_executor(Some(executor))
    }

    fn request(tmp: &TempDir) -> GenerationRequest {
        GenerationRequest::new("item7", "neon skull tee", tmp.path().join("out"))
    }

    #[tokio::test]
    async fn test_probe_succeeds_with_interpreter() {
        let tmp = TempDir::new().unwrap();
        let python = fake_python(tmp.path());
        assert!(runtime(&tmp, &python).probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_missing_interpreter_is_mismatch() {
        let tmp = TempDir::new().unwrap();
        let rt = SubprocessRuntime::new(
            "/nonexistent/python-xyz",
            tmp.path().join("work"),
            Duration::from_secs(5),
        );
        let err = rt.probe().await.unwrap_err();
        assert!(matches!(err, BridgeError::EnvironmentMismatch(_)));
    }

    #[tokio::test]
    async fn test_probe_missing_engine_dir_is_mismatch() {
        let tmp = TempDir::new().unwrap();
        let python = fake_python(tmp.path());
        let rt = runtime(&tmp, &python).with_engine_dir(Some(tmp.path().join("no-comfy")));
        let err = rt.probe().await.unwrap_err();
        assert!(matches!(err, BridgeError::EnvironmentMismatch(ref m) if m.contains("no-comfy")));
    }

    #[tokio::test]
    async fn test_generate_reads_result_file() {
        let tmp = TempDir::new().unwrap();
        let python = fake_python(tmp.path());
        let rt = runtime(&tmp, &python);
        let artifacts = rt.generate(&request(&tmp)).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].exists());

        let request_json =
            std::fs::read_to_string(tmp.path().join("work/item7.request.json")).unwrap();
        assert!(request_json.contains("neon skull tee"));
        assert!(request_json.contains("\"correlation_id\": \"item7\""));
    }

    #[tokio::test]
    async fn test_generate_nonzero_exit_is_failure_with_stderr() {
        let tmp = TempDir::new().unwrap();
        let python = write_script(
            tmp.path(),
            "broken-python",
            "echo 'CUDA out of memory' >&2\nexit 3\n",
        );
        let err = runtime(&tmp, &python)
            .generate(&request(&tmp))
            .await
            .unwrap_err();
        match err {
            BridgeError::GenerationFailed(msg) => {
                assert!(msg.contains("code 3"));
                assert!(msg.contains("CUDA out of memory"));
            }
            other => panic!("Expected GenerationFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_timeout() {
        let tmp = TempDir::new().unwrap();
        let python = write_script(tmp.path(), "slow-python", "sleep 5\n");
        let rt = SubprocessRuntime::new(
            python.to_string_lossy(),
            tmp.path().join("work"),
            Duration::from_millis(200),
        )
        .with_executor(Some(write_script(tmp.path(), "executor.py", "exit 0\n")));
        let err = rt.generate(&request(&tmp)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_generate_runs_rewritten_script_without_executor() {
        let tmp = TempDir::new().unwrap();
        // Interpreter copies the script it was given next to the output file.
        let python = write_script(
            tmp.path(),
            "script-python",
            "cp \"$1\" \"$3.src\"\necho png > \"$3\"\n",
        );
        let text = "import argparse\nparser = argparse.ArgumentParser()\nparser.add_argument(\"--prompt\", default=\"old\")\n".to_string();
        let workflow = WorkflowDefinition::parse("wf.py", text, &HashMap::new()).unwrap();
        let mut req = request(&tmp);
        req.workflow = Some(Arc::new(workflow));

        let rt = SubprocessRuntime::new(
            python.to_string_lossy(),
            tmp.path().join("work"),
            Duration::from_secs(10),
        );
        let artifacts = rt.generate(&req).await.unwrap();
        assert_eq!(artifacts, vec![tmp.path().join("out/item7.png")]);

        let script = std::fs::read_to_string(tmp.path().join("out/item7.png.src")).unwrap();
        assert!(script.contains("default=\"neon skull tee\""));
    }

    #[tokio::test]
    async fn test_generate_without_script_or_executor_is_mismatch() {
        let tmp = TempDir::new().unwrap();
        let python = fake_python(tmp.path());
        let rt = SubprocessRuntime::new(
            python.to_string_lossy(),
            tmp.path().join("work"),
            Duration::from_secs(10),
        );
        let err = rt.generate(&request(&tmp)).await.unwrap_err();
        assert!(matches!(err, BridgeError::EnvironmentMismatch(_)));
    }
}
