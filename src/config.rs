//! Configuration for trendsmith.
//!
//! Settings live in `.trendsmith/trendsmith.toml` and are layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [scan]
//! subreddits = ["memes", "ProgrammerHumor"]
//! min_score = 1000
//! max_posts = 10
//! time_filter = "day"
//!
//! [model]
//! endpoint = "http://localhost:1234/v1"
//! model = "qwen/qwen3-vl-30b"
//! max_prompt_chars = 2000
//!
//! [engine]
//! api_endpoint = "http://127.0.0.1:8188"
//! api_workflow = "workflows/tshirt_api.json"
//! python = "python3"
//! engine_dir = "/opt/ComfyUI"
//! width = 768
//! height = 1024
//!
//! [workflow]
//! script = "workflows/tshirt.py"
//!
//! [workflow.roles]
//! text6 = "prompt"
//!
//! [pipeline]
//! auto_transform = true
//! auto_generate = true
//! max_retries = 2
//! pool_size = 2
//!
//! [output]
//! dir = "trendsmith_output"
//! ```
//!
//! Environment overrides: `TRENDSMITH_MODEL_ENDPOINT`,
//! `TRENDSMITH_COMFY_ENDPOINT`, `TRENDSMITH_PYTHON`.

use anyhow::{Context, Result};
use glob::glob;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::analyzer::{SlotMapping, SlotRole};
use crate::bridge::{ComfyApiRuntime, SubprocessRuntime};
use crate::collectors::{RedditCollector, SourceConfig};
use crate::organizer::FileOrganizer;
use crate::session::{Collaborators, SessionConfig};
use crate::stages::{GenerationDefaults, RetryPolicy};
use crate::transformer::{DEFAULT_MODEL, LmStudioTransformer};

pub const CONFIG_DIR: &str = ".trendsmith";
pub const CONFIG_FILE: &str = "trendsmith.toml";

pub const ENV_MODEL_ENDPOINT: &str = "TRENDSMITH_MODEL_ENDPOINT";
pub const ENV_COMFY_ENDPOINT: &str = "TRENDSMITH_COMFY_ENDPOINT";
pub const ENV_PYTHON: &str = "TRENDSMITH_PYTHON";

static SUBREDDIT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{2,21}$").expect("valid subreddit regex"));

/// Listing window for "top" posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFilter {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
    All,
}

impl std::fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeFilter::Hour => write!(f, "hour"),
            TimeFilter::Day => write!(f, "day"),
            TimeFilter::Week => write!(f, "week"),
            TimeFilter::Month => write!(f, "month"),
            TimeFilter::Year => write!(f, "year"),
            TimeFilter::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for TimeFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hour" => Ok(TimeFilter::Hour),
            "day" => Ok(TimeFilter::Day),
            "week" => Ok(TimeFilter::Week),
            "month" => Ok(TimeFilter::Month),
            "year" => Ok(TimeFilter::Year),
            "all" => Ok(TimeFilter::All),
            _ => anyhow::bail!(
                "Invalid time filter '{}'. Valid values: hour, day, week, month, year, all",
                s
            ),
        }
    }
}

/// Where trending posts come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSection {
    #[serde(default = "default_subreddits")]
    pub subreddits: Vec<String>,
    /// Posts below this score are skipped
    #[serde(default = "default_min_score")]
    pub min_score: i64,
    /// Posts kept per subreddit
    #[serde(default = "default_max_posts")]
    pub max_posts: usize,
    #[serde(default)]
    pub time_filter: TimeFilter,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_scan_timeout")]
    pub timeout_secs: u64,
}

fn default_subreddits() -> Vec<String> {
    vec!["memes".to_string()]
}

fn default_min_score() -> i64 {
    1000
}

fn default_max_posts() -> usize {
    10
}

fn default_user_agent() -> String {
    format!("trendsmith/{}", env!("CARGO_PKG_VERSION"))
}

fn default_scan_timeout() -> u64 {
    30
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            subreddits: default_subreddits(),
            min_score: default_min_score(),
            max_posts: default_max_posts(),
            time_filter: TimeFilter::default(),
            user_agent: default_user_agent(),
            timeout_secs: default_scan_timeout(),
        }
    }
}

/// Language model used by the Transform stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// OpenAI-compatible base URL
    #[serde(default = "default_model_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Longest prompt accepted from the model
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

fn default_model_endpoint() -> String {
    "http://localhost:1234/v1".to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_prompt_chars() -> usize {
    2000
}

fn default_model_timeout() -> u64 {
    120
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            endpoint: default_model_endpoint(),
            model: default_model(),
            max_prompt_chars: default_max_prompt_chars(),
            timeout_secs: default_model_timeout(),
        }
    }
}

/// Image generation engine and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// HTTP API of a running engine (in-process path)
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,
    /// API-format workflow export used by the in-process path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_workflow: Option<PathBuf>,
    /// Interpreter for the subprocess path
    #[serde(default = "default_python")]
    pub python: String,
    /// Engine installation; must exist for the subprocess path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_dir: Option<PathBuf>,
    /// Executor script taking `--request <file>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<PathBuf>,
    /// Scratch directory for request files (default: .trendsmith/work)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_secs: u64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

fn default_api_endpoint() -> String {
    "http://127.0.0.1:8188".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_generate_timeout() -> u64 {
    600
}

fn default_width() -> u32 {
    768
}

fn default_height() -> u32 {
    1024
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            api_endpoint: default_api_endpoint(),
            api_workflow: None,
            python: default_python(),
            engine_dir: None,
            executor: None,
            work_dir: None,
            probe_timeout_secs: default_probe_timeout(),
            generate_timeout_secs: default_generate_timeout(),
            width: default_width(),
            height: default_height(),
            seed: None,
            steps: None,
            negative_prompt: None,
        }
    }
}

/// Workflow script filled in by the Generate stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Slot name -> role, overriding analysis
    #[serde(default)]
    pub roles: HashMap<String, SlotRole>,
}

/// Stage chaining and execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_true")]
    pub auto_transform: bool,
    #[serde(default = "default_true")]
    pub auto_generate: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Items processed concurrently within a stage
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_pool_size() -> usize {
    2
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            auto_transform: true,
            auto_generate: true,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            pool_size: default_pool_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSection {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("trendsmith_output")
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

/// The complete trendsmith.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrendsmithToml {
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub output: OutputSection,
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl TrendsmithToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse trendsmith.toml")
    }

    /// Load `<config_dir>/trendsmith.toml`, or defaults if it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize trendsmith.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.scan.subreddits.is_empty() {
            warnings.push("No subreddits configured in [scan]".to_string());
        }
        for name in &self.scan.subreddits {
            if !SUBREDDIT_NAME.is_match(name) {
                warnings.push(format!("Invalid subreddit name '{}'", name));
            }
        }
        if self.scan.max_posts == 0 {
            warnings.push("scan.max_posts is 0: no posts will be collected".to_string());
        }
        for (key, url) in [
            ("model.endpoint", &self.model.endpoint),
            ("engine.api_endpoint", &self.engine.api_endpoint),
        ] {
            if !is_http_url(url) {
                warnings.push(format!("{} '{}' is not an http(s) URL", key, url));
            }
        }
        if self.model.max_prompt_chars == 0 {
            warnings.push("model.max_prompt_chars is 0: every prompt will be rejected".to_string());
        }
        for (key, value) in [("width", self.engine.width), ("height", self.engine.height)] {
            if value == 0 || value % 8 != 0 {
                warnings.push(format!(
                    "engine.{} = {} should be a positive multiple of 8",
                    key, value
                ));
            }
        }
        if self.pipeline.pool_size == 0 {
            warnings.push("pipeline.pool_size is 0; 1 will be used".to_string());
        }
        if self.pipeline.max_retries > 10 {
            warnings.push(format!(
                "pipeline.max_retries = {} is unusually high",
                self.pipeline.max_retries
            ));
        }
        if self.pipeline.auto_generate && !self.pipeline.auto_transform {
            warnings.push(
                "pipeline.auto_generate has no effect while auto_transform is off".to_string(),
            );
        }

        warnings
    }
}

/// Configuration resolved for one invocation: file, environment and CLI.
#[derive(Debug, Clone)]
pub struct TrendsmithConfig {
    pub project_dir: PathBuf,
    /// Path to the .trendsmith directory
    pub config_dir: PathBuf,
    pub toml: TrendsmithToml,
    pub verbose: bool,
    /// CLI override for [scan].subreddits
    pub cli_subreddits: Vec<String>,
    /// CLI override for [workflow].script
    pub cli_workflow: Option<PathBuf>,
}

impl TrendsmithConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = TrendsmithToml::load_or_default(&config_dir)?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            verbose: false,
            cli_subreddits: Vec::new(),
            cli_workflow: None,
        })
    }

    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        subreddits: Vec<String>,
        workflow: Option<PathBuf>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_subreddits = subreddits;
        config.cli_workflow = workflow;
        Ok(config)
    }

    /// Saved slot mappings and discoverable workflow scripts.
    pub fn workflows_dir(&self) -> PathBuf {
        self.config_dir.join("workflows")
    }

    /// Relative paths are taken from the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Model endpoint (env → file).
    pub fn model_endpoint(&self) -> String {
        std::env::var(ENV_MODEL_ENDPOINT).unwrap_or_else(|_| self.toml.model.endpoint.clone())
    }

    /// Engine API endpoint (env → file).
    pub fn comfy_endpoint(&self) -> String {
        std::env::var(ENV_COMFY_ENDPOINT).unwrap_or_else(|_| self.toml.engine.api_endpoint.clone())
    }

    /// Interpreter for the subprocess path (env → file).
    pub fn python(&self) -> String {
        std::env::var(ENV_PYTHON).unwrap_or_else(|_| self.toml.engine.python.clone())
    }

    /// Subreddits to scan (CLI → file).
    pub fn subreddits(&self) -> Vec<String> {
        if self.cli_subreddits.is_empty() {
            self.toml.scan.subreddits.clone()
        } else {
            self.cli_subreddits.clone()
        }
    }

    /// Workflow script (CLI → file → newest `*.py` in the workflows dir).
    pub fn workflow_script(&self) -> Option<PathBuf> {
        if let Some(path) = self.cli_workflow.as_ref().or(self.toml.workflow.script.as_ref()) {
            return Some(self.resolve(path));
        }
        let pattern = self.workflows_dir().join("*.py").to_string_lossy().to_string();
        let mut scripts: Vec<PathBuf> = glob(&pattern).ok()?.filter_map(|e| e.ok()).collect();
        scripts.sort_by(|a, b| {
            let a_time = a.metadata().and_then(|m| m.modified()).ok();
            let b_time = b.metadata().and_then(|m| m.modified()).ok();
            b_time.cmp(&a_time)
        });
        scripts.into_iter().next()
    }

    pub fn work_dir(&self) -> PathBuf {
        match &self.toml.engine.work_dir {
            Some(dir) => self.resolve(dir),
            None => self.config_dir.join("work"),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve(&self.toml.output.dir)
    }

    /// Slot roles for `script`: a saved mapping, overlaid by `[workflow.roles]`.
    pub fn role_overrides(&self, script: &Path) -> HashMap<String, SlotRole> {
        let mapping_path = SlotMapping::path_for(&self.workflows_dir(), script);
        let mut roles = if mapping_path.exists() {
            match SlotMapping::load(&mapping_path) {
                Ok(mapping) => mapping.role_overrides(),
                Err(e) => {
                    tracing::warn!(path = %mapping_path.display(), error = %e, "ignoring unreadable slot mapping");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        roles.extend(
            self.toml
                .workflow
                .roles
                .iter()
                .map(|(name, role)| (name.clone(), *role)),
        );
        roles
    }

    pub fn session_config(&self) -> SessionConfig {
        let scan = &self.toml.scan;
        let sources = self
            .subreddits()
            .into_iter()
            .map(|subreddit| SourceConfig {
                subreddit,
                min_score: scan.min_score,
                max_posts: scan.max_posts,
                time_filter: scan.time_filter,
            })
            .collect();
        let workflow = self.workflow_script();
        let role_overrides = workflow
            .as_deref()
            .map(|script| self.role_overrides(script))
            .unwrap_or_default();
        let engine = &self.toml.engine;
        let pipeline = &self.toml.pipeline;

        SessionConfig {
            sources,
            workflow,
            role_overrides,
            auto_transform: pipeline.auto_transform,
            auto_generate: pipeline.auto_generate,
            retry: RetryPolicy {
                max_retries: pipeline.max_retries,
                base_delay: Duration::from_millis(pipeline.retry_base_delay_ms),
                ..RetryPolicy::default()
            },
            pool_size: pipeline.pool_size.max(1),
            channel_capacity: pipeline.channel_capacity.max(1),
            max_prompt_chars: self.toml.model.max_prompt_chars,
            probe_timeout: Duration::from_secs(engine.probe_timeout_secs),
            call_timeout: Duration::from_secs(
                self.toml.model.timeout_secs.max(scan.timeout_secs),
            ),
            generate_timeout: Duration::from_secs(engine.generate_timeout_secs),
            generation: GenerationDefaults {
                width: engine.width,
                height: engine.height,
                seed: engine.seed,
                steps: engine.steps,
                negative_prompt: engine.negative_prompt.clone(),
            },
            generation_dir: self.work_dir().join("output"),
        }
    }

    /// Production collaborators built from this configuration.
    pub fn collaborators(&self) -> Collaborators {
        let engine = &self.toml.engine;
        let generate_timeout = Duration::from_secs(engine.generate_timeout_secs);
        Collaborators {
            collector: Arc::new(RedditCollector::new(
                self.toml.scan.user_agent.clone(),
                Duration::from_secs(self.toml.scan.timeout_secs),
            )),
            transformer: Arc::new(LmStudioTransformer::new(
                self.model_endpoint(),
                self.toml.model.model.clone(),
                Duration::from_secs(self.toml.model.timeout_secs),
            )),
            organizer: Arc::new(FileOrganizer::new(self.output_dir())),
            in_process: Arc::new(ComfyApiRuntime::new(
                self.comfy_endpoint(),
                engine.api_workflow.as_deref().map(|p| self.resolve(p)),
                generate_timeout,
            )),
            subprocess: Arc::new(
                SubprocessRuntime::new(self.python(), self.work_dir(), generate_timeout)
                    .with_engine_dir(engine.engine_dir.as_deref().map(|p| self.resolve(p)))
                    .with_executor(engine.executor.as_deref().map(|p| self.resolve(p))),
            ),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        for name in &self.cli_subreddits {
            if !SUBREDDIT_NAME.is_match(name) {
                warnings.push(format!("Invalid subreddit name '{}'", name));
            }
        }
        match self.workflow_script() {
            Some(script) if !script.exists() => warnings.push(format!(
                "Workflow script {} does not exist",
                script.display()
            )),
            Some(_) => {}
            None => warnings.push(
                "No workflow script: set [workflow].script or add one to .trendsmith/workflows"
                    .to_string(),
            ),
        }
        warnings
    }
}
