//! Pipeline definitions and execution settings loaded from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Prefix for environment variable overrides (`QUIVER__EXECUTION__MODE=parallel`).
pub const ENV_PREFIX: &str = "QUIVER";

/// How the batch executor dispatches the stages of a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every stage runs on the calling thread.
    #[default]
    Sequential,
    /// Stages of a wave run on a bounded worker pool.
    Parallel,
}

/// Whether one stage's failure aborts the whole call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// The first failing stage aborts the call.
    #[default]
    FailFast,
    /// Failing stages are recorded and skipped.
    ContinueOnError,
}

/// Partial execution settings. Every `Some` field overrides the current
/// policy when merged; `None` leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub mode: Option<ExecutionMode>,
    pub error_policy: Option<ErrorPolicy>,
    pub max_workers: Option<usize>,
    pub stage_timeout_ms: Option<u64>,
}

impl ExecutionSettings {
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Timeout as a [`Duration`], if configured.
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,
    /// Registry name of the indicator.
    pub indicator: String,
    #[serde(default)]
    pub params: toml::Table,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Stage whose output series feeds this stage instead of the raw data.
    #[serde(default)]
    pub input: Option<String>,
}

/// A complete pipeline file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    /// Human-readable name, falling back to `"pipeline"`.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("pipeline")
    }
}

/// Loads a pipeline definition from a TOML file, applying `QUIVER__*`
/// environment overrides on top.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<PipelineDefinition> {
    let path = path.as_ref();
    let settings = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(true))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to load pipeline definition {}", path.display()))?;
    settings
        .try_deserialize()
        .with_context(|| format!("invalid pipeline definition in {}", path.display()))
}

/// Parses a pipeline definition from TOML text without environment overrides.
pub fn parse_pipeline(source: &str) -> Result<PipelineDefinition> {
    toml::from_str(source).context("invalid pipeline definition")
}
