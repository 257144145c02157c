//! Stage declarations, validation and the immutable pipeline configuration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::time::Duration;

use quiver_config::{ErrorPolicy, ExecutionMode, ExecutionSettings};
use quiver_indicators::{IndicatorCapability, Params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::graph;

/// Where a stage reads its input series from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InputMapping {
    /// The dataset (batch) or data point (streaming) handed to the pipeline.
    #[default]
    Data,
    /// The output of another stage, which implicitly becomes a prerequisite.
    Stage(String),
}

/// Optional settings supplied with [`PipelineBuilder::add_stage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOptions {
    pub depends_on: Vec<String>,
    pub input: InputMapping,
}

impl StageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a prerequisite stage.
    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    /// Feeds the stage with the output of `stage`.
    pub fn input_from(mut self, stage: impl Into<String>) -> Self {
        self.input = InputMapping::Stage(stage.into());
        self
    }
}

/// A named indicator computation inside a pipeline.
#[derive(Debug, Clone)]
pub struct Stage {
    id: String,
    indicator: IndicatorCapability,
    params: Params,
    dependencies: Vec<String>,
    input: InputMapping,
}

impl Stage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn indicator(&self) -> &IndicatorCapability {
        &self.indicator
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Prerequisite stage ids in declaration order, without duplicates.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn input(&self) -> &InputMapping {
        &self.input
    }

    fn add_dependency(&mut self, dependency: String) {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
    }
}

/// Resolved execution policy of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub mode: ExecutionMode,
    pub error_policy: ErrorPolicy,
    /// Upper bound on worker threads in parallel mode.
    pub max_workers: usize,
    /// Deadline for a single batch stage invocation.
    pub stage_timeout: Option<Duration>,
}

impl ExecutionPolicy {
    /// Shallow merge: every field set in `settings` replaces the current one.
    pub fn merge(&mut self, settings: &ExecutionSettings) {
        if let Some(mode) = settings.mode {
            self.mode = mode;
        }
        if let Some(policy) = settings.error_policy {
            self.error_policy = policy;
        }
        if let Some(workers) = settings.max_workers {
            self.max_workers = workers;
        }
        if let Some(timeout) = settings.stage_timeout() {
            self.stage_timeout = Some(timeout);
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            error_policy: ErrorPolicy::FailFast,
            max_workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            stage_timeout: None,
        }
    }
}

/// Immutable, validated pipeline.
#[derive(Debug)]
pub struct PipelineConfig {
    id: Uuid,
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
    waves: Vec<Vec<usize>>,
    policy: ExecutionPolicy,
}

impl PipelineConfig {
    /// Identifier generated at build time.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.index.get(id).map(|&idx| &self.stages[idx])
    }

    /// Stage ids in resolved execution order.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&idx| self.stages[idx].id.as_str())
            .collect()
    }

    /// Stages in resolved execution order.
    pub fn ordered_stages(&self) -> impl Iterator<Item = &Stage> + '_ {
        self.order.iter().map(move |&idx| &self.stages[idx])
    }

    /// Stage ids grouped into waves that can run concurrently.
    pub fn waves(&self) -> Vec<Vec<&str>> {
        self.waves
            .iter()
            .map(|wave| {
                wave.iter()
                    .map(|&idx| self.stages[idx].id.as_str())
                    .collect()
            })
            .collect()
    }

    /// Stage id → prerequisite ids.
    pub fn dependency_map(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.stages
            .iter()
            .map(|stage| {
                (
                    stage.id.clone(),
                    stage.dependencies.iter().cloned().collect(),
                )
            })
            .collect()
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub(crate) fn wave_indices(&self) -> &[Vec<usize>] {
        &self.waves
    }

    pub(crate) fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

/// Accumulates stage declarations and produces a [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
    edges: Vec<(String, String)>,
    policy: ExecutionPolicy,
}

impl PipelineBuilder {
    /// Empty builder with sequential, fail-fast execution.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a stage. Ids must be unique.
    pub fn add_stage(
        mut self,
        id: impl Into<String>,
        indicator: IndicatorCapability,
        params: Params,
        opts: StageOptions,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        if self.stages.iter().any(|stage| stage.id == id) {
            return Err(ValidationError::DuplicateStage(id));
        }
        let mut stage = Stage {
            id,
            indicator,
            params,
            dependencies: Vec::new(),
            input: opts.input,
        };
        for dependency in opts.depends_on {
            stage.add_dependency(dependency);
        }
        if let InputMapping::Stage(upstream) = stage.input.clone() {
            stage.add_dependency(upstream);
        }
        self.stages.push(stage);
        Ok(self)
    }

    /// Records that `dependent` must run after `dependency`. Either stage may
    /// be declared later; both ids are checked by [`build`](Self::build).
    pub fn add_dependency(
        mut self,
        dependent: impl Into<String>,
        dependency: impl Into<String>,
    ) -> Self {
        self.edges.push((dependent.into(), dependency.into()));
        self
    }

    /// Merges execution settings into the current policy.
    pub fn configure(mut self, settings: &ExecutionSettings) -> Self {
        self.policy.merge(settings);
        self
    }

    /// Validates the declarations and resolves the execution order.
    pub fn build(mut self) -> Result<PipelineConfig, ValidationError> {
        if self.stages.is_empty() {
            return Err(ValidationError::Empty);
        }
        for (dependent, dependency) in std::mem::take(&mut self.edges) {
            let stage = self
                .stages
                .iter_mut()
                .find(|stage| stage.id == dependent)
                .ok_or(ValidationError::UnknownStage(dependent))?;
            stage.add_dependency(dependency);
        }
        if self.policy.max_workers == 0 {
            return Err(ValidationError::InvalidSettings(
                "max_workers must be at least 1".into(),
            ));
        }

        let index: HashMap<String, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(idx, stage)| (stage.id.clone(), idx))
            .collect();

        let mut prerequisites = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            if let InputMapping::Stage(upstream) = &stage.input {
                if !index.contains_key(upstream) {
                    return Err(ValidationError::UnknownInput {
                        stage: stage.id.clone(),
                        input: upstream.clone(),
                    });
                }
            }
            let mut resolved = Vec::with_capacity(stage.dependencies.len());
            for dependency in &stage.dependencies {
                if *dependency == stage.id {
                    return Err(ValidationError::SelfDependency(stage.id.clone()));
                }
                let idx = index.get(dependency).copied().ok_or_else(|| {
                    ValidationError::UnknownDependency {
                        stage: stage.id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                resolved.push(idx);
            }
            stage
                .indicator
                .validate(&stage.params)
                .map_err(|source| ValidationError::InvalidParams {
                    stage: stage.id.clone(),
                    source,
                })?;
            prerequisites.push(resolved);
        }

        let resolution = graph::resolve(&prerequisites).map_err(|members| {
            ValidationError::Cycle(
                members
                    .into_iter()
                    .map(|idx| self.stages[idx].id.clone())
                    .collect(),
            )
        })?;

        let config = PipelineConfig {
            id: Uuid::new_v4(),
            stages: self.stages,
            index,
            order: resolution.order,
            waves: resolution.waves,
            policy: self.policy,
        };
        for stage in config.ordered_stages() {
            debug!(
                pipeline = %config.id,
                stage = stage.id(),
                indicator = stage.indicator().name(),
                streaming = stage.indicator().is_streaming(),
                "resolved stage"
            );
        }
        info!(
            pipeline = %config.id,
            stages = config.stages.len(),
            waves = config.waves.len(),
            mode = ?config.policy.mode,
            error_policy = ?config.policy.error_policy,
            "pipeline built"
        );
        Ok(config)
    }
}
