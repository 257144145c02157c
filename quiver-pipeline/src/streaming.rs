//! Incremental execution: one data point per call, one opaque state per
//! streaming stage.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quiver_config::ErrorPolicy;
use quiver_core::DataPoint;
use quiver_indicators::{IndicatorError, IndicatorState};
use tracing::{debug, warn};

use crate::builder::{InputMapping, PipelineConfig, Stage};
use crate::error::{
    ExecutionError, InputContext, PipelineResult, StageFailure, StateError,
};
use crate::metrics::{PipelineMetrics, RunMetrics, StageRun};

/// Snapshot of a running stream. Transitions produce a new value and leave
/// the previous one untouched.
#[derive(Debug, Clone)]
pub struct StreamingState {
    config: Arc<PipelineConfig>,
    stages: BTreeMap<String, IndicatorState>,
    metrics: PipelineMetrics,
    last_update: Option<DateTime<Utc>>,
}

impl StreamingState {
    pub(crate) fn from_parts(
        config: Arc<PipelineConfig>,
        stages: BTreeMap<String, IndicatorState>,
        metrics: PipelineMetrics,
        last_update: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            config,
            stages,
            metrics,
            last_update,
        }
    }

    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    /// Per-stage state of every streaming stage.
    pub fn stages(&self) -> &BTreeMap<String, IndicatorState> {
        &self.stages
    }

    pub fn stage_state(&self, id: &str) -> Option<&IndicatorState> {
        self.stages.get(id)
    }

    /// Cumulative metrics over every call made on this stream.
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Wall-clock time of the last successful call.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Shorthand for [`stream_execute`].
    pub fn advance(&self, point: &DataPoint) -> PipelineResult<StreamUpdate> {
        stream_execute(self, point)
    }
}

impl PartialEq for StreamingState {
    fn eq(&self, other: &Self) -> bool {
        self.config.id() == other.config.id()
            && self.stages == other.stages
            && self.metrics == other.metrics
            && self.last_update == other.last_update
    }
}

/// Outputs of one streaming call.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutput {
    /// Stages that produced a value for this point.
    pub results: BTreeMap<String, DataPoint>,
    /// Failures tolerated under [`ErrorPolicy::ContinueOnError`].
    pub errors: Vec<ExecutionError>,
    pub metrics: RunMetrics,
}

/// Successor state plus the outputs of the call that produced it.
#[derive(Debug, Clone)]
pub struct StreamUpdate {
    pub state: StreamingState,
    pub output: StreamOutput,
}

/// Stages that take part in streaming, in execution order.
///
/// A stage qualifies when its indicator can stream and, if it reads another
/// stage's output, that upstream stage qualifies too.
pub fn streaming_stages(config: &PipelineConfig) -> Vec<&Stage> {
    let mut eligible: HashSet<&str> = HashSet::new();
    let mut stages = Vec::new();
    for stage in config.ordered_stages() {
        if !stage.indicator().is_streaming() {
            continue;
        }
        if let InputMapping::Stage(upstream) = stage.input() {
            if !eligible.contains(upstream.as_str()) {
                warn!(
                    stage = stage.id(),
                    upstream = %upstream,
                    "stage reads from a stage that cannot stream; excluded from streaming"
                );
                continue;
            }
        }
        eligible.insert(stage.id());
        stages.push(stage);
    }
    stages
}

/// Builds the initial streaming state of `config`.
pub fn init_streaming(config: Arc<PipelineConfig>) -> PipelineResult<StreamingState> {
    let mut stages = BTreeMap::new();
    for stage in streaming_stages(&config) {
        let Some(indicator) = stage.indicator().as_streaming() else {
            continue;
        };
        let state = indicator.init(stage.params()).map_err(|err| {
            ExecutionError::new(
                stage.id(),
                StageFailure::Indicator(err),
                InputContext::Initialization,
            )
        })?;
        stages.insert(stage.id().to_string(), state);
    }
    debug!(
        pipeline = %config.id(),
        streaming = stages.len(),
        total = config.stages().len(),
        "streaming state initialized"
    );
    Ok(StreamingState::from_parts(
        config,
        stages,
        PipelineMetrics::new(),
        None,
    ))
}

/// Advances every streaming stage by exactly one point.
///
/// Under fail-fast the first stage error is returned and `state` stays the
/// latest valid state, metrics included. Under continue-on-error a failing stage keeps its
/// previous state for this call and its dependents are skipped.
pub fn stream_execute(state: &StreamingState, point: &DataPoint) -> PipelineResult<StreamUpdate> {
    let config = &state.config;
    let started = Instant::now();
    let mut next = state.stages.clone();
    let mut results: BTreeMap<String, DataPoint> = BTreeMap::new();
    let mut errors = Vec::new();
    let mut failed: HashSet<&str> = HashSet::new();
    let mut run = RunMetrics::start(1);

    for stage in config.ordered_stages() {
        let (Some(current), Some(indicator)) = (
            state.stages.get(stage.id()),
            stage.indicator().as_streaming(),
        ) else {
            continue;
        };
        if current.indicator() != indicator.name() {
            return Err(StateError::IndicatorMismatch {
                stage: stage.id().to_string(),
                expected: indicator.name().to_string(),
                found: current.indicator().to_string(),
            }
            .into());
        }

        let blocked = stage
            .dependencies()
            .iter()
            .find(|dep| failed.contains(dep.as_str()));
        if let Some(upstream) = blocked {
            failed.insert(stage.id());
            run.stages.insert(
                stage.id().to_string(),
                StageRun {
                    failed: true,
                    ..StageRun::default()
                },
            );
            errors.push(ExecutionError::new(
                stage.id(),
                StageFailure::UpstreamFailed(upstream.clone()),
                InputContext::stream(point),
            ));
            continue;
        }

        let input = match stage.input() {
            InputMapping::Data => Cow::Borrowed(point),
            InputMapping::Stage(upstream) => match results.get(upstream) {
                Some(upstream_point) => Cow::Owned(upstream_point.clone()),
                // Upstream is still warming up.
                None => continue,
            },
        };

        let stage_started = Instant::now();
        match indicator.update(current, &input, stage.params()) {
            Ok(transition) => {
                run.stages.insert(
                    stage.id().to_string(),
                    StageRun {
                        elapsed: stage_started.elapsed(),
                        results: usize::from(transition.output.is_some()),
                        failed: false,
                    },
                );
                next.insert(stage.id().to_string(), transition.state);
                if let Some(output) = transition.output {
                    results.insert(stage.id().to_string(), output);
                }
            }
            Err(IndicatorError::InvalidState(reason)) => {
                return Err(StateError::Corrupt {
                    stage: stage.id().to_string(),
                    reason,
                }
                .into());
            }
            Err(err) => {
                let error = ExecutionError::new(
                    stage.id(),
                    StageFailure::Indicator(err),
                    InputContext::stream(&input),
                );
                if config.policy().error_policy == ErrorPolicy::FailFast {
                    return Err(error.into());
                }
                warn!(stage = stage.id(), error = %error, "stage update failed; continuing");
                failed.insert(stage.id());
                run.stages.insert(
                    stage.id().to_string(),
                    StageRun {
                        elapsed: stage_started.elapsed(),
                        results: 0,
                        failed: true,
                    },
                );
                errors.push(error);
            }
        }
    }

    run.elapsed = started.elapsed();
    let mut metrics = state.metrics.clone();
    metrics.record(&run);
    debug!(
        pipeline = %config.id(),
        timestamp = %point.timestamp,
        results = results.len(),
        errors = errors.len(),
        "stream advanced"
    );
    Ok(StreamUpdate {
        state: StreamingState::from_parts(Arc::clone(config), next, metrics, Some(Utc::now())),
        output: StreamOutput {
            results,
            errors,
            metrics: run,
        },
    })
}

/// A stream guarded by a mutex so several threads can feed the same logical
/// stream. Each transition is applied atomically.
#[derive(Debug)]
pub struct SharedStream {
    inner: Mutex<StreamingState>,
}

impl SharedStream {
    pub fn new(state: StreamingState) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }

    /// Advances the stream by one point and installs the successor state.
    pub fn advance(&self, point: &DataPoint) -> PipelineResult<StreamOutput> {
        let mut guard = self.inner.lock();
        let update = stream_execute(&guard, point)?;
        *guard = update.state;
        Ok(update.output)
    }

    pub fn snapshot(&self) -> StreamingState {
        self.inner.lock().clone()
    }

    pub fn into_inner(self) -> StreamingState {
        self.inner.into_inner()
    }
}
