//! One-shot execution of a pipeline over a complete dataset.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use quiver_config::{ErrorPolicy, ExecutionMode};
use quiver_core::{DataPoint, Series};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::builder::{InputMapping, PipelineConfig, Stage};
use crate::error::{ExecutionError, InputContext, PipelineError, PipelineResult, StageFailure};
use crate::metrics::{MetricsAggregator, PipelineMetrics, RunMetrics, StageRun};

/// One output point tagged with the stage that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePoint {
    pub stage_id: String,
    pub point: DataPoint,
}

/// Everything produced by a single batch run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Output series of every stage that succeeded.
    pub results: BTreeMap<String, Series>,
    /// All outputs in timestamp order; ties keep stage declaration order.
    pub merged: Vec<StagePoint>,
    pub metrics: RunMetrics,
    /// Failures tolerated under [`ErrorPolicy::ContinueOnError`].
    pub errors: Vec<ExecutionError>,
}

impl ExecutionResult {
    pub fn stage(&self, id: &str) -> Option<&Series> {
        self.results.get(id)
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs `config` over `data` with a freshly created executor.
pub fn execute(config: &PipelineConfig, data: &[DataPoint]) -> PipelineResult<ExecutionResult> {
    BatchExecutor::new(config)?.execute(data)
}

/// Batch executor bound to one pipeline. In parallel mode it owns a worker
/// pool that is reused across calls. Every call, including one aborted by a
/// fail-fast error, is folded into the executor's cumulative metrics.
pub struct BatchExecutor<'a> {
    config: &'a PipelineConfig,
    pool: Option<ThreadPool>,
    metrics: MetricsAggregator,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(config: &'a PipelineConfig) -> PipelineResult<Self> {
        let pool = match config.policy().mode {
            ExecutionMode::Sequential => None,
            ExecutionMode::Parallel => Some(
                ThreadPoolBuilder::new()
                    .num_threads(config.policy().max_workers)
                    .thread_name(|idx| format!("quiver-stage-{idx}"))
                    .build()
                    .map_err(|err| {
                        PipelineError::Runtime(format!("failed to start worker pool: {err}"))
                    })?,
            ),
        };
        Ok(Self {
            config,
            pool,
            metrics: MetricsAggregator::new(),
        })
    }

    /// Totals over every call made through this executor.
    pub fn metrics(&self) -> PipelineMetrics {
        self.metrics.snapshot()
    }

    /// Runs every stage wave by wave in resolved order.
    pub fn execute(&self, data: &[DataPoint]) -> PipelineResult<ExecutionResult> {
        let config = self.config;
        let started = Instant::now();
        let mut run = BatchRun::new(config, data);

        if let Err(error) = self.run_waves(&mut run) {
            let partial = run.into_metrics(started.elapsed());
            self.metrics.record(&partial);
            warn!(
                pipeline = %config.id(),
                stage = %error.stage_id,
                attempted = partial.stages.len(),
                "batch run aborted"
            );
            return Err(error.into());
        }

        let result = run.finish(started.elapsed());
        self.metrics.record(&result.metrics);
        info!(
            pipeline = %config.id(),
            points = data.len(),
            stages = result.results.len(),
            errors = result.errors.len(),
            elapsed_ms = result.metrics.elapsed.as_millis() as u64,
            "batch run finished"
        );
        Ok(result)
    }

    fn run_waves(&self, run: &mut BatchRun<'_>) -> Result<(), ExecutionError> {
        let config = self.config;
        let timeout = config.policy().stage_timeout;
        for wave in config.wave_indices() {
            let runnable = run.prepare_wave(wave);
            match &self.pool {
                None => {
                    for (idx, input) in runnable {
                        let outcome = timed(&config.stages()[idx], &input, timeout);
                        run.settle(idx, &input, outcome)?;
                    }
                }
                Some(pool) => {
                    let outcomes: Vec<_> = pool.install(|| {
                        runnable
                            .into_par_iter()
                            .map(|(idx, input)| {
                                let outcome = timed(&config.stages()[idx], &input, timeout);
                                (idx, input, outcome)
                            })
                            .collect()
                    });
                    for (idx, input, outcome) in outcomes {
                        run.settle(idx, &input, outcome)?;
                    }
                }
            }
        }
        Ok(())
    }
}

type StageOutcome = (Result<Series, StageFailure>, Duration);

/// Mutable bookkeeping of one batch call.
struct BatchRun<'a> {
    config: &'a PipelineConfig,
    raw: Arc<Series>,
    outputs: Vec<Option<Arc<Series>>>,
    failed: Vec<bool>,
    errors: Vec<ExecutionError>,
    metrics: RunMetrics,
}

impl<'a> BatchRun<'a> {
    fn new(config: &'a PipelineConfig, data: &[DataPoint]) -> Self {
        let count = config.stages().len();
        Self {
            config,
            raw: Arc::new(data.to_vec()),
            outputs: vec![None; count],
            failed: vec![false; count],
            errors: Vec::new(),
            metrics: RunMetrics::start(data.len()),
        }
    }

    /// Resolves the input of each stage in the wave. Stages downstream of a
    /// failure are marked as failed and left out.
    fn prepare_wave(&mut self, wave: &[usize]) -> Vec<(usize, Arc<Series>)> {
        let config = self.config;
        let mut runnable = Vec::with_capacity(wave.len());
        for &idx in wave {
            let stage = &config.stages()[idx];
            let blocked = stage
                .dependencies()
                .iter()
                .find(|dep| config.index_of(dep).is_some_and(|dep| self.failed[dep]));
            if let Some(upstream) = blocked {
                warn!(
                    stage = stage.id(),
                    upstream = %upstream,
                    "skipping stage downstream of a failure"
                );
                self.failed[idx] = true;
                self.metrics.stages.insert(
                    stage.id().to_string(),
                    StageRun {
                        failed: true,
                        ..StageRun::default()
                    },
                );
                self.errors.push(ExecutionError::new(
                    stage.id(),
                    StageFailure::UpstreamFailed(upstream.clone()),
                    InputContext::batch(&self.raw),
                ));
                continue;
            }
            let input = match stage.input() {
                InputMapping::Data => Some(Arc::clone(&self.raw)),
                InputMapping::Stage(upstream) => config
                    .index_of(upstream)
                    .and_then(|up| self.outputs[up].clone()),
            };
            runnable.push((idx, input.unwrap_or_default()));
        }
        runnable
    }

    /// Records the outcome of one stage. Under fail-fast the first failure is
    /// returned instead.
    fn settle(
        &mut self,
        idx: usize,
        input: &[DataPoint],
        (result, elapsed): StageOutcome,
    ) -> Result<(), ExecutionError> {
        let config = self.config;
        let stage = &config.stages()[idx];
        match result {
            Ok(series) => {
                debug!(
                    stage = stage.id(),
                    indicator = stage.indicator().name(),
                    inputs = input.len(),
                    results = series.len(),
                    elapsed_us = elapsed.as_micros() as u64,
                    "stage completed"
                );
                self.metrics.stages.insert(
                    stage.id().to_string(),
                    StageRun {
                        elapsed,
                        results: series.len(),
                        failed: false,
                    },
                );
                self.outputs[idx] = Some(Arc::new(series));
                Ok(())
            }
            Err(failure) => {
                let error = ExecutionError::new(stage.id(), failure, InputContext::batch(input));
                self.failed[idx] = true;
                self.metrics.stages.insert(
                    stage.id().to_string(),
                    StageRun {
                        elapsed,
                        results: 0,
                        failed: true,
                    },
                );
                if config.policy().error_policy == ErrorPolicy::FailFast {
                    return Err(error);
                }
                warn!(stage = stage.id(), error = %error, "stage failed; continuing");
                self.errors.push(error);
                Ok(())
            }
        }
    }

    /// Metrics of a run that stopped early.
    fn into_metrics(self, elapsed: Duration) -> RunMetrics {
        let mut metrics = self.metrics;
        metrics.elapsed = elapsed;
        metrics
    }

    fn finish(self, elapsed: Duration) -> ExecutionResult {
        let mut results = BTreeMap::new();
        let mut merged = Vec::new();
        for (stage, output) in self.config.stages().iter().zip(self.outputs) {
            let Some(output) = output else {
                continue;
            };
            let series = Arc::try_unwrap(output).unwrap_or_else(|shared| (*shared).clone());
            merged.extend(series.iter().map(|point| StagePoint {
                stage_id: stage.id().to_string(),
                point: point.clone(),
            }));
            results.insert(stage.id().to_string(), series);
        }
        // Stable sort keeps declaration order, then output order, on ties.
        merged.sort_by_key(|entry| entry.point.timestamp);

        let mut metrics = self.metrics;
        metrics.elapsed = elapsed;
        ExecutionResult {
            results,
            merged,
            metrics,
            errors: self.errors,
        }
    }
}

fn timed(stage: &Stage, input: &Arc<Series>, timeout: Option<Duration>) -> StageOutcome {
    let started = Instant::now();
    let result = run_stage(stage, input, timeout);
    (result, started.elapsed())
}

fn run_stage(
    stage: &Stage,
    input: &Arc<Series>,
    timeout: Option<Duration>,
) -> Result<Series, StageFailure> {
    let required = stage.indicator().min_length(stage.params());
    if input.len() < required {
        return Err(StageFailure::InsufficientData {
            required,
            available: input.len(),
        });
    }
    let Some(limit) = timeout else {
        return Ok(stage.indicator().compute(input, stage.params())?);
    };

    let (tx, rx) = mpsc::channel();
    let indicator = stage.indicator().clone();
    let params = stage.params().clone();
    let input = Arc::clone(input);
    thread::Builder::new()
        .name(format!("quiver-timed-{}", stage.id()))
        .spawn(move || {
            // The receiver is gone once the deadline passed.
            let _ = tx.send(indicator.compute(&input, &params));
        })
        .map_err(|_| StageFailure::WorkerLost)?;
    match rx.recv_timeout(limit) {
        Ok(result) => Ok(result?),
        Err(RecvTimeoutError::Timeout) => Err(StageFailure::Timeout(limit)),
        Err(RecvTimeoutError::Disconnected) => Err(StageFailure::WorkerLost),
    }
}
