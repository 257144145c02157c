//! Per-call run metrics and the cumulative counters built from them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome of one stage within one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRun {
    pub elapsed: Duration,
    pub results: usize,
    pub failed: bool,
}

/// Metrics of a single batch run or streaming call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Input points consumed by the call.
    pub points: usize,
    /// Stages that were attempted, including failed and skipped ones.
    pub stages: BTreeMap<String, StageRun>,
}

impl RunMetrics {
    pub(crate) fn start(points: usize) -> Self {
        Self {
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
            points,
            stages: BTreeMap::new(),
        }
    }

    /// Number of stages that failed or were skipped in this call.
    pub fn failed_stages(&self) -> usize {
        self.stages.values().filter(|run| run.failed).count()
    }
}

/// Cumulative counters of a single stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    executions: u64,
    total_time: Duration,
    last_time: Duration,
    errors: u64,
    results: u64,
}

impl StageMetrics {
    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn last_time(&self) -> Duration {
        self.last_time
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn results(&self) -> u64 {
        self.results
    }

    fn record(&mut self, run: &StageRun) {
        self.executions += 1;
        self.total_time += run.elapsed;
        self.last_time = run.elapsed;
        self.results += run.results as u64;
        if run.failed {
            self.errors += 1;
        }
    }
}

/// Counters accumulated over every call made against one pipeline or stream.
///
/// Values only grow; a fresh instance is the only way to start over.
///
/// Streaming metrics live inside the state, so a streaming call that fails
/// under fail-fast is not counted: the caller keeps the previous state and
/// the failure is reported only through the returned error. Batch executors
/// record aborted runs as well.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    total_executions: u64,
    total_processing_time: Duration,
    last_execution_time: Duration,
    last_execution_at: Option<DateTime<Utc>>,
    points_processed: u64,
    stages: BTreeMap<String, StageMetrics>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one call into the running totals.
    pub fn record(&mut self, run: &RunMetrics) {
        self.total_executions += 1;
        self.total_processing_time += run.elapsed;
        self.last_execution_time = run.elapsed;
        self.last_execution_at = Some(run.started_at);
        self.points_processed += run.points as u64;
        for (stage, stage_run) in &run.stages {
            self.stages
                .entry(stage.clone())
                .or_default()
                .record(stage_run);
        }
    }

    pub fn total_executions(&self) -> u64 {
        self.total_executions
    }

    pub fn total_processing_time(&self) -> Duration {
        self.total_processing_time
    }

    pub fn last_execution_time(&self) -> Duration {
        self.last_execution_time
    }

    pub fn last_execution_at(&self) -> Option<DateTime<Utc>> {
        self.last_execution_at
    }

    pub fn points_processed(&self) -> u64 {
        self.points_processed
    }

    pub fn stages(&self) -> &BTreeMap<String, StageMetrics> {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&StageMetrics> {
        self.stages.get(id)
    }

    /// Sum of stage errors across all calls.
    pub fn total_errors(&self) -> u64 {
        self.stages.values().map(StageMetrics::errors).sum()
    }

    /// Points processed per second of processing time, zero before the
    /// first timed call.
    pub fn throughput(&self) -> f64 {
        let secs = self.total_processing_time.as_secs_f64();
        if secs > 0.0 {
            self.points_processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Thread-safe accumulator for repeated batch runs of one pipeline.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    inner: Mutex<PipelineMetrics>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run: &RunMetrics) {
        self.inner.lock().record(run);
    }

    /// Copy of the current totals.
    pub fn snapshot(&self) -> PipelineMetrics {
        self.inner.lock().clone()
    }
}

/// Metrics of several streams combined.
///
/// Throughput is the plain sum of each stream's throughput, not a weighted
/// average; streams with very different volumes are better compared through
/// the per-stream breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub total_executions: u64,
    pub total_processing_time: Duration,
    pub points_processed: u64,
    pub total_errors: u64,
    pub throughput: f64,
    pub streams: BTreeMap<String, PipelineMetrics>,
}

impl AggregateMetrics {
    /// Combines named metrics into one summary.
    pub fn combine<'a>(streams: impl IntoIterator<Item = (&'a str, &'a PipelineMetrics)>) -> Self {
        streams
            .into_iter()
            .fold(Self::default(), |mut acc, (name, metrics)| {
                acc.total_executions += metrics.total_executions();
                acc.total_processing_time += metrics.total_processing_time();
                acc.points_processed += metrics.points_processed();
                acc.total_errors += metrics.total_errors();
                acc.throughput += metrics.throughput();
                acc.streams.insert(name.to_string(), metrics.clone());
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(points: usize, millis: u64, stages: &[(&str, u64, usize, bool)]) -> RunMetrics {
        let mut metrics = RunMetrics::start(points);
        metrics.elapsed = Duration::from_millis(millis);
        for (id, elapsed, results, failed) in stages {
            metrics.stages.insert(
                id.to_string(),
                StageRun {
                    elapsed: Duration::from_millis(*elapsed),
                    results: *results,
                    failed: *failed,
                },
            );
        }
        metrics
    }

    #[test]
    fn stage_counters_are_isolated() {
        let mut totals = PipelineMetrics::new();
        totals.record(&run(10, 30, &[("fast", 10, 9, false), ("slow", 20, 0, true)]));
        totals.record(&run(10, 20, &[("fast", 5, 9, false)]));

        assert_eq!(totals.total_executions(), 2);
        assert_eq!(totals.points_processed(), 20);
        assert_eq!(totals.total_processing_time(), Duration::from_millis(50));
        assert_eq!(totals.last_execution_time(), Duration::from_millis(20));

        let fast = totals.stage("fast").unwrap();
        assert_eq!(fast.executions(), 2);
        assert_eq!(fast.total_time(), Duration::from_millis(15));
        assert_eq!(fast.last_time(), Duration::from_millis(5));
        assert_eq!(fast.results(), 18);
        assert_eq!(fast.errors(), 0);

        let slow = totals.stage("slow").unwrap();
        assert_eq!(slow.executions(), 1);
        assert_eq!(slow.errors(), 1);
        assert_eq!(totals.total_errors(), 1);
    }

    #[test]
    fn throughput_is_zero_until_time_is_recorded() {
        let mut totals = PipelineMetrics::new();
        assert_eq!(totals.throughput(), 0.0);
        totals.record(&run(100, 500, &[]));
        assert!((totals.throughput() - 200.0).abs() < 1e-9);
    }

    #[test]
    fn aggregator_accumulates_across_threads() {
        let aggregator = MetricsAggregator::new();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| aggregator.record(&run(5, 1, &[("a", 1, 5, false)])));
            }
        });
        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.total_executions(), 4);
        assert_eq!(snapshot.stage("a").unwrap().results(), 20);
    }

    #[test]
    fn combine_sums_counters_and_keeps_breakdown() {
        let mut left = PipelineMetrics::new();
        left.record(&run(10, 1000, &[("x", 1, 1, true)]));
        let mut right = PipelineMetrics::new();
        right.record(&run(30, 1000, &[]));

        let combined = AggregateMetrics::combine([("left", &left), ("right", &right)]);
        assert_eq!(combined.total_executions, 2);
        assert_eq!(combined.points_processed, 40);
        assert_eq!(combined.total_errors, 1);
        assert!((combined.throughput - 40.0).abs() < 1e-9);
        assert_eq!(combined.streams["right"], right);
    }
}
