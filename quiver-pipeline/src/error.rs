use std::fmt;
use std::time::Duration;

use quiver_core::{time_span, DataPoint, Timestamp};
use quiver_indicators::IndicatorError;
use thiserror::Error;

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Top-level error surfaced by the pipeline engine.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("stream `{stream}` failed: {source}")]
    Stream {
        stream: String,
        #[source]
        source: Box<PipelineError>,
    },
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Raised while building a pipeline or composition. A pipeline is never
/// returned in an invalid state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("pipeline has no stages")]
    Empty,
    #[error("stage `{0}` is declared more than once")]
    DuplicateStage(String),
    #[error("dependency declared for unknown stage `{0}`")]
    UnknownStage(String),
    #[error("stage `{stage}` depends on unknown stage `{dependency}`")]
    UnknownDependency { stage: String, dependency: String },
    #[error("stage `{stage}` reads its input from unknown stage `{input}`")]
    UnknownInput { stage: String, input: String },
    #[error("stage `{0}` depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle detected among: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("stage `{stage}` has invalid parameters: {source}")]
    InvalidParams {
        stage: String,
        #[source]
        source: IndicatorError,
    },
    #[error("stage `{stage}` uses an unknown indicator `{indicator}`")]
    UnknownIndicator { stage: String, indicator: String },
    #[error("invalid execution settings: {0}")]
    InvalidSettings(String),
    #[error("stream `{0}` is declared more than once")]
    DuplicateStream(String),
    #[error("stream `{stream}` runs after unknown stream `{after}`")]
    UnknownStream { stream: String, after: String },
}

/// Failure of a single stage, tagged with the stage and the input it was
/// processing.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("stage `{stage_id}` failed ({context}): {failure}")]
pub struct ExecutionError {
    pub stage_id: String,
    #[source]
    pub failure: StageFailure,
    pub context: InputContext,
}

impl ExecutionError {
    pub fn new(stage_id: impl Into<String>, failure: StageFailure, context: InputContext) -> Self {
        Self {
            stage_id: stage_id.into(),
            failure,
            context,
        }
    }
}

/// What went wrong inside a stage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageFailure {
    #[error(transparent)]
    Indicator(#[from] IndicatorError),
    #[error("needs at least {required} input points, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("skipped because upstream stage `{0}` failed")]
    UpstreamFailed(String),
    #[error("worker exited before returning a result")]
    WorkerLost,
}

/// Input a stage was working on when it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputContext {
    Initialization,
    Batch {
        points: usize,
        span: Option<(Timestamp, Timestamp)>,
    },
    Stream {
        timestamp: Timestamp,
    },
}

impl InputContext {
    pub fn batch(series: &[DataPoint]) -> Self {
        Self::Batch {
            points: series.len(),
            span: time_span(series),
        }
    }

    pub fn stream(point: &DataPoint) -> Self {
        Self::Stream {
            timestamp: point.timestamp,
        }
    }
}

impl fmt::Display for InputContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization => f.write_str("initialization"),
            Self::Batch { points, span: None } => write!(f, "batch of {points} points"),
            Self::Batch {
                points,
                span: Some((first, last)),
            } => write!(f, "batch of {points} points from {first} to {last}"),
            Self::Stream { timestamp } => write!(f, "stream point at {timestamp}"),
        }
    }
}

/// Problems with persisted or in-flight incremental state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("state blob is malformed: {0}")]
    Malformed(String),
    #[error("state blob does not start with the expected header")]
    BadMagic,
    #[error("unsupported state schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("state blob holds {found} state but {expected} state was requested")]
    WrongKind {
        expected: &'static str,
        found: String,
    },
    #[error("failed to encode state: {0}")]
    Encoding(String),
    #[error("persisted stage `{0}` is not a streaming stage of this pipeline")]
    UnknownStage(String),
    #[error("streaming stage `{0}` has no persisted state")]
    MissingStage(String),
    #[error("stage `{stage}` holds {found} state but runs {expected}")]
    IndicatorMismatch {
        stage: String,
        expected: String,
        found: String,
    },
    #[error("state of stage `{stage}` could not be decoded: {reason}")]
    Corrupt { stage: String, reason: String },
    #[error("persisted streams do not match the composition: {0}")]
    StreamMismatch(String),
}
