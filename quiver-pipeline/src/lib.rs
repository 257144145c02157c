//! Dependency-ordered indicator pipelines.
//!
//! A [`PipelineBuilder`] validates stage declarations into an immutable
//! [`PipelineConfig`], which runs either as a batch over a full dataset
//! ([`execute`]) or incrementally one point at a time ([`stream_execute`]).
//! Streams can be composed and their state persisted as versioned blobs.

pub mod batch;
pub mod builder;
pub mod composition;
pub mod definition;
pub mod error;
mod graph;
pub mod metrics;
pub mod store;
pub mod streaming;

pub use batch::{execute, BatchExecutor, ExecutionResult, StagePoint};
pub use builder::{
    ExecutionPolicy, InputMapping, PipelineBuilder, PipelineConfig, Stage, StageOptions,
};
pub use composition::{
    compose_execute, compose_streams, stream_metrics, CompositionConfig, CompositionState,
    CompositionUpdate, NamedStream, StreamError, StreamSpec,
};
pub use definition::build_pipeline;
pub use error::{
    ExecutionError, InputContext, PipelineError, PipelineResult, StageFailure, StateError,
    ValidationError,
};
pub use metrics::{
    AggregateMetrics, MetricsAggregator, PipelineMetrics, RunMetrics, StageMetrics, StageRun,
};
pub use store::{
    deserialize_composition, deserialize_state, serialize_composition, serialize_state,
    SCHEMA_VERSION,
};
pub use streaming::{
    init_streaming, stream_execute, streaming_stages, SharedStream, StreamOutput, StreamUpdate,
    StreamingState,
};
