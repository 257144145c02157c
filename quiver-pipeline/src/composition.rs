//! A primary stream advanced together with dependent streams.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use quiver_config::ErrorPolicy;
use quiver_core::DataPoint;
use tracing::{debug, info, warn};

use crate::builder::PipelineConfig;
use crate::error::{PipelineError, PipelineResult, ValidationError};
use crate::graph;
use crate::metrics::AggregateMetrics;
use crate::streaming::{init_streaming, stream_execute, StreamOutput, StreamingState};

/// One stream of a composition.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    pub config: Arc<PipelineConfig>,
    /// Streams that must advance first. Empty means "after the primary".
    pub after: Vec<String>,
}

/// Declaration of a composition: the primary stream plus its dependents.
#[derive(Debug, Clone)]
pub struct CompositionConfig {
    primary: StreamSpec,
    dependents: Vec<StreamSpec>,
    error_policy: ErrorPolicy,
}

impl CompositionConfig {
    pub fn new(name: impl Into<String>, config: Arc<PipelineConfig>) -> Self {
        Self {
            primary: StreamSpec {
                name: name.into(),
                config,
                after: Vec::new(),
            },
            dependents: Vec::new(),
            error_policy: ErrorPolicy::FailFast,
        }
    }

    /// Adds a stream that advances after the primary.
    pub fn with_dependent(self, name: impl Into<String>, config: Arc<PipelineConfig>) -> Self {
        self.with_dependent_after(name, config, Vec::<String>::new())
    }

    /// Adds a stream that advances after every stream named in `after`.
    pub fn with_dependent_after(
        mut self,
        name: impl Into<String>,
        config: Arc<PipelineConfig>,
        after: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.dependents.push(StreamSpec {
            name: name.into(),
            config,
            after: after.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn primary(&self) -> &StreamSpec {
        &self.primary
    }

    pub fn dependents(&self) -> &[StreamSpec] {
        &self.dependents
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    /// Primary first, then dependents in declaration order.
    pub fn streams(&self) -> impl Iterator<Item = &StreamSpec> + '_ {
        std::iter::once(&self.primary).chain(&self.dependents)
    }
}

/// A stream's state under its composition name.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedStream {
    pub name: String,
    pub state: StreamingState,
}

/// Running composition. Transitions produce a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositionState {
    streams: Vec<NamedStream>,
    graph: BTreeMap<String, Vec<String>>,
    order: Vec<String>,
    error_policy: ErrorPolicy,
}

impl CompositionState {
    /// Streams in declaration order, primary first.
    pub fn streams(&self) -> &[NamedStream] {
        &self.streams
    }

    pub fn stream(&self, name: &str) -> Option<&StreamingState> {
        self.streams
            .iter()
            .find(|stream| stream.name == name)
            .map(|stream| &stream.state)
    }

    pub fn primary(&self) -> &NamedStream {
        &self.streams[0]
    }

    /// Stream name → streams that advance after it.
    pub fn graph(&self) -> &BTreeMap<String, Vec<String>> {
        &self.graph
    }

    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }
}

/// A stream failure tolerated under continue-on-error.
#[derive(Debug)]
pub struct StreamError {
    pub stream: String,
    pub error: PipelineError,
}

/// Successor composition state plus per-stream outputs of one call.
#[derive(Debug)]
pub struct CompositionUpdate {
    pub state: CompositionState,
    pub results: BTreeMap<String, StreamOutput>,
    pub errors: Vec<StreamError>,
    /// Streams not advanced because a stream they run after failed.
    pub skipped: Vec<String>,
}

/// Initializes every stream of `config`.
pub fn compose_streams(config: &CompositionConfig) -> PipelineResult<CompositionState> {
    let state = assemble(config, |spec| init_streaming(Arc::clone(&spec.config)))?;
    info!(
        primary = %config.primary.name,
        streams = state.streams.len(),
        order = ?state.order,
        "composition initialized"
    );
    Ok(state)
}

/// Advances every stream with the same point, in composition order.
pub fn compose_execute(
    state: &CompositionState,
    point: &DataPoint,
) -> PipelineResult<CompositionUpdate> {
    let mut streams = state.streams.clone();
    let positions: HashMap<&str, usize> = state
        .streams
        .iter()
        .enumerate()
        .map(|(idx, stream)| (stream.name.as_str(), idx))
        .collect();
    let mut results = BTreeMap::new();
    let mut errors = Vec::new();
    let mut skipped = Vec::new();
    let mut blocked: HashSet<&str> = HashSet::new();

    for name in &state.order {
        let Some(&idx) = positions.get(name.as_str()) else {
            continue;
        };
        let dependents = state.graph.get(name).map(Vec::as_slice).unwrap_or_default();
        if blocked.contains(name.as_str()) {
            skipped.push(name.clone());
            blocked.extend(dependents.iter().map(String::as_str));
            continue;
        }
        match stream_execute(&streams[idx].state, point) {
            Ok(update) => {
                streams[idx].state = update.state;
                results.insert(name.clone(), update.output);
            }
            Err(error) => {
                if state.error_policy == ErrorPolicy::FailFast {
                    return Err(PipelineError::Stream {
                        stream: name.clone(),
                        source: Box::new(error),
                    });
                }
                warn!(stream = %name, error = %error, "stream failed; continuing");
                blocked.extend(dependents.iter().map(String::as_str));
                errors.push(StreamError {
                    stream: name.clone(),
                    error,
                });
            }
        }
    }

    debug!(
        timestamp = %point.timestamp,
        advanced = results.len(),
        failed = errors.len(),
        skipped = skipped.len(),
        "composition advanced"
    );
    Ok(CompositionUpdate {
        state: CompositionState {
            streams,
            graph: state.graph.clone(),
            order: state.order.clone(),
            error_policy: state.error_policy,
        },
        results,
        errors,
        skipped,
    })
}

/// Combined metrics of every stream, with the per-stream breakdown.
pub fn stream_metrics(state: &CompositionState) -> AggregateMetrics {
    AggregateMetrics::combine(
        state
            .streams
            .iter()
            .map(|stream| (stream.name.as_str(), stream.state.metrics())),
    )
}

/// Validates the stream graph of `config` and builds each stream's state
/// with `build`.
pub(crate) fn assemble(
    config: &CompositionConfig,
    mut build: impl FnMut(&StreamSpec) -> PipelineResult<StreamingState>,
) -> PipelineResult<CompositionState> {
    let specs: Vec<&StreamSpec> = config.streams().collect();
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        if index.insert(spec.name.as_str(), idx).is_some() {
            return Err(ValidationError::DuplicateStream(spec.name.clone()).into());
        }
    }

    let mut prerequisites = Vec::with_capacity(specs.len());
    prerequisites.push(Vec::new());
    for spec in &specs[1..] {
        if spec.after.is_empty() {
            prerequisites.push(vec![0]);
            continue;
        }
        let mut resolved = Vec::with_capacity(spec.after.len());
        for after in &spec.after {
            let idx = index
                .get(after.as_str())
                .copied()
                .ok_or_else(|| ValidationError::UnknownStream {
                    stream: spec.name.clone(),
                    after: after.clone(),
                })?;
            resolved.push(idx);
        }
        prerequisites.push(resolved);
    }

    let resolution = graph::resolve(&prerequisites).map_err(|members| {
        ValidationError::Cycle(
            members
                .into_iter()
                .map(|idx| specs[idx].name.clone())
                .collect(),
        )
    })?;

    let mut dependency_graph: BTreeMap<String, Vec<String>> = specs
        .iter()
        .map(|spec| (spec.name.clone(), Vec::new()))
        .collect();
    for (idx, prereqs) in prerequisites.iter().enumerate() {
        for &prereq in prereqs {
            let dependents = dependency_graph
                .entry(specs[prereq].name.clone())
                .or_default();
            if !dependents.contains(&specs[idx].name) {
                dependents.push(specs[idx].name.clone());
            }
        }
    }

    let mut streams = Vec::with_capacity(specs.len());
    for &spec in &specs {
        let state = build(spec).map_err(|err| PipelineError::Stream {
            stream: spec.name.clone(),
            source: Box::new(err),
        })?;
        streams.push(NamedStream {
            name: spec.name.clone(),
            state,
        });
    }

    Ok(CompositionState {
        streams,
        graph: dependency_graph,
        order: resolution
            .order
            .into_iter()
            .map(|idx| specs[idx].name.clone())
            .collect(),
        error_policy: config.error_policy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{PipelineBuilder, StageOptions};
    use chrono::{TimeZone, Utc};
    use quiver_indicators::{resolve_indicator, Params};
    use rust_decimal_macros::dec;

    fn pipeline(indicator: &str, source: Option<&str>) -> Arc<PipelineConfig> {
        let mut params = Params::new();
        params.insert("period".into(), toml::Value::Integer(2));
        if let Some(source) = source {
            params.insert("source".into(), toml::Value::String(source.into()));
        }
        Arc::new(
            PipelineBuilder::new()
                .add_stage(
                    indicator,
                    resolve_indicator(indicator).unwrap(),
                    params,
                    StageOptions::new(),
                )
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn primary_runs_first_and_after_is_honoured() {
        let config = CompositionConfig::new("prices", pipeline("sma", None))
            .with_dependent_after("volume", pipeline("ema", Some("volume")), ["trend"])
            .with_dependent("trend", pipeline("ema", None));
        let state = compose_streams(&config).unwrap();
        assert_eq!(state.execution_order(), ["prices", "trend", "volume"]);
        assert_eq!(state.graph()["prices"], vec!["trend".to_string()]);
        assert_eq!(state.graph()["trend"], vec!["volume".to_string()]);
        assert!(state.graph()["volume"].is_empty());
        assert_eq!(state.primary().name, "prices");
    }

    #[test]
    fn invalid_stream_graphs_are_rejected() {
        let duplicate = CompositionConfig::new("a", pipeline("sma", None))
            .with_dependent("a", pipeline("sma", None));
        assert!(matches!(
            compose_streams(&duplicate),
            Err(PipelineError::Validation(ValidationError::DuplicateStream(name))) if name == "a"
        ));

        let unknown = CompositionConfig::new("a", pipeline("sma", None)).with_dependent_after(
            "b",
            pipeline("sma", None),
            ["ghost"],
        );
        assert!(matches!(
            compose_streams(&unknown),
            Err(PipelineError::Validation(ValidationError::UnknownStream { .. }))
        ));

        let cyclic = CompositionConfig::new("a", pipeline("sma", None))
            .with_dependent_after("b", pipeline("sma", None), ["c"])
            .with_dependent_after("c", pipeline("sma", None), ["b"]);
        assert!(matches!(
            compose_streams(&cyclic),
            Err(PipelineError::Validation(ValidationError::Cycle(_)))
        ));
    }

    #[test]
    fn continue_on_error_skips_dependents_of_failed_streams() {
        let config = CompositionConfig::new("prices", pipeline("sma", None))
            .with_dependent("volume", pipeline("sma", Some("volume")))
            .with_dependent_after("derived", pipeline("ema", None), ["volume"])
            .with_error_policy(ErrorPolicy::ContinueOnError);
        let state = compose_streams(&config).unwrap();
        let point = DataPoint::new(Utc.timestamp_opt(0, 0).unwrap()).with_field("close", dec!(1));

        let update = compose_execute(&state, &point).unwrap();
        assert_eq!(update.errors.len(), 1);
        assert_eq!(update.errors[0].stream, "volume");
        assert_eq!(update.skipped, vec!["derived".to_string()]);
        assert!(update.results.contains_key("prices"));
        assert_eq!(
            update.state.stream("volume"),
            state.stream("volume"),
            "failed stream keeps its previous state"
        );

        let metrics = stream_metrics(&update.state);
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.streams.len(), 3);
    }

    #[test]
    fn fail_fast_names_the_stream() {
        let config = CompositionConfig::new("prices", pipeline("sma", None))
            .with_dependent("volume", pipeline("sma", Some("volume")));
        let state = compose_streams(&config).unwrap();
        let point = DataPoint::new(Utc.timestamp_opt(0, 0).unwrap()).with_field("close", dec!(1));
        let err = compose_execute(&state, &point).unwrap_err();
        assert!(matches!(err, PipelineError::Stream { ref stream, .. } if stream == "volume"));
    }
}
