//! The contract between indicators and the pipeline engine.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use quiver_core::{DataPoint, Series, Timestamp, DEFAULT_SOURCE_FIELD, VALUE_FIELD};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};

use crate::core::{Indicator, IndicatorError, IndicatorResult};
use crate::state::IndicatorState;

/// Stage parameters as declared in a pipeline definition.
pub type Params = toml::Table;

/// Parameter key selecting the input field an indicator reads.
pub const SOURCE_PARAM: &str = "source";

/// Batch side of the capability contract, implemented by every indicator.
pub trait BatchIndicator: Send + Sync {
    /// Registry name of the indicator.
    fn name(&self) -> &str;

    /// Checks that `params` can configure this indicator.
    fn validate(&self, params: &Params) -> IndicatorResult<()>;

    /// Number of input points needed before the first output is produced.
    fn min_length(&self, params: &Params) -> usize;

    /// Computes the indicator over a complete series.
    fn compute(&self, series: &[DataPoint], params: &Params) -> IndicatorResult<Series>;
}

/// Result of a single incremental update.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    /// State to use for the next update.
    pub state: IndicatorState,
    /// Output for this point, absent while warming up.
    pub output: Option<DataPoint>,
}

/// Indicators that can additionally be advanced one point at a time.
pub trait StreamingIndicator: BatchIndicator {
    /// Builds the initial incremental state.
    fn init(&self, params: &Params) -> IndicatorResult<IndicatorState>;

    /// Feeds one point into `state`, returning the successor state.
    fn update(
        &self,
        state: &IndicatorState,
        point: &DataPoint,
        params: &Params,
    ) -> IndicatorResult<StateTransition>;

    /// Checks that `state` can be resumed without advancing it. The default
    /// accepts any payload tagged with this indicator's name.
    fn check_state(&self, state: &IndicatorState) -> IndicatorResult<()> {
        if state.indicator() == self.name() {
            Ok(())
        } else {
            Err(IndicatorError::InvalidState(format!(
                "expected {} state but found {}",
                self.name(),
                state.indicator()
            )))
        }
    }
}

/// Explicit capability tag attached to every pipeline stage.
#[derive(Clone)]
pub enum IndicatorCapability {
    /// Batch computation only; never participates in streaming.
    Stateless(Arc<dyn BatchIndicator>),
    /// Batch computation plus incremental updates.
    Streaming(Arc<dyn StreamingIndicator>),
}

impl IndicatorCapability {
    /// Wraps a batch-only indicator.
    pub fn stateless(indicator: impl BatchIndicator + 'static) -> Self {
        Self::Stateless(Arc::new(indicator))
    }

    /// Wraps a streaming indicator.
    pub fn streaming(indicator: impl StreamingIndicator + 'static) -> Self {
        Self::Streaming(Arc::new(indicator))
    }

    /// Registry name of the wrapped indicator.
    pub fn name(&self) -> &str {
        match self {
            Self::Stateless(inner) => inner.name(),
            Self::Streaming(inner) => inner.name(),
        }
    }

    /// Delegates to [`BatchIndicator::validate`].
    pub fn validate(&self, params: &Params) -> IndicatorResult<()> {
        match self {
            Self::Stateless(inner) => inner.validate(params),
            Self::Streaming(inner) => inner.validate(params),
        }
    }

    /// Delegates to [`BatchIndicator::min_length`].
    pub fn min_length(&self, params: &Params) -> usize {
        match self {
            Self::Stateless(inner) => inner.min_length(params),
            Self::Streaming(inner) => inner.min_length(params),
        }
    }

    /// Delegates to [`BatchIndicator::compute`].
    pub fn compute(&self, series: &[DataPoint], params: &Params) -> IndicatorResult<Series> {
        match self {
            Self::Stateless(inner) => inner.compute(series, params),
            Self::Streaming(inner) => inner.compute(series, params),
        }
    }

    /// Returns the streaming side, if the indicator has one.
    pub fn as_streaming(&self) -> Option<&Arc<dyn StreamingIndicator>> {
        match self {
            Self::Stateless(_) => None,
            Self::Streaming(inner) => Some(inner),
        }
    }

    /// Whether the indicator can be advanced incrementally.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}

impl fmt::Debug for IndicatorCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_streaming() {
            "Streaming"
        } else {
            "Stateless"
        };
        f.debug_tuple(kind).field(&self.name()).finish()
    }
}

/// Converts indicator outputs into named point fields.
pub trait IntoFields {
    /// Field name/value pairs for one output.
    fn into_fields(self) -> Vec<(&'static str, Decimal)>;
}

impl IntoFields for Decimal {
    fn into_fields(self) -> Vec<(&'static str, Decimal)> {
        vec![(VALUE_FIELD, self)]
    }
}

/// Indicators that can be built from a parameter table.
pub trait Configurable: Indicator<Input = Decimal> + Sized {
    /// Typed parameters parsed from the stage's table.
    type Params: DeserializeOwned;

    /// Registry name.
    const NAME: &'static str;

    /// Builds a fresh indicator.
    fn from_params(params: &Self::Params) -> IndicatorResult<Self>;

    /// Number of inputs consumed before the first output.
    fn min_length(params: &Self::Params) -> usize;
}

/// Adapts any [`Configurable`] indicator with serializable internals into both
/// halves of the capability contract.
///
/// Batch computation replays the series through a fresh instance, so a batch
/// run always equals the same points streamed one by one.
pub struct Incremental<T> {
    marker: PhantomData<fn() -> T>,
}

impl<T> Incremental<T> {
    /// Creates the adapter.
    pub fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T> Default for Incremental<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Configurable> Incremental<T> {
    fn engine(params: &Params) -> IndicatorResult<T> {
        let parsed = parse_params::<T::Params>(T::NAME, params)?;
        T::from_params(&parsed)
    }
}

impl<T> BatchIndicator for Incremental<T>
where
    T: Configurable + Serialize + DeserializeOwned + 'static,
    T::Output: IntoFields,
{
    fn name(&self) -> &str {
        T::NAME
    }

    fn validate(&self, params: &Params) -> IndicatorResult<()> {
        source_field(T::NAME, params)?;
        Self::engine(params).map(|_| ())
    }

    fn min_length(&self, params: &Params) -> usize {
        parse_params::<T::Params>(T::NAME, params)
            .map(|parsed| T::min_length(&parsed))
            .unwrap_or(1)
    }

    fn compute(&self, series: &[DataPoint], params: &Params) -> IndicatorResult<Series> {
        let source = source_field(T::NAME, params)?;
        let mut engine = Self::engine(params)?;
        let mut outputs = Vec::new();
        for point in series {
            let value = read_field(point, source)?;
            if let Some(output) = engine.next(value) {
                outputs.push(emit(point.timestamp, output));
            }
        }
        Ok(outputs)
    }
}

impl<T> StreamingIndicator for Incremental<T>
where
    T: Configurable + Serialize + DeserializeOwned + 'static,
    T::Output: IntoFields,
{
    fn init(&self, params: &Params) -> IndicatorResult<IndicatorState> {
        let engine = Self::engine(params)?;
        IndicatorState::encode(T::NAME, &engine)
    }

    fn update(
        &self,
        state: &IndicatorState,
        point: &DataPoint,
        params: &Params,
    ) -> IndicatorResult<StateTransition> {
        let source = source_field(T::NAME, params)?;
        let mut engine: T = state.decode(T::NAME)?;
        let value = read_field(point, source)?;
        let output = engine
            .next(value)
            .map(|output| emit(point.timestamp, output));
        Ok(StateTransition {
            state: IndicatorState::encode(T::NAME, &engine)?,
            output,
        })
    }

    fn check_state(&self, state: &IndicatorState) -> IndicatorResult<()> {
        state.decode::<T>(T::NAME).map(|_| ())
    }
}

/// Parses the parameter table into a typed struct.
pub fn parse_params<P: DeserializeOwned>(indicator: &str, params: &Params) -> IndicatorResult<P> {
    toml::Value::Table(params.clone())
        .try_into()
        .map_err(|err: toml::de::Error| IndicatorError::InvalidParams {
            indicator: indicator.to_string(),
            reason: err.to_string().trim().to_string(),
        })
}

/// Resolves the input field configured through the `source` parameter.
pub fn source_field<'a>(indicator: &str, params: &'a Params) -> IndicatorResult<&'a str> {
    match params.get(SOURCE_PARAM) {
        None => Ok(DEFAULT_SOURCE_FIELD),
        Some(toml::Value::String(field)) if !field.is_empty() => Ok(field.as_str()),
        Some(other) => Err(IndicatorError::InvalidParams {
            indicator: indicator.to_string(),
            reason: format!("`{SOURCE_PARAM}` must be a non-empty string, got {other}"),
        }),
    }
}

/// Reads a field, reporting the point's timestamp when it is missing.
pub fn read_field(point: &DataPoint, field: &str) -> IndicatorResult<Decimal> {
    point.get(field).ok_or_else(|| IndicatorError::MissingField {
        field: field.to_string(),
        timestamp: point.timestamp,
    })
}

fn emit(timestamp: Timestamp, output: impl IntoFields) -> DataPoint {
    output
        .into_fields()
        .into_iter()
        .fold(DataPoint::new(timestamp), |point, (name, value)| {
            point.with_field(name, value)
        })
}
