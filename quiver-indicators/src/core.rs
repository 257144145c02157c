//! Foundational traits and the shared error type.

use std::fmt::Display;

use quiver_core::Timestamp;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result alias used by indicator implementations.
pub type IndicatorResult<T> = Result<T, IndicatorError>;

/// Errors raised while configuring or running an indicator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndicatorError {
    /// The lookback period must be strictly positive.
    #[error("{indicator} requires a period greater than zero (got {period})")]
    InvalidPeriod {
        /// Indicator reporting the problem.
        indicator: &'static str,
        /// Offending period.
        period: usize,
    },
    /// A named parameter holds a value the indicator cannot use.
    #[error("{indicator} received an invalid value for `{parameter}`: {value}")]
    InvalidParameter {
        /// Indicator reporting the problem.
        indicator: &'static str,
        /// Parameter name.
        parameter: &'static str,
        /// Rendered offending value.
        value: String,
    },
    /// The parameter table could not be parsed at all.
    #[error("failed to parse {indicator} parameters: {reason}")]
    InvalidParams {
        /// Indicator reporting the problem.
        indicator: String,
        /// Parser message.
        reason: String,
    },
    /// The input point lacks the field the indicator reads.
    #[error("input point at {timestamp} is missing field `{field}`")]
    MissingField {
        /// Field that was looked up.
        field: String,
        /// Timestamp of the offending point.
        timestamp: Timestamp,
    },
    /// Incremental state could not be encoded or decoded.
    #[error("incremental state is invalid: {0}")]
    InvalidState(String),
    /// No indicator is registered under the requested name.
    #[error("unknown indicator: {0}")]
    UnknownIndicator(String),
    /// Any other failure while computing values.
    #[error("{0}")]
    Computation(String),
}

impl IndicatorError {
    pub(crate) fn invalid_period(indicator: &'static str, period: usize) -> Self {
        Self::InvalidPeriod { indicator, period }
    }

    pub(crate) fn invalid_parameter(
        indicator: &'static str,
        parameter: &'static str,
        value: impl Display,
    ) -> Self {
        Self::InvalidParameter {
            indicator,
            parameter,
            value: value.to_string(),
        }
    }
}

/// Incremental indicator fed one input at a time.
pub trait Indicator {
    /// Value consumed per step.
    type Input;
    /// Value produced once the indicator has enough history.
    type Output;

    /// Advances the indicator, returning `None` while it is still warming up.
    fn next(&mut self, input: Self::Input) -> Option<Self::Output>;

    /// Drops all accumulated history.
    fn reset(&mut self);
}

pub(crate) fn decimal_from_usize(value: usize) -> Decimal {
    Decimal::from(value as u64)
}
