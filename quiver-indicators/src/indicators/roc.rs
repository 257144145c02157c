//! Rate of Change (ROC), a batch-only momentum oscillator.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::capability::{parse_params, read_field, source_field, BatchIndicator, Params};
use crate::core::{IndicatorError, IndicatorResult};
use quiver_core::{DataPoint, Series};

/// Parameters accepted by the `roc` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RocParams {
    /// Distance, in points, between the compared values.
    pub period: usize,
}

impl Default for RocParams {
    fn default() -> Self {
        Self { period: 10 }
    }
}

/// Percentage change between each value and the one `period` points earlier.
///
/// Points whose reference value is zero produce no output.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateOfChange;

impl RateOfChange {
    const NAME: &'static str = "roc";

    fn parse(params: &Params) -> IndicatorResult<RocParams> {
        let parsed: RocParams = parse_params(Self::NAME, params)?;
        if parsed.period == 0 {
            return Err(IndicatorError::invalid_period("ROC", parsed.period));
        }
        Ok(parsed)
    }
}

impl BatchIndicator for RateOfChange {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn validate(&self, params: &Params) -> IndicatorResult<()> {
        source_field(Self::NAME, params)?;
        Self::parse(params).map(|_| ())
    }

    fn min_length(&self, params: &Params) -> usize {
        Self::parse(params).map_or(1, |parsed| parsed.period + 1)
    }

    fn compute(&self, series: &[DataPoint], params: &Params) -> IndicatorResult<Series> {
        let period = Self::parse(params)?.period;
        let source = source_field(Self::NAME, params)?;
        let values = series
            .iter()
            .map(|point| read_field(point, source))
            .collect::<IndicatorResult<Vec<Decimal>>>()?;

        Ok(series
            .iter()
            .zip(values.iter())
            .skip(period)
            .zip(values.iter())
            .filter(|(_, previous)| !previous.is_zero())
            .map(|((point, current), previous)| {
                let change = (current - previous) / previous * Decimal::ONE_HUNDRED;
                DataPoint::value(point.timestamp, change)
            })
            .collect())
    }
}
