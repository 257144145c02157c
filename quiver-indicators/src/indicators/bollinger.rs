//! Bollinger Bands built on a rolling mean and standard deviation.

use std::collections::VecDeque;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

use crate::capability::{Configurable, IntoFields};
use crate::core::{decimal_from_usize, Indicator, IndicatorError, IndicatorResult};

/// Parameters accepted by the `bollinger` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BollingerParams {
    /// Window length.
    pub period: usize,
    /// Number of standard deviations between the middle and outer bands.
    pub std_multiplier: f64,
}

impl Default for BollingerParams {
    fn default() -> Self {
        Self {
            period: 20,
            std_multiplier: 2.0,
        }
    }
}

/// Output value of the Bollinger Bands indicator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBandsOutput {
    /// Upper band (mean + k * std dev).
    pub upper: Decimal,
    /// Middle band (rolling mean).
    pub middle: Decimal,
    /// Lower band (mean - k * std dev).
    pub lower: Decimal,
}

impl IntoFields for BollingerBandsOutput {
    fn into_fields(self) -> Vec<(&'static str, Decimal)> {
        vec![
            ("upper", self.upper),
            ("middle", self.middle),
            ("lower", self.lower),
        ]
    }
}

/// Produces Bollinger Bands from a rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BollingerBands {
    period: usize,
    divisor: Decimal,
    std_multiplier: Decimal,
    sum: Decimal,
    sum_of_squares: Decimal,
    window: VecDeque<Decimal>,
}

impl BollingerBands {
    /// Creates a new Bollinger Bands indicator.
    pub fn new(period: usize, std_multiplier: Decimal) -> IndicatorResult<Self> {
        if period == 0 {
            return Err(IndicatorError::invalid_period("BollingerBands", period));
        }
        if std_multiplier.is_sign_negative() {
            return Err(IndicatorError::invalid_parameter(
                "BollingerBands",
                "std_multiplier",
                std_multiplier,
            ));
        }

        Ok(Self {
            period,
            divisor: decimal_from_usize(period),
            std_multiplier,
            sum: Decimal::ZERO,
            sum_of_squares: Decimal::ZERO,
            window: VecDeque::with_capacity(period),
        })
    }

    fn compute_bands(&self) -> BollingerBandsOutput {
        let mean = self.sum / self.divisor;
        let mean_of_squares = self.sum_of_squares / self.divisor;
        let variance = (mean_of_squares - mean * mean).max(Decimal::ZERO);
        let std_dev = variance.sqrt().unwrap_or(Decimal::ZERO);
        let offset = self.std_multiplier * std_dev;

        BollingerBandsOutput {
            upper: mean + offset,
            middle: mean,
            lower: mean - offset,
        }
    }
}

impl Indicator for BollingerBands {
    type Input = Decimal;
    type Output = BollingerBandsOutput;

    fn next(&mut self, value: Decimal) -> Option<BollingerBandsOutput> {
        self.window.push_back(value);
        self.sum += value;
        self.sum_of_squares += value * value;

        if self.window.len() > self.period {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest;
                self.sum_of_squares -= oldest * oldest;
            }
        }

        (self.window.len() == self.period).then(|| self.compute_bands())
    }

    fn reset(&mut self) {
        self.sum = Decimal::ZERO;
        self.sum_of_squares = Decimal::ZERO;
        self.window.clear();
    }
}

impl Configurable for BollingerBands {
    type Params = BollingerParams;
    const NAME: &'static str = "bollinger";

    fn from_params(params: &BollingerParams) -> IndicatorResult<Self> {
        let multiplier = Decimal::from_f64(params.std_multiplier).ok_or_else(|| {
            IndicatorError::invalid_parameter(
                "BollingerBands",
                "std_multiplier",
                params.std_multiplier,
            )
        })?;
        Self::new(params.period, multiplier)
    }

    fn min_length(params: &BollingerParams) -> usize {
        params.period
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::{BollingerBands, BollingerParams};
    use crate::capability::Configurable;
    use crate::Indicator;

    fn assert_close(lhs: Decimal, rhs: Decimal) {
        let tolerance = dec!(0.00000001);
        assert!((lhs - rhs).abs() <= tolerance, "{lhs} != {rhs}");
    }

    #[test]
    fn computes_expected_bands() {
        let mut bb = BollingerBands::new(5, dec!(2)).unwrap();
        let mut output = None;
        for value in [10, 11, 12, 13, 14] {
            output = bb.next(Decimal::from(value));
        }

        let bands = output.unwrap();
        assert_close(bands.middle, dec!(12));
        assert_close(bands.upper, dec!(14.82842712));
        assert_close(bands.lower, dec!(9.17157288));
    }

    #[test]
    fn respects_reset() {
        let mut bb = BollingerBands::new(2, dec!(1)).unwrap();
        bb.next(dec!(1));
        let first = bb.next(dec!(3)).unwrap();
        assert_close(first.middle, dec!(2));
        bb.reset();
        assert_eq!(bb.next(dec!(3)), None);
    }

    #[test]
    fn rejects_negative_multiplier() {
        let params = BollingerParams {
            period: 5,
            std_multiplier: -1.0,
        };
        let err = BollingerBands::from_params(&params).unwrap_err();
        assert!(matches!(err, crate::IndicatorError::InvalidParameter { .. }));
    }
}
