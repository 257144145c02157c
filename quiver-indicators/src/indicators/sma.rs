//! Simple Moving Average (SMA).

use std::collections::VecDeque;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::capability::Configurable;
use crate::core::{decimal_from_usize, Indicator, IndicatorError, IndicatorResult};

/// Parameters accepted by the `sma` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmaParams {
    /// Window length.
    pub period: usize,
}

impl Default for SmaParams {
    fn default() -> Self {
        Self { period: 20 }
    }
}

/// Computes the arithmetic mean over a rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sma {
    period: usize,
    divisor: Decimal,
    sum: Decimal,
    window: VecDeque<Decimal>,
}

impl Sma {
    /// Creates a new SMA with the provided period.
    pub fn new(period: usize) -> IndicatorResult<Self> {
        if period == 0 {
            return Err(IndicatorError::invalid_period("SMA", period));
        }

        Ok(Self {
            period,
            divisor: decimal_from_usize(period),
            sum: Decimal::ZERO,
            window: VecDeque::with_capacity(period),
        })
    }

    /// Returns the configured lookback period.
    pub fn period(&self) -> usize {
        self.period
    }
}

impl Indicator for Sma {
    type Input = Decimal;
    type Output = Decimal;

    fn next(&mut self, value: Decimal) -> Option<Decimal> {
        self.window.push_back(value);
        self.sum += value;

        if self.window.len() > self.period {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest;
            }
        }

        (self.window.len() == self.period).then(|| self.sum / self.divisor)
    }

    fn reset(&mut self) {
        self.sum = Decimal::ZERO;
        self.window.clear();
    }
}

impl Configurable for Sma {
    type Params = SmaParams;
    const NAME: &'static str = "sma";

    fn from_params(params: &SmaParams) -> IndicatorResult<Self> {
        Self::new(params.period)
    }

    fn min_length(params: &SmaParams) -> usize {
        params.period
    }
}
