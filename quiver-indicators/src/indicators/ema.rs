//! Exponential Moving Average (EMA).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::capability::Configurable;
use crate::core::{decimal_from_usize, Indicator, IndicatorError, IndicatorResult};

/// Parameters accepted by the `ema` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmaParams {
    /// Smoothing period; alpha is `2 / (period + 1)`.
    pub period: usize,
}

impl Default for EmaParams {
    fn default() -> Self {
        Self { period: 20 }
    }
}

/// Exponentially-weighted moving average seeded with the SMA of the first window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ema {
    period: usize,
    alpha: Decimal,
    divisor: Decimal,
    state: Option<Decimal>,
    warmup_sum: Decimal,
    warmup_count: usize,
}

impl Ema {
    /// Creates a new EMA with the provided period.
    pub fn new(period: usize) -> IndicatorResult<Self> {
        if period == 0 {
            return Err(IndicatorError::invalid_period("EMA", period));
        }

        let alpha = Decimal::from(2) / decimal_from_usize(period + 1);

        Ok(Self {
            period,
            alpha,
            divisor: decimal_from_usize(period),
            state: None,
            warmup_sum: Decimal::ZERO,
            warmup_count: 0,
        })
    }

    /// Returns the current EMA value, if the indicator has produced one.
    pub fn value(&self) -> Option<Decimal> {
        self.state
    }
}

impl Indicator for Ema {
    type Input = Decimal;
    type Output = Decimal;

    fn next(&mut self, value: Decimal) -> Option<Decimal> {
        let next = match self.state {
            Some(current) => (value - current) * self.alpha + current,
            None => {
                self.warmup_sum += value;
                self.warmup_count += 1;
                if self.warmup_count < self.period {
                    return None;
                }
                let average = self.warmup_sum / self.divisor;
                self.warmup_sum = Decimal::ZERO;
                self.warmup_count = 0;
                average
            }
        };
        self.state = Some(next);
        Some(next)
    }

    fn reset(&mut self) {
        self.state = None;
        self.warmup_sum = Decimal::ZERO;
        self.warmup_count = 0;
    }
}

impl Configurable for Ema {
    type Params = EmaParams;
    const NAME: &'static str = "ema";

    fn from_params(params: &EmaParams) -> IndicatorResult<Self> {
        Self::new(params.period)
    }

    fn min_length(params: &EmaParams) -> usize {
        params.period
    }
}
