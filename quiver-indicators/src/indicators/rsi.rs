//! Relative Strength Index (RSI).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::capability::Configurable;
use crate::core::{decimal_from_usize, Indicator, IndicatorError, IndicatorResult};

/// Parameters accepted by the `rsi` stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RsiParams {
    /// Number of price changes averaged.
    pub period: usize,
}

impl Default for RsiParams {
    fn default() -> Self {
        Self { period: 14 }
    }
}

/// Wilder's RSI oscillator scaled between 0 and 100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rsi {
    period: usize,
    divisor: Decimal,
    decay: Decimal,
    prev_value: Option<Decimal>,
    averages: Option<(Decimal, Decimal)>,
    warmup_count: usize,
    gain_sum: Decimal,
    loss_sum: Decimal,
}

impl Rsi {
    /// Creates a new RSI with the provided period.
    pub fn new(period: usize) -> IndicatorResult<Self> {
        if period == 0 {
            return Err(IndicatorError::invalid_period("RSI", period));
        }

        Ok(Self {
            period,
            divisor: decimal_from_usize(period),
            decay: decimal_from_usize(period.saturating_sub(1)),
            prev_value: None,
            averages: None,
            warmup_count: 0,
            gain_sum: Decimal::ZERO,
            loss_sum: Decimal::ZERO,
        })
    }

    fn compute_rsi(avg_gain: Decimal, avg_loss: Decimal) -> Decimal {
        if avg_loss.is_zero() {
            Decimal::ONE_HUNDRED
        } else if avg_gain.is_zero() {
            Decimal::ZERO
        } else {
            let rs = avg_gain / avg_loss;
            Decimal::ONE_HUNDRED - (Decimal::ONE_HUNDRED / (rs + Decimal::ONE))
        }
    }

    fn smooth(&self, average: Decimal, sample: Decimal) -> Decimal {
        if self.period == 1 {
            sample
        } else {
            (average * self.decay + sample) / self.divisor
        }
    }
}

impl Indicator for Rsi {
    type Input = Decimal;
    type Output = Decimal;

    fn next(&mut self, value: Decimal) -> Option<Decimal> {
        let prev = self.prev_value.replace(value)?;
        let change = value - prev;
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);

        let (avg_gain, avg_loss) = match self.averages {
            Some((avg_gain, avg_loss)) => {
                (self.smooth(avg_gain, gain), self.smooth(avg_loss, loss))
            }
            None => {
                self.warmup_count += 1;
                self.gain_sum += gain;
                self.loss_sum += loss;
                if self.warmup_count < self.period {
                    return None;
                }
                (self.gain_sum / self.divisor, self.loss_sum / self.divisor)
            }
        };

        self.averages = Some((avg_gain, avg_loss));
        Some(Self::compute_rsi(avg_gain, avg_loss))
    }

    fn reset(&mut self) {
        self.prev_value = None;
        self.averages = None;
        self.warmup_count = 0;
        self.gain_sum = Decimal::ZERO;
        self.loss_sum = Decimal::ZERO;
    }
}

impl Configurable for Rsi {
    type Params = RsiParams;
    const NAME: &'static str = "rsi";

    fn from_params(params: &RsiParams) -> IndicatorResult<Self> {
        Self::new(params.period)
    }

    fn min_length(params: &RsiParams) -> usize {
        params.period + 1
    }
}
