//! Core data types shared by every Quiver crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Timestamp type used across the workspace.
pub type Timestamp = DateTime<Utc>;

/// Ordered sequence of data points.
pub type Series = Vec<DataPoint>;

/// Field read by indicators when no explicit source is configured.
pub const DEFAULT_SOURCE_FIELD: &str = "close";

/// Field name used for single-valued indicator outputs.
pub const VALUE_FIELD: &str = "value";

/// A timestamped record carrying an arbitrary set of named decimal fields.
///
/// The pipeline never interprets the fields itself; indicators pick the ones
/// they need and everything else passes through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    #[serde(default)]
    pub fields: BTreeMap<String, Decimal>,
}

impl DataPoint {
    /// Creates a point without any fields.
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Creates a point carrying a single `value` field.
    pub fn value(timestamp: Timestamp, value: Decimal) -> Self {
        Self::new(timestamp).with_field(VALUE_FIELD, value)
    }

    /// Creates an OHLCV candle point.
    pub fn candle(
        timestamp: Timestamp,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self::new(timestamp)
            .with_field("open", open)
            .with_field("high", high)
            .with_field("low", low)
            .with_field("close", close)
            .with_field("volume", volume)
    }

    /// Builder-style field insertion.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Decimal) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Inserts or replaces a field.
    pub fn insert(&mut self, name: impl Into<String>, value: Decimal) {
        self.fields.insert(name.into(), value);
    }

    /// Returns the value of a field, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Decimal> {
        self.fields.get(name).copied()
    }
}

/// Returns `true` when timestamps never decrease along the series.
pub fn is_chronological(series: &[DataPoint]) -> bool {
    series
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp)
}

/// First and last timestamps of a series, if it is not empty.
pub fn time_span(series: &[DataPoint]) -> Option<(Timestamp, Timestamp)> {
    let first = series.first()?;
    let last = series.last()?;
    Some((first.timestamp, last.timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn candle_exposes_named_fields() {
        let point = DataPoint::candle(ts(0), dec!(1), dec!(3), dec!(0.5), dec!(2), dec!(10));
        assert_eq!(point.get("close"), Some(dec!(2)));
        assert_eq!(point.get("volume"), Some(dec!(10)));
        assert_eq!(point.get("vwap"), None);
    }

    #[test]
    fn chronological_allows_equal_timestamps() {
        let series = vec![
            DataPoint::value(ts(1), dec!(1)),
            DataPoint::value(ts(1), dec!(2)),
            DataPoint::value(ts(2), dec!(3)),
        ];
        assert!(is_chronological(&series));
        assert_eq!(time_span(&series), Some((ts(1), ts(2))));
    }

    #[test]
    fn detects_out_of_order_series() {
        let series = vec![DataPoint::value(ts(2), dec!(1)), DataPoint::value(ts(1), dec!(2))];
        assert!(!is_chronological(&series));
        assert_eq!(time_span(&[]), None);
    }
}
