//! Opaque incremental state carried between streaming updates.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::core::{IndicatorError, IndicatorResult};

/// Serialized internals of a streaming indicator, tagged with the indicator
/// that produced them.
///
/// The engine never looks inside `payload`; it only checks that the tag
/// matches the stage it dispatches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorState {
    indicator: String,
    payload: Vec<u8>,
}

impl IndicatorState {
    /// Wraps raw bytes produced by an indicator.
    pub fn from_parts(indicator: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            indicator: indicator.into(),
            payload,
        }
    }

    /// Serializes `state` and tags it with `indicator`.
    pub fn encode<S: Serialize>(indicator: &str, state: &S) -> IndicatorResult<Self> {
        let payload = serde_json::to_vec(state).map_err(|err| {
            IndicatorError::InvalidState(format!("failed to encode {indicator} state: {err}"))
        })?;
        Ok(Self::from_parts(indicator, payload))
    }

    /// Decodes the payload, refusing state produced by another indicator.
    pub fn decode<S: DeserializeOwned>(&self, expected: &str) -> IndicatorResult<S> {
        if self.indicator != expected {
            return Err(IndicatorError::InvalidState(format!(
                "expected {expected} state but found {}",
                self.indicator
            )));
        }
        serde_json::from_slice(&self.payload).map_err(|err| {
            IndicatorError::InvalidState(format!("failed to decode {expected} state: {err}"))
        })
    }

    /// Name of the indicator that owns this state.
    pub fn indicator(&self) -> &str {
        &self.indicator
    }

    /// Raw serialized payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        seen: u32,
    }

    #[test]
    fn decode_checks_indicator_tag() {
        let state = IndicatorState::encode("counter", &Counter { seen: 3 }).unwrap();
        assert_eq!(state.decode::<Counter>("counter").unwrap(), Counter { seen: 3 });
        let err = state.decode::<Counter>("sma").unwrap_err();
        assert!(matches!(err, IndicatorError::InvalidState(_)));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let state = IndicatorState::from_parts("counter", b"not json".to_vec());
        assert!(state.decode::<Counter>("counter").is_err());
    }
}
