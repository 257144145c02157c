//! Binary snapshots of streaming and composition state.
//!
//! Layout: the `QVST` magic, a little-endian `u16` schema version, one kind
//! byte, then the `bincode` payload. Restoring checks the header first and the
//! persisted stage set against the supplied pipeline afterwards.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bincode::Options;
use chrono::{DateTime, Utc};
use quiver_indicators::IndicatorState;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::builder::PipelineConfig;
use crate::composition::{assemble, CompositionConfig, CompositionState};
use crate::error::{PipelineResult, StateError};
use crate::metrics::PipelineMetrics;
use crate::streaming::{streaming_stages, StreamingState};

const MAGIC: &[u8; 4] = b"QVST";
const HEADER_LEN: usize = MAGIC.len() + 3;
const MAX_BLOB_BYTES: u64 = 64 * 1024 * 1024;

/// Schema version written into every blob.
pub const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlobKind {
    Streaming = 1,
    Composition = 2,
}

impl BlobKind {
    fn label(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Composition => "composition",
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Streaming),
            2 => Some(Self::Composition),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StreamingSnapshot {
    config_id: Uuid,
    stages: BTreeMap<String, IndicatorState>,
    metrics: PipelineMetrics,
    last_update: Option<DateTime<Utc>>,
}

impl StreamingSnapshot {
    fn capture(state: &StreamingState) -> Self {
        Self {
            config_id: state.config().id(),
            stages: state.stages().clone(),
            metrics: state.metrics().clone(),
            last_update: state.last_update(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CompositionSnapshot {
    streams: Vec<(String, StreamingSnapshot)>,
}

/// Encodes a streaming state.
pub fn serialize_state(state: &StreamingState) -> PipelineResult<Vec<u8>> {
    encode(BlobKind::Streaming, &StreamingSnapshot::capture(state))
}

/// Restores a streaming state for `config`.
pub fn deserialize_state(
    config: Arc<PipelineConfig>,
    bytes: &[u8],
) -> PipelineResult<StreamingState> {
    let snapshot: StreamingSnapshot = decode(BlobKind::Streaming, bytes)?;
    Ok(restore(config, snapshot)?)
}

/// Encodes a composition state.
pub fn serialize_composition(state: &CompositionState) -> PipelineResult<Vec<u8>> {
    let snapshot = CompositionSnapshot {
        streams: state
            .streams()
            .iter()
            .map(|stream| (stream.name.clone(), StreamingSnapshot::capture(&stream.state)))
            .collect(),
    };
    encode(BlobKind::Composition, &snapshot)
}

/// Restores a composition state. The persisted streams must be exactly the
/// streams declared by `config`.
pub fn deserialize_composition(
    config: &CompositionConfig,
    bytes: &[u8],
) -> PipelineResult<CompositionState> {
    let snapshot: CompositionSnapshot = decode(BlobKind::Composition, bytes)?;
    let mut persisted: BTreeMap<String, StreamingSnapshot> = BTreeMap::new();
    for (name, stream) in snapshot.streams {
        if persisted.insert(name.clone(), stream).is_some() {
            return Err(StateError::StreamMismatch(format!("stream `{name}` persisted twice")).into());
        }
    }
    let declared: HashSet<&str> = config.streams().map(|spec| spec.name.as_str()).collect();
    if let Some(unknown) = persisted.keys().find(|name| !declared.contains(name.as_str())) {
        return Err(StateError::StreamMismatch(format!("unknown stream `{unknown}`")).into());
    }

    assemble(config, |spec| {
        let stream = persisted.remove(&spec.name).ok_or_else(|| {
            StateError::StreamMismatch(format!("stream `{}` has no persisted state", spec.name))
        })?;
        Ok(restore(Arc::clone(&spec.config), stream)?)
    })
}

fn restore(
    config: Arc<PipelineConfig>,
    snapshot: StreamingSnapshot,
) -> Result<StreamingState, StateError> {
    if snapshot.config_id != config.id() {
        debug!(
            persisted = %snapshot.config_id,
            current = %config.id(),
            "restoring state built for another pipeline instance"
        );
    }
    let expected = streaming_stages(&config);
    for (id, state) in &snapshot.stages {
        let stage = expected
            .iter()
            .find(|stage| stage.id() == id)
            .ok_or_else(|| StateError::UnknownStage(id.clone()))?;
        if stage.indicator().name() != state.indicator() {
            return Err(StateError::IndicatorMismatch {
                stage: id.clone(),
                expected: stage.indicator().name().to_string(),
                found: state.indicator().to_string(),
            });
        }
        if let Some(indicator) = stage.indicator().as_streaming() {
            indicator
                .check_state(state)
                .map_err(|err| StateError::Corrupt {
                    stage: id.clone(),
                    reason: err.to_string(),
                })?;
        }
    }
    if let Some(missing) = expected
        .iter()
        .find(|stage| !snapshot.stages.contains_key(stage.id()))
    {
        return Err(StateError::MissingStage(missing.id().to_string()));
    }
    Ok(StreamingState::from_parts(
        config,
        snapshot.stages,
        snapshot.metrics,
        snapshot.last_update,
    ))
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_BLOB_BYTES)
        .reject_trailing_bytes()
}

fn encode<T: Serialize>(kind: BlobKind, snapshot: &T) -> PipelineResult<Vec<u8>> {
    let payload = codec()
        .serialize(snapshot)
        .map_err(|err| StateError::Encoding(err.to_string()))?;
    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    blob.push(kind as u8);
    blob.extend_from_slice(&payload);
    debug!(kind = kind.label(), bytes = blob.len(), "state serialized");
    Ok(blob)
}

fn decode<T: DeserializeOwned>(expected: BlobKind, bytes: &[u8]) -> Result<T, StateError> {
    if bytes.len() < HEADER_LEN {
        if !MAGIC.starts_with(&bytes[..bytes.len().min(MAGIC.len())]) {
            return Err(StateError::BadMagic);
        }
        return Err(StateError::Malformed(format!(
            "blob is {} bytes, shorter than the {HEADER_LEN}-byte header",
            bytes.len()
        )));
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    if &header[..MAGIC.len()] != MAGIC {
        return Err(StateError::BadMagic);
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != SCHEMA_VERSION {
        return Err(StateError::UnsupportedVersion {
            found: version,
            expected: SCHEMA_VERSION,
        });
    }
    match BlobKind::from_byte(header[6]) {
        Some(kind) if kind == expected => {}
        Some(kind) => {
            return Err(StateError::WrongKind {
                expected: expected.label(),
                found: kind.label().to_string(),
            })
        }
        None => {
            return Err(StateError::WrongKind {
                expected: expected.label(),
                found: format!("unknown kind {:#04x}", header[6]),
            })
        }
    }
    codec().deserialize(payload).map_err(|err| {
        warn!(kind = expected.label(), error = %err, "rejected state blob");
        StateError::Malformed(err.to_string())
    })
}
