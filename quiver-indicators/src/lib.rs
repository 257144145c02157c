#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

//! Decimal-based technical indicators exposed through an explicit capability contract.

/// The batch/streaming contract consumed by pipelines.
pub mod capability;
/// Foundational traits and shared abstractions.
pub mod core;
/// Built-in indicator implementations.
pub mod indicators;
/// Name-based lookup of indicator capabilities.
pub mod registry;
/// Opaque incremental state.
pub mod state;

pub use crate::capability::{
    BatchIndicator, Configurable, Incremental, IndicatorCapability, IntoFields, Params,
    StateTransition, StreamingIndicator,
};
pub use crate::core::{Indicator, IndicatorError, IndicatorResult};
pub use crate::registry::{
    builtin_indicator_names, indicator_registry, register_indicator, resolve_indicator,
    IndicatorRegistry,
};
pub use crate::state::IndicatorState;
