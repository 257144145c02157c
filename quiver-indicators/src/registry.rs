use std::collections::HashMap;
use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::capability::{Incremental, IndicatorCapability};
use crate::core::{IndicatorError, IndicatorResult};
use crate::indicators::{BollingerBands, Ema, RateOfChange, Rsi, Sma};

static INDICATOR_REGISTRY: Lazy<IndicatorRegistry> = Lazy::new(IndicatorRegistry::with_builtins);

/// Returns a handle to the global registry, pre-populated with the built-ins.
pub fn indicator_registry() -> &'static IndicatorRegistry {
    &INDICATOR_REGISTRY
}

/// Registers an indicator with the global registry.
pub fn register_indicator(capability: IndicatorCapability, aliases: &[&str]) {
    indicator_registry().register(capability, aliases);
}

/// Looks up an indicator by name or alias in the global registry.
pub fn resolve_indicator(name: &str) -> IndicatorResult<IndicatorCapability> {
    indicator_registry().resolve(name)
}

/// Returns the registered canonical indicator names in sorted order.
pub fn builtin_indicator_names() -> Vec<String> {
    indicator_registry().names()
}

#[derive(Default)]
struct RegistryInner {
    by_canonical: HashMap<String, IndicatorCapability>,
    by_alias: HashMap<String, IndicatorCapability>,
}

/// Thread-safe mapping from indicator names to capabilities.
pub struct IndicatorRegistry {
    inner: RwLock<RegistryInner>,
}

impl IndicatorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Creates a registry holding every built-in indicator.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(
            IndicatorCapability::streaming(Incremental::<Sma>::new()),
            &["simple_moving_average"],
        );
        registry.register(
            IndicatorCapability::streaming(Incremental::<Ema>::new()),
            &["exponential_moving_average"],
        );
        registry.register(
            IndicatorCapability::streaming(Incremental::<Rsi>::new()),
            &["relative_strength_index"],
        );
        registry.register(
            IndicatorCapability::streaming(Incremental::<BollingerBands>::new()),
            &["bollinger_bands", "bb"],
        );
        registry.register(
            IndicatorCapability::stateless(RateOfChange),
            &["rate_of_change"],
        );
        registry
    }

    /// Adds an indicator under its canonical name plus `aliases`.
    pub fn register(&self, capability: IndicatorCapability, aliases: &[&str]) {
        let mut inner = self.inner.write().expect("registry poisoned");
        let canonical = normalize_name(capability.name());
        if inner
            .by_canonical
            .insert(canonical.clone(), capability.clone())
            .is_some()
        {
            tracing::warn!(
                indicator = %canonical,
                "duplicate indicator registration detected; overriding previous entry"
            );
        }
        inner.by_alias.insert(canonical.clone(), capability.clone());
        for alias in aliases {
            let normalized = normalize_name(alias);
            if let Some(existing) = inner.by_alias.get(&normalized) {
                if existing.name() != capability.name() {
                    tracing::warn!(
                        alias = *alias,
                        indicator = %canonical,
                        "alias already registered for another indicator; overriding"
                    );
                }
            }
            inner.by_alias.insert(normalized, capability.clone());
        }
    }

    /// Resolves `name` (case-insensitive, aliases allowed).
    pub fn resolve(&self, name: &str) -> IndicatorResult<IndicatorCapability> {
        self.get(name)
            .ok_or_else(|| IndicatorError::UnknownIndicator(name.to_string()))
    }

    /// Resolves `name`, returning `None` when unknown.
    pub fn get(&self, name: &str) -> Option<IndicatorCapability> {
        let inner = self.inner.read().expect("registry poisoned");
        inner.by_alias.get(&normalize_name(name)).cloned()
    }

    /// Canonical names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().expect("registry poisoned");
        let mut names: Vec<String> = inner.by_canonical.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl Default for IndicatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
