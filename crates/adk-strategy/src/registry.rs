//! Strategy registry — the compile-time dispatch table.
//!
//! The platform stores a strategy-id string per subscription; the registry
//! maps that id to a factory producing a fresh `Box<dyn Strategy>` plus the
//! static descriptor and parameter list. This replaces dynamic module
//! loading: every deployable strategy is registered at startup.
//!
//! Insertion order is preserved in `list()` output so enumeration is
//! deterministic. Factories must be deterministic themselves if reproducible
//! backtest replay is required.

use crate::implementations::{RsiMomentum, SmaRsiCrossover};
use crate::types::{ConfigMap, ConfigurableParam, Strategy, StrategyDescriptor};

/// A thread-safe factory closure producing a fresh strategy instance.
///
/// `Send + Sync` so the registry can be shared behind an `Arc` by the
/// supervisor and the backtest job runner.
pub type StrategyFactory = Box<dyn Fn() -> Box<dyn Strategy> + Send + Sync>;

/// Errors returned by [`StrategyRegistry`] operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName { name: String },
    UnknownStrategy { name: String },
    EmptyName,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName { name } => write!(f, "strategy '{name}' is already registered"),
            Self::UnknownStrategy { name } => write!(f, "no strategy named '{name}' is registered"),
            Self::EmptyName => write!(f, "strategy name must not be empty"),
        }
    }
}

impl std::error::Error for RegistryError {}

struct RegistryEntry {
    descriptor: StrategyDescriptor,
    params: Vec<ConfigurableParam>,
    factory: StrategyFactory,
}

/// Catalogue of deployable strategies.
pub struct StrategyRegistry {
    entries: Vec<RegistryEntry>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registry pre-populated with the platform's reference strategies.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(
            SmaRsiCrossover::default_descriptor(),
            SmaRsiCrossover::configurable_params(),
            || Box::new(SmaRsiCrossover::new()),
        )
        .expect("builtin registration cannot collide");
        reg.register(
            RsiMomentum::default_descriptor(),
            RsiMomentum::configurable_params(),
            || Box::new(RsiMomentum::new()),
        )
        .expect("builtin registration cannot collide");
        reg
    }

    /// Register a strategy by descriptor, parameter list, and factory.
    pub fn register<F>(
        &mut self,
        descriptor: StrategyDescriptor,
        params: Vec<ConfigurableParam>,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Strategy> + Send + Sync + 'static,
    {
        if descriptor.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.contains(descriptor.name) {
            return Err(RegistryError::DuplicateName {
                name: descriptor.name.to_string(),
            });
        }
        self.entries.push(RegistryEntry {
            descriptor,
            params,
            factory: Box::new(factory),
        });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.descriptor.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors in insertion order.
    pub fn list(&self) -> Vec<&StrategyDescriptor> {
        self.entries.iter().map(|e| &e.descriptor).collect()
    }

    pub fn descriptor(&self, name: &str) -> Result<&StrategyDescriptor, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| &e.descriptor)
            .ok_or_else(|| RegistryError::UnknownStrategy {
                name: name.to_string(),
            })
    }

    /// Parameter descriptors for a strategy, used by the UI and the
    /// optimizer's sampler.
    pub fn configurable_params(&self, name: &str) -> Result<&[ConfigurableParam], RegistryError> {
        self.entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(|e| e.params.as_slice())
            .ok_or_else(|| RegistryError::UnknownStrategy {
                name: name.to_string(),
            })
    }

    /// Instantiate a fresh strategy. Each call invokes the factory anew:
    /// strategies carry mutable state (price history, crossover memory) that
    /// must not leak across runs.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Strategy>, RegistryError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.descriptor.name == name)
            .ok_or_else(|| RegistryError::UnknownStrategy {
                name: name.to_string(),
            })?;
        Ok((entry.factory)())
    }

    /// Instantiate and apply a user configuration in one step.
    pub fn instantiate_configured(
        &self,
        name: &str,
        config: &ConfigMap,
    ) -> Result<Box<dyn Strategy>, RegistryError> {
        let mut strategy = self.instantiate(name)?;
        strategy.apply_config(config);
        Ok(strategy)
    }

    /// Remove a registered strategy. Returns `true` if it was present.
    pub fn deregister(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.descriptor.name != name);
        self.entries.len() < before
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adk_schemas::{Interval, MarketTick, OrderRequest, StrategyContext};
    use crate::types::StateMap;

    struct NullStrategy;

    impl Strategy for NullStrategy {
        fn descriptor(&self) -> StrategyDescriptor {
            StrategyDescriptor {
                name: "null",
                display_name: "Null",
                version: "1.0.0",
                description: "emits nothing",
                min_capital_micros: 0,
                supported_symbols: &[],
                interval: Interval::Min5,
            }
        }

        fn on_market_data(
            &mut self,
            _ctx: &StrategyContext,
            _tick: &MarketTick,
        ) -> Option<OrderRequest> {
            None
        }

        fn apply_config(&mut self, _config: &ConfigMap) {}

        fn get_state(&self) -> StateMap {
            StateMap::new()
        }

        fn set_state(&mut self, _state: &StateMap) {}
    }

    fn null_descriptor(name: &'static str) -> StrategyDescriptor {
        StrategyDescriptor {
            name,
            display_name: "Null",
            version: "1.0.0",
            description: "emits nothing",
            min_capital_micros: 0,
            supported_symbols: &[],
            interval: Interval::Min5,
        }
    }

    #[test]
    fn register_and_instantiate() {
        let mut reg = StrategyRegistry::new();
        reg.register(null_descriptor("null"), vec![], || Box::new(NullStrategy))
            .unwrap();
        assert!(reg.contains("null"));
        let s = reg.instantiate("null").unwrap();
        assert_eq!(s.descriptor().name, "null");
    }

    #[test]
    fn duplicate_name_errors() {
        let mut reg = StrategyRegistry::new();
        reg.register(null_descriptor("null"), vec![], || Box::new(NullStrategy))
            .unwrap();
        let err = reg.register(null_descriptor("null"), vec![], || Box::new(NullStrategy));
        assert_eq!(
            err,
            Err(RegistryError::DuplicateName {
                name: "null".to_string()
            })
        );
    }

    #[test]
    fn unknown_name_errors() {
        let reg = StrategyRegistry::new();
        assert!(matches!(
            reg.instantiate("ghost"),
            Err(RegistryError::UnknownStrategy { .. })
        ));
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut reg = StrategyRegistry::new();
        reg.register(null_descriptor("alpha"), vec![], || Box::new(NullStrategy))
            .unwrap();
        reg.register(null_descriptor("beta"), vec![], || Box::new(NullStrategy))
            .unwrap();
        let names: Vec<&str> = reg.list().iter().map(|d| d.name).collect();
        assert_eq!(names, ["alpha", "beta"]);
    }

    #[test]
    fn builtin_registry_carries_reference_strategies() {
        let reg = StrategyRegistry::builtin();
        assert!(reg.contains("sma_rsi_crossover"));
        assert!(reg.contains("rsi_momentum"));
        assert!(!reg.configurable_params("sma_rsi_crossover").unwrap().is_empty());
    }

    #[test]
    fn deregister_removes_entry() {
        let mut reg = StrategyRegistry::builtin();
        assert!(reg.deregister("rsi_momentum"));
        assert!(!reg.contains("rsi_momentum"));
        assert!(!reg.deregister("rsi_momentum"));
    }
}
