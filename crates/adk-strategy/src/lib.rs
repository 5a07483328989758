//! adk-strategy
//!
//! The strategy contract and its compile-time registry:
//! - `Strategy` trait: lifecycle hooks, the `on_market_data` hot path,
//!   parameter application, and state round-trip for restart recovery
//! - `ConfigurableParam` descriptors consumed by the UI and the optimizer
//! - `StrategyRegistry`: the dispatch table that replaces dynamic module
//!   loading; keyed by the strategy-id string stored in the database
//! - indicator math shared with the chart-preview path
//! - reference strategies: SMA+RSI crossover, pure RSI momentum
//!
//! Strategy code is synchronous and deterministic given its internal state
//! and inputs. No IO, no clocks, no sleeping in the hot path.

mod registry;
mod types;

pub mod indicators;
pub mod implementations;

pub use registry::{RegistryError, StrategyFactory, StrategyRegistry};
pub use types::{
    clamp_config, ConfigMap, ConfigurableParam, ParamType, StateMap, Strategy, StrategyDescriptor,
};
