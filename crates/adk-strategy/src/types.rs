use std::collections::BTreeMap;

use adk_schemas::{Interval, MarketTick, OrderRequest, StrategyContext};

/// Serialized strategy state: primitives, lists, and maps only.
/// `BTreeMap` keeps serialization deterministic.
pub type StateMap = BTreeMap<String, serde_json::Value>;

/// User configuration for a strategy: parameter name -> numeric value.
/// Int-typed parameters are rounded at application time.
pub type ConfigMap = BTreeMap<String, f64>;

// ---------------------------------------------------------------------------
// Parameter descriptors
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
}

/// A configurable strategy parameter, as shown in the UI and sampled by the
/// optimizer.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigurableParam {
    pub name: &'static str,
    pub display_name: &'static str,
    pub param_type: ParamType,
    pub default_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub description: &'static str,
}

impl ConfigurableParam {
    pub fn int(
        name: &'static str,
        display_name: &'static str,
        default_value: i64,
        min_value: i64,
        max_value: i64,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            display_name,
            param_type: ParamType::Int,
            default_value: default_value as f64,
            min_value: min_value as f64,
            max_value: max_value as f64,
            description,
        }
    }

    pub fn float(
        name: &'static str,
        display_name: &'static str,
        default_value: f64,
        min_value: f64,
        max_value: f64,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            display_name,
            param_type: ParamType::Float,
            default_value,
            min_value,
            max_value,
            description,
        }
    }

    /// Clamp a raw value into the declared range; round Int-typed values.
    pub fn clamp(&self, value: f64) -> f64 {
        let v = value.clamp(self.min_value, self.max_value);
        match self.param_type {
            ParamType::Int => v.round(),
            ParamType::Float => v,
        }
    }
}

/// Resolve a config map against descriptors: unknown keys are dropped,
/// values are clamped per descriptor. The result carries only known keys.
pub fn clamp_config(params: &[ConfigurableParam], config: &ConfigMap) -> ConfigMap {
    let mut out = ConfigMap::new();
    for param in params {
        if let Some(&raw) = config.get(param.name) {
            out.insert(param.name.to_string(), param.clamp(raw));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Strategy identity
// ---------------------------------------------------------------------------

/// Static strategy metadata. Immutable at runtime.
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyDescriptor {
    /// Registry key; matches the strategy-id stored in the database.
    pub name: &'static str,
    pub display_name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub min_capital_micros: i64,
    pub supported_symbols: &'static [&'static str],
    pub interval: Interval,
}

// ---------------------------------------------------------------------------
// Strategy contract
// ---------------------------------------------------------------------------

/// The contract every strategy implements.
///
/// `on_market_data` is the hot path: it must be deterministic given internal
/// state and inputs (backtest reproducibility depends on this), must not
/// block, and must not mutate context positions directly — the runtime owns
/// reconciliation.
///
/// Lifecycle hooks are idempotent and mutate internal state only.
pub trait Strategy: Send {
    fn descriptor(&self) -> StrategyDescriptor;

    fn on_start(&mut self) {}
    fn on_stop(&mut self) {}
    fn on_pause(&mut self) {}
    fn on_resume(&mut self) {}

    /// Single entry point invoked per tick.
    fn on_market_data(&mut self, ctx: &StrategyContext, tick: &MarketTick)
        -> Option<OrderRequest>;

    /// Apply user configuration. Unknown keys ignored; out-of-range values
    /// clamped per descriptor.
    fn apply_config(&mut self, config: &ConfigMap);

    /// Serialize internal state for restart recovery. Must be a fixed point:
    /// `set_state(get_state())` followed by `get_state()` returns the same map.
    fn get_state(&self) -> StateMap;

    /// Restore internal state from a previous `get_state` snapshot.
    fn set_state(&mut self, state: &StateMap);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param() -> ConfigurableParam {
        ConfigurableParam::int("fast_ma_period", "Fast MA Period", 9, 2, 50, "fast SMA length")
    }

    #[test]
    fn clamp_rounds_int_params() {
        assert_eq!(param().clamp(9.4), 9.0);
        assert_eq!(param().clamp(9.6), 10.0);
    }

    #[test]
    fn clamp_bounds_range() {
        assert_eq!(param().clamp(1.0), 2.0);
        assert_eq!(param().clamp(99.0), 50.0);
    }

    #[test]
    fn clamp_config_drops_unknown_keys() {
        let params = [param()];
        let mut cfg = ConfigMap::new();
        cfg.insert("fast_ma_period".to_string(), 60.0);
        cfg.insert("bogus".to_string(), 1.0);

        let resolved = clamp_config(&params, &cfg);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["fast_ma_period"], 50.0);
    }
}
