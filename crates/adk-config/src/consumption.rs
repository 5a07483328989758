//! Typed consumption of the canonical config JSON.
//!
//! The engine section carries the runtime knobs the execution core needs.
//! Everything here has a conservative default so a minimal config file is
//! enough to boot a paper-trading deployment.

use anyhow::{anyhow, Result};
use serde_json::Value;

/// Runtime knobs for the execution core.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Broker implementation to bind at startup (registry name).
    pub broker: String,
    /// Redis URL for the kill-switch store and event channel.
    pub redis_url: String,
    /// Directory scanned for broker plugin manifests.
    pub plugins_dir: String,
    /// Per-runner market-data buffer capacity (drop-oldest beyond this).
    pub feed_buffer: usize,
    /// Graceful stop timeout for runners, seconds.
    pub stop_timeout_secs: u64,
    /// Dry-run mode: audit orders, never send to the broker.
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broker: "paper".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            plugins_dir: "plugins".to_string(),
            feed_buffer: 1_024,
            stop_timeout_secs: 10,
            dry_run: false,
        }
    }
}

impl EngineConfig {
    /// Build from canonical config JSON (produced by `load_layered_yaml`).
    /// All fields optional; out-of-range values are rejected, not clamped.
    pub fn from_config_json(cfg: &Value) -> Result<Self> {
        let mut out = EngineConfig::default();

        if let Some(v) = cfg.pointer("/engine/broker").and_then(Value::as_str) {
            out.broker = v.to_string();
        }
        if let Some(v) = cfg.pointer("/engine/redis_url").and_then(Value::as_str) {
            out.redis_url = v.to_string();
        }
        if let Some(v) = cfg.pointer("/engine/plugins_dir").and_then(Value::as_str) {
            out.plugins_dir = v.to_string();
        }
        if let Some(v) = cfg.pointer("/engine/feed_buffer").and_then(Value::as_i64) {
            if v < 1 {
                return Err(anyhow!("engine.feed_buffer must be >= 1 (got {v})"));
            }
            out.feed_buffer = v as usize;
        }
        if let Some(v) = cfg
            .pointer("/engine/stop_timeout_secs")
            .and_then(Value::as_i64)
        {
            if v < 1 {
                return Err(anyhow!("engine.stop_timeout_secs must be >= 1 (got {v})"));
            }
            out.stop_timeout_secs = v as u64;
        }
        if let Some(v) = cfg.pointer("/engine/dry_run").and_then(Value::as_bool) {
            out.dry_run = v;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_when_section_absent() {
        let cfg = EngineConfig::from_config_json(&json!({})).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn reads_engine_section() {
        let cfg = EngineConfig::from_config_json(&json!({
            "engine": {
                "broker": "fyers",
                "redis_url": "redis://cache:6379",
                "feed_buffer": 256,
                "stop_timeout_secs": 5,
                "dry_run": true
            }
        }))
        .unwrap();
        assert_eq!(cfg.broker, "fyers");
        assert_eq!(cfg.redis_url, "redis://cache:6379");
        assert_eq!(cfg.feed_buffer, 256);
        assert_eq!(cfg.stop_timeout_secs, 5);
        assert!(cfg.dry_run);
    }

    #[test]
    fn rejects_non_positive_buffer() {
        let err = EngineConfig::from_config_json(&json!({
            "engine": { "feed_buffer": 0 }
        }));
        assert!(err.is_err());
    }
}
