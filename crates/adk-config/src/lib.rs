//! adk-config
//!
//! Layered YAML configuration for the execution core:
//! - load + deep-merge config files in order (later files win)
//! - canonicalize to stable JSON and hash (config provenance)
//! - typed consumption of the `engine` section

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

mod consumption;

pub use consumption::EngineConfig;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Typed view of the `engine` section.
    pub fn engine(&self) -> Result<EngineConfig> {
        EngineConfig::from_config_json(&self.config_json)
    }
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn later_files_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(
            &dir,
            "base.yaml",
            "engine:\n  broker: paper\n  feed_buffer: 1024\n",
        );
        let over = write_yaml(&dir, "override.yaml", "engine:\n  broker: fyers\n");

        let loaded = load_layered_yaml(&[&base, &over]).unwrap();
        assert_eq!(
            loaded.config_json.pointer("/engine/broker").unwrap(),
            "fyers"
        );
        // Non-overridden keys survive the merge.
        assert_eq!(
            loaded
                .config_json
                .pointer("/engine/feed_buffer")
                .and_then(Value::as_i64),
            Some(1024)
        );
    }

    #[test]
    fn hash_is_stable_under_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_yaml(&dir, "a.yaml", "engine:\n  broker: paper\n  feed_buffer: 64\n");
        let b = write_yaml(&dir, "b.yaml", "engine:\n  feed_buffer: 64\n  broker: paper\n");

        let la = load_layered_yaml(&[&a]).unwrap();
        let lb = load_layered_yaml(&[&b]).unwrap();
        assert_eq!(la.config_hash, lb.config_hash);
    }

    #[test]
    fn missing_file_errors() {
        assert!(load_layered_yaml(&["/nonexistent/config.yaml"]).is_err());
    }
}
