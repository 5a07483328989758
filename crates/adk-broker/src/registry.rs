//! Broker plugin registry with manifest-driven discovery.
//!
//! Broker implementations are compiled in; each plugin directory under the
//! plugins dir contributes a `plugin.json` manifest that activates and
//! describes one of them. Discovery therefore binds `manifest.name` to an
//! already-registered factory — a manifest naming an unknown implementation
//! is reported, not fatal. The built-in paper broker is registered by the
//! composition root before discovery and survives `reload`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::contract::Broker;
use crate::manifest::{BrokerMetadata, PluginManifest};

/// Factory producing a fresh, unconnected broker instance.
pub type BrokerFactory = Box<dyn Fn() -> Box<dyn Broker> + Send + Sync>;

/// Errors returned by registry operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName { name: String },
    UnknownBroker { name: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateName { name } => write!(f, "broker '{name}' is already registered"),
            Self::UnknownBroker { name } => write!(f, "no broker named '{name}' is registered"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Outcome of one discovery scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub loaded: Vec<String>,
    /// (directory name, reason) for every manifest that did not load.
    pub skipped: Vec<(String, String)>,
}

struct Entry {
    metadata: BrokerMetadata,
    factory: BrokerFactory,
}

/// Registry of broker implementations and their metadata.
pub struct BrokerRegistry {
    plugins_dir: PathBuf,
    entries: HashMap<String, Entry>,
    /// Compiled-in factories waiting for a manifest to activate them.
    pending_factories: HashMap<String, BrokerFactory>,
    /// Insertion order for deterministic listing.
    order: Vec<String>,
}

impl BrokerRegistry {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            entries: HashMap::new(),
            pending_factories: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a compiled-in broker with synthesized metadata. Used for the
    /// unconditional built-ins (paper trading) and by tests.
    pub fn register_builtin<F>(
        &mut self,
        metadata: BrokerMetadata,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Broker> + Send + Sync + 'static,
    {
        let name = metadata.name.clone();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateName { name });
        }
        self.entries.insert(
            name.clone(),
            Entry {
                metadata,
                factory: Box::new(factory),
            },
        );
        self.order.push(name);
        Ok(())
    }

    /// Register the factory for a plugin implementation. Discovery attaches
    /// manifest metadata to it; without a manifest the implementation stays
    /// dormant (not listed).
    pub fn register_plugin_factory<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Broker> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.entries.contains_key(&name) || self.pending_factories.contains_key(&name) {
            return Err(RegistryError::DuplicateName { name });
        }
        self.pending_factories.insert(name, Box::new(factory));
        Ok(())
    }

    /// Scan the plugins directory and activate every valid manifest.
    pub fn discover(&mut self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        let dir_entries = match fs::read_dir(&self.plugins_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.plugins_dir.display(), %err, "plugins directory not readable");
                return report;
            }
        };

        let mut dirs: Vec<PathBuf> = dir_entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let dir_name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if dir_name.starts_with('_') {
                continue;
            }
            match self.load_plugin(&dir) {
                Ok(name) => report.loaded.push(name),
                Err(reason) => {
                    warn!(plugin = %dir_name, %reason, "skipping broker plugin");
                    report.skipped.push((dir_name, reason));
                }
            }
        }

        report
    }

    fn load_plugin(&mut self, dir: &Path) -> Result<String, String> {
        let manifest_path = dir.join("plugin.json");
        let raw = fs::read_to_string(&manifest_path)
            .map_err(|e| format!("no readable plugin.json: {e}"))?;
        let manifest: PluginManifest =
            serde_json::from_str(&raw).map_err(|e| format!("invalid plugin.json: {e}"))?;

        let name = manifest.name.clone();
        if self.entries.contains_key(&name) {
            return Err(format!("broker '{name}' already active"));
        }
        let factory = self
            .pending_factories
            .remove(&name)
            .ok_or_else(|| format!("no compiled-in implementation for '{name}'"))?;

        info!(broker = %name, version = %manifest.version, "loaded broker plugin");
        self.entries.insert(
            name.clone(),
            Entry {
                metadata: BrokerMetadata::from(manifest),
                factory,
            },
        );
        self.order.push(name.clone());
        Ok(name)
    }

    /// Drop plugin-activated entries and rescan the plugins directory.
    /// Built-ins survive. A production deployment should refuse reload while
    /// runners are active; that guard lives in the execution engine.
    pub fn reload(&mut self) -> DiscoveryReport {
        let plugin_names: Vec<String> = self
            .order
            .iter()
            .filter(|n| {
                self.entries
                    .get(*n)
                    .map(|e| !e.metadata.builtin)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for name in plugin_names {
            if let Some(entry) = self.entries.remove(&name) {
                self.order.retain(|n| *n != name);
                self.pending_factories.insert(name, entry.factory);
            }
        }
        self.discover()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Metadata for all active brokers in registration order.
    pub fn list(&self) -> Vec<&BrokerMetadata> {
        self.order
            .iter()
            .filter_map(|n| self.entries.get(n))
            .map(|e| &e.metadata)
            .collect()
    }

    pub fn metadata(&self, name: &str) -> Result<&BrokerMetadata, RegistryError> {
        self.entries
            .get(name)
            .map(|e| &e.metadata)
            .ok_or_else(|| RegistryError::UnknownBroker {
                name: name.to_string(),
            })
    }

    /// Instantiate a fresh, unconnected broker.
    pub fn instantiate(&self, name: &str) -> Result<Box<dyn Broker>, RegistryError> {
        self.entries
            .get(name)
            .map(|e| (e.factory)())
            .ok_or_else(|| RegistryError::UnknownBroker {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::*;
    use crate::error::BrokerError;
    use crate::manifest::{AuthConfig, Capabilities};
    use adk_schemas::{Candle, Interval};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::io::Write;

    struct StubBroker(&'static str);

    #[async_trait]
    impl Broker for StubBroker {
        fn name(&self) -> &'static str {
            self.0
        }
        async fn connect(&self, _c: BrokerCredentials) -> Result<bool, BrokerError> {
            Ok(true)
        }
        async fn disconnect(&self) -> Result<(), BrokerError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            false
        }
        async fn get_profile(&self) -> Result<BrokerProfile, BrokerError> {
            Err(BrokerError::not_supported("stub"))
        }
        async fn get_margin(&self) -> Result<MarginInfo, BrokerError> {
            Err(BrokerError::not_supported("stub"))
        }
        async fn place_order(&self, _r: PlaceOrderRequest) -> Result<BrokerOrder, BrokerError> {
            Err(BrokerError::not_supported("stub"))
        }
        async fn modify_order(
            &self,
            _id: &str,
            _q: Option<i64>,
            _p: Option<i64>,
            _t: Option<i64>,
        ) -> Result<BrokerOrder, BrokerError> {
            Err(BrokerError::not_supported("stub"))
        }
        async fn cancel_order(&self, _id: &str) -> Result<bool, BrokerError> {
            Ok(false)
        }
        async fn get_order_status(&self, _id: &str) -> Result<BrokerOrder, BrokerError> {
            Err(BrokerError::not_supported("stub"))
        }
        async fn get_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
            Ok(vec![])
        }
        async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
            Ok(vec![])
        }
        async fn get_quote(&self, _s: &str, _e: &str) -> Result<MarketQuote, BrokerError> {
            Err(BrokerError::not_supported("stub"))
        }
        async fn get_historical_data(
            &self,
            _s: &str,
            _e: &str,
            _i: Interval,
            _f: NaiveDate,
            _t: NaiveDate,
        ) -> Result<Vec<Candle>, BrokerError> {
            Ok(vec![])
        }
        async fn subscribe_market_data(
            &self,
            _s: &[String],
            _cb: TickCallback,
        ) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn unsubscribe_market_data(&self, _s: &[String]) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn builtin_metadata(name: &str) -> BrokerMetadata {
        BrokerMetadata {
            name: name.to_string(),
            display_name: name.to_string(),
            version: "1.0.0".to_string(),
            description: String::new(),
            capabilities: Capabilities::default(),
            auth: AuthConfig {
                auth_type: "api_key".to_string(),
                requires_api_key: false,
                requires_api_secret: false,
                requires_totp: false,
                token_expiry_hours: 24,
                oauth_config: None,
            },
            exchanges: vec!["NSE".to_string()],
            symbol_format: String::new(),
            logo_url: None,
            config_schema: serde_json::Value::Null,
            builtin: true,
        }
    }

    fn write_manifest(dir: &Path, plugin: &str, name: &str) {
        let plugin_dir = dir.join(plugin);
        fs::create_dir_all(&plugin_dir).unwrap();
        let mut f = fs::File::create(plugin_dir.join("plugin.json")).unwrap();
        write!(
            f,
            r#"{{
                "name": "{name}",
                "display_name": "{name}",
                "version": "1.0.0",
                "description": "",
                "broker_class": "broker.Stub",
                "auth": {{"type": "api_key"}},
                "exchanges": ["NSE"],
                "symbol_format": "{{exchange}}:{{symbol}}-EQ"
            }}"#
        )
        .unwrap();
    }

    #[test]
    fn discovery_activates_manifest_backed_factories() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "fyers", "fyers");

        let mut reg = BrokerRegistry::new(dir.path());
        reg.register_plugin_factory("fyers", || Box::new(StubBroker("fyers")))
            .unwrap();

        let report = reg.discover();
        assert_eq!(report.loaded, vec!["fyers"]);
        assert!(report.skipped.is_empty());
        assert!(reg.contains("fyers"));
        assert_eq!(reg.metadata("fyers").unwrap().symbol_format, "{exchange}:{symbol}-EQ");
        assert_eq!(reg.instantiate("fyers").unwrap().name(), "fyers");
    }

    #[test]
    fn manifest_without_implementation_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "ghost", "ghost");

        let mut reg = BrokerRegistry::new(dir.path());
        let report = reg.discover();
        assert!(report.loaded.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].1.contains("no compiled-in implementation"));
    }

    #[test]
    fn invalid_manifest_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("broken");
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::write(plugin_dir.join("plugin.json"), "{ not json").unwrap();

        let mut reg = BrokerRegistry::new(dir.path());
        let report = reg.discover();
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn underscore_directories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "_disabled", "disabled");

        let mut reg = BrokerRegistry::new(dir.path());
        let report = reg.discover();
        assert!(report.loaded.is_empty());
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn builtin_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "fyers", "fyers");

        let mut reg = BrokerRegistry::new(dir.path());
        reg.register_builtin(builtin_metadata("paper"), || Box::new(StubBroker("paper")))
            .unwrap();
        reg.register_plugin_factory("fyers", || Box::new(StubBroker("fyers")))
            .unwrap();
        reg.discover();
        assert!(reg.contains("paper"));
        assert!(reg.contains("fyers"));

        let report = reg.reload();
        assert_eq!(report.loaded, vec!["fyers"]);
        assert!(reg.contains("paper"));
        assert!(reg.contains("fyers"));
    }

    #[test]
    fn duplicate_registration_errors() {
        let mut reg = BrokerRegistry::new("plugins");
        reg.register_builtin(builtin_metadata("paper"), || Box::new(StubBroker("paper")))
            .unwrap();
        let err = reg.register_builtin(builtin_metadata("paper"), || Box::new(StubBroker("paper")));
        assert!(matches!(err, Err(RegistryError::DuplicateName { .. })));
    }
}
