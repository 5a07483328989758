use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// plugin.json model
// ---------------------------------------------------------------------------

/// Capability flags a broker plugin declares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub trading: bool,
    pub market_data: bool,
    pub historical_data: bool,
    pub streaming: bool,
    pub options: bool,
    pub futures: bool,
    pub equity: bool,
    pub commodities: bool,
    pub currency: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            trading: true,
            market_data: true,
            historical_data: false,
            streaming: false,
            options: false,
            futures: false,
            equity: true,
            commodities: false,
            currency: false,
        }
    }
}

/// OAuth endpoints, present when `auth.type == "oauth"`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OauthConfig {
    pub auth_url: String,
    pub token_url: String,
}

/// Authentication requirements a plugin declares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// `oauth`, `api_key`, or `totp`.
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(default = "default_true")]
    pub requires_api_key: bool,
    #[serde(default = "default_true")]
    pub requires_api_secret: bool,
    #[serde(default)]
    pub requires_totp: bool,
    #[serde(default = "default_token_expiry")]
    pub token_expiry_hours: u32,
    #[serde(default)]
    pub oauth_config: Option<OauthConfig>,
}

fn default_true() -> bool {
    true
}

fn default_token_expiry() -> u32 {
    24
}

/// The `plugin.json` manifest a broker plugin ships.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Lowercase id; must match a compiled-in broker factory.
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub description: String,
    /// Implementation pointer within the plugin. Retained for operator
    /// tooling; resolution happens against the compiled-in factory table.
    pub broker_class: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub auth: AuthConfig,
    #[serde(default)]
    pub exchanges: Vec<String>,
    /// Template applied to (exchange, symbol), e.g. `"{exchange}:{symbol}-EQ"`.
    #[serde(default)]
    pub symbol_format: String,
    #[serde(default)]
    pub logo_url: Option<String>,
    #[serde(default)]
    pub config_schema: Value,
}

/// Broker metadata as surfaced by the registry (manifest-derived for
/// plugins, synthesized for built-ins).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub description: String,
    pub capabilities: Capabilities,
    pub auth: AuthConfig,
    pub exchanges: Vec<String>,
    pub symbol_format: String,
    pub logo_url: Option<String>,
    pub config_schema: Value,
    /// True for the unconditional built-ins (paper trading).
    pub builtin: bool,
}

impl From<PluginManifest> for BrokerMetadata {
    fn from(m: PluginManifest) -> Self {
        Self {
            name: m.name,
            display_name: m.display_name,
            version: m.version,
            description: m.description,
            capabilities: m.capabilities,
            auth: m.auth,
            exchanges: m.exchanges,
            symbol_format: m.symbol_format,
            logo_url: m.logo_url,
            config_schema: m.config_schema,
            builtin: false,
        }
    }
}

/// Apply a plugin's symbol-format template. An empty template passes the
/// symbol through unchanged.
pub fn format_symbol(template: &str, exchange: &str, symbol: &str) -> String {
    if template.is_empty() {
        return symbol.to_string();
    }
    template
        .replace("{exchange}", exchange)
        .replace("{symbol}", symbol)
}
