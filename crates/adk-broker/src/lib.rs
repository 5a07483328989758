//! adk-broker
//!
//! The narrow broker contract the runtime consumes, and the plugin registry
//! that discovers broker implementations at startup:
//! - [`Broker`]: quotes, historical candles, orders, streaming subscriptions
//! - [`BrokerError`]: code + message + coarse kind
//! - historical-request chunking honoring per-interval range limits
//! - `plugin.json` manifest model and symbol-format templating
//! - [`BrokerRegistry`]: manifest scan + reload over compile-time factories;
//!   the built-in paper broker is registered unconditionally by the runtime
//!   composition root, not as a plugin

mod contract;
mod error;
mod history;
mod manifest;
mod registry;

pub use contract::{
    Broker, BrokerCredentials, BrokerOrder, BrokerPosition, BrokerProfile, MarginInfo,
    MarketQuote, OrderStatus, PlaceOrderRequest, Side, TickCallback,
};
pub use error::{BrokerError, BrokerErrorKind};
pub use history::{chunk_date_ranges, fetch_history_chunked, merge_candle_chunks};
pub use manifest::{
    format_symbol, AuthConfig, BrokerMetadata, Capabilities, OauthConfig, PluginManifest,
};
pub use registry::{BrokerFactory, BrokerRegistry, DiscoveryReport, RegistryError};
