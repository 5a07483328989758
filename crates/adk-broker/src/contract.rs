use std::sync::Arc;

use adk_schemas::{Candle, Interval, MarketTick, OrderType};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Broker-side transaction direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials for broker authentication.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
}

/// Order placement request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub quantity: i64,
    pub order_type: OrderType,
    pub price_micros: Option<i64>,
    pub trigger_price_micros: Option<i64>,
    /// INTRADAY, DELIVERY, …
    pub product_type: String,
}

/// Lifecycle status of a broker order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Placed,
    Open,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
    Expired,
}

/// An order as the broker reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub quantity: i64,
    pub order_type: OrderType,
    pub price_micros: Option<i64>,
    pub trigger_price_micros: Option<i64>,
    pub status: OrderStatus,
    pub filled_quantity: i64,
    pub filled_price_micros: Option<i64>,
    pub message: String,
    pub placed_at: Option<DateTime<Utc>>,
}

/// A position as the broker reports it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub exchange: String,
    pub quantity: i64,
    pub avg_price_micros: i64,
    pub ltp_micros: i64,
    pub pnl_micros: i64,
    pub product_type: String,
}

/// A market quote from the broker's feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub exchange: String,
    pub ltp_micros: i64,
    pub open_micros: i64,
    pub high_micros: i64,
    pub low_micros: i64,
    pub close_micros: i64,
    pub volume: i64,
    pub bid_micros: i64,
    pub ask_micros: i64,
    pub bid_qty: i64,
    pub ask_qty: i64,
    pub ts: DateTime<Utc>,
}

impl MarketQuote {
    /// Convert to the tick shape the supervisor fans out.
    pub fn to_tick(&self) -> MarketTick {
        MarketTick {
            symbol: self.symbol.clone(),
            exchange: self.exchange.clone(),
            ts: self.ts,
            ltp_micros: self.ltp_micros,
            open_micros: self.open_micros,
            high_micros: self.high_micros,
            low_micros: self.low_micros,
            close_micros: self.close_micros,
            volume: self.volume,
            bid_micros: self.bid_micros,
            ask_micros: self.ask_micros,
            bid_qty: self.bid_qty,
            ask_qty: self.ask_qty,
        }
    }
}

/// Account profile fields the platform surfaces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerProfile {
    pub name: String,
    pub email: String,
    pub broker: String,
    pub client_id: String,
}

/// Margin snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginInfo {
    pub available_micros: i64,
    pub used_micros: i64,
}

/// Streaming callback: invoked once per quote on the broker's feed task.
pub type TickCallback = Arc<dyn Fn(MarketQuote) + Send + Sync>;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// The narrow contract every broker implementation satisfies.
///
/// All operations may fail with a [`BrokerError`] carrying the broker's code
/// and message. Implementations use interior mutability: the runtime holds
/// the broker behind an `Arc<dyn Broker>`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Registry name of this implementation (lowercase id).
    fn name(&self) -> &'static str;

    async fn connect(&self, credentials: BrokerCredentials) -> Result<bool, BrokerError>;
    async fn disconnect(&self) -> Result<(), BrokerError>;
    fn is_connected(&self) -> bool;

    async fn get_profile(&self) -> Result<BrokerProfile, BrokerError>;
    async fn get_margin(&self) -> Result<MarginInfo, BrokerError>;

    async fn place_order(&self, request: PlaceOrderRequest) -> Result<BrokerOrder, BrokerError>;
    async fn modify_order(
        &self,
        order_id: &str,
        quantity: Option<i64>,
        price_micros: Option<i64>,
        trigger_price_micros: Option<i64>,
    ) -> Result<BrokerOrder, BrokerError>;
    async fn cancel_order(&self, order_id: &str) -> Result<bool, BrokerError>;
    async fn get_order_status(&self, order_id: &str) -> Result<BrokerOrder, BrokerError>;
    async fn get_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<MarketQuote, BrokerError>;

    /// Historical candles for `[from, to]` inclusive. Implementations must
    /// chunk requests to honor per-interval range limits, concatenate,
    /// sort ascending by timestamp, and deduplicate identical timestamps
    /// (see [`crate::fetch_history_chunked`]).
    async fn get_historical_data(
        &self,
        symbol: &str,
        exchange: &str,
        interval: Interval,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError>;

    async fn subscribe_market_data(
        &self,
        symbols: &[String],
        callback: TickCallback,
    ) -> Result<(), BrokerError>;
    async fn unsubscribe_market_data(&self, symbols: &[String]) -> Result<(), BrokerError>;

    /// OAuth authorization-URL builder. Brokers without an OAuth flow
    /// advertise `auth.type != "oauth"` in their manifest and keep the
    /// default.
    fn oauth_authorize_url(&self, _redirect_uri: &str, _state: &str) -> Option<String> {
        None
    }

    /// Exchange an OAuth auth code for tokens.
    async fn exchange_auth_code(&self, _code: &str) -> Result<BrokerCredentials, BrokerError> {
        Err(BrokerError::not_supported("oauth not supported"))
    }
}
