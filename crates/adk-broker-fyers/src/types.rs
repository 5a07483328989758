//! Fyers API v3 wire shapes. Every response carries `s` ("ok"/"error"),
//! plus `code` and `message` on failure.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ApiEnvelope {
    pub s: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ProfileResponse {
    pub s: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<ProfileData>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileData {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "email_id")]
    pub email: String,
    #[serde(default)]
    pub fy_id: String,
}

#[derive(Debug, Deserialize)]
pub struct FundsResponse {
    pub s: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fund_limit: Vec<FundLimit>,
}

#[derive(Debug, Deserialize)]
pub struct FundLimit {
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "equityAmount")]
    pub equity_amount: f64,
}

#[derive(Debug, Serialize)]
pub struct PlaceOrderPayload {
    pub symbol: String,
    pub qty: i64,
    /// 1 limit, 2 market, 3 stop (SL-M), 4 stoplimit (SL-L)
    #[serde(rename = "type")]
    pub order_type: i64,
    /// 1 buy, -1 sell
    pub side: i64,
    #[serde(rename = "productType")]
    pub product_type: String,
    #[serde(rename = "limitPrice")]
    pub limit_price: f64,
    #[serde(rename = "stopPrice")]
    pub stop_price: f64,
    pub validity: String,
    #[serde(rename = "disclosedQty")]
    pub disclosed_qty: i64,
    #[serde(rename = "offlineOrder")]
    pub offline_order: bool,
    #[serde(rename = "stopLoss")]
    pub stop_loss: f64,
    #[serde(rename = "takeProfit")]
    pub take_profit: f64,
}

#[derive(Debug, Deserialize)]
pub struct OrderAckResponse {
    pub s: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderBookResponse {
    pub s: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "orderBook")]
    pub order_book: Vec<OrderBookRow>,
}

#[derive(Debug, Deserialize)]
pub struct OrderBookRow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub qty: i64,
    #[serde(default, rename = "filledQty")]
    pub filled_qty: i64,
    /// 1 cancelled, 2 traded, 4 transit, 5 rejected, 6 pending
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub side: i64,
    #[serde(default, rename = "type")]
    pub order_type: i64,
    #[serde(default, rename = "limitPrice")]
    pub limit_price: f64,
    #[serde(default, rename = "stopPrice")]
    pub stop_price: f64,
    #[serde(default, rename = "tradedPrice")]
    pub traded_price: f64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct PositionsResponse {
    pub s: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "netPositions")]
    pub net_positions: Vec<NetPosition>,
}

#[derive(Debug, Deserialize)]
pub struct NetPosition {
    #[serde(default)]
    pub symbol: String,
    #[serde(default, rename = "netQty")]
    pub net_qty: i64,
    #[serde(default, rename = "avgPrice")]
    pub avg_price: f64,
    #[serde(default)]
    pub ltp: f64,
    #[serde(default)]
    pub pl: f64,
    #[serde(default, rename = "productType")]
    pub product_type: String,
}

#[derive(Debug, Deserialize)]
pub struct QuotesResponse {
    pub s: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub d: Vec<QuoteRow>,
}

#[derive(Debug, Deserialize)]
pub struct QuoteRow {
    #[serde(default)]
    pub n: String,
    #[serde(default)]
    pub v: QuoteValues,
}

#[derive(Debug, Default, Deserialize)]
pub struct QuoteValues {
    #[serde(default)]
    pub lp: f64,
    #[serde(default)]
    pub open_price: f64,
    #[serde(default)]
    pub high_price: f64,
    #[serde(default)]
    pub low_price: f64,
    #[serde(default)]
    pub prev_close_price: f64,
    #[serde(default)]
    pub volume: i64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default, rename = "bid_size")]
    pub bid_qty: i64,
    #[serde(default, rename = "ask_size")]
    pub ask_qty: i64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryResponse {
    pub s: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    /// Rows of `[epoch_secs, open, high, low, close, volume]`.
    #[serde(default)]
    pub candles: Vec<[f64; 6]>,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub s: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
}

/// Streaming payload on the data socket.
#[derive(Debug, Deserialize)]
pub struct WsTick {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub ltp: f64,
    #[serde(default)]
    pub open_price: f64,
    #[serde(default)]
    pub high_price: f64,
    #[serde(default)]
    pub low_price: f64,
    #[serde(default)]
    pub prev_close_price: f64,
    #[serde(default)]
    pub vol_traded_today: i64,
    #[serde(default)]
    pub bid_price: f64,
    #[serde(default)]
    pub ask_price: f64,
    #[serde(default)]
    pub bid_size: i64,
    #[serde(default)]
    pub ask_size: i64,
    #[serde(default)]
    pub exch_feed_time: i64,
}
