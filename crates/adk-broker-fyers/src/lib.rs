//! adk-broker-fyers
//!
//! Fyers API v3 adapter: REST for account/order/history operations, a
//! websocket data-socket task for streaming quotes. Activated by the
//! `plugins/fyers/plugin.json` manifest.
//!
//! Timeouts: order and account calls 15 s, historical chunks 30 s.
//! Historical requests are chunked per the interval's range limit and the
//! merged series is sorted and de-duplicated.

mod types;
mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use adk_broker::{
    fetch_history_chunked, Broker, BrokerCredentials, BrokerError, BrokerOrder, BrokerPosition,
    BrokerProfile, BrokerRegistry, MarginInfo, MarketQuote, OrderStatus, PlaceOrderRequest, Side,
    TickCallback,
};
use adk_schemas::{micros_from_f64, micros_to_f64, Candle, Interval, OrderType};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use types::*;

const BASE_URL: &str = "https://api-t1.fyers.in/api/v3";
const DATA_URL: &str = "https://api-t1.fyers.in/data";
const AUTH_URL: &str = "https://api-t1.fyers.in/api/v3/generate-authcode";
const TOKEN_URL: &str = "https://api-t1.fyers.in/api/v3/validate-authcode";
const WS_URL: &str = "wss://api-t1.fyers.in/socket/v2/dataSock";

const ORDER_TIMEOUT: Duration = Duration::from_secs(15);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(30);

struct Session {
    credentials: BrokerCredentials,
}

/// Fyers broker adapter.
pub struct FyersBroker {
    http: reqwest::Client,
    base_url: String,
    data_url: String,
    connected: AtomicBool,
    session: Mutex<Option<Session>>,
    ws: ws::WsFeed,
}

impl FyersBroker {
    pub fn new() -> Self {
        Self::with_base_urls(BASE_URL, DATA_URL, WS_URL)
    }

    /// Endpoints override for tests against a local stub server.
    pub fn with_base_urls(base_url: &str, data_url: &str, ws_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(ORDER_TIMEOUT)
            .build()
            .expect("reqwest client construction is infallible here");
        Self {
            http,
            base_url: base_url.to_string(),
            data_url: data_url.to_string(),
            connected: AtomicBool::new(false),
            session: Mutex::new(None),
            ws: ws::WsFeed::new(ws_url),
        }
    }

    /// Register the compiled-in factory; `plugins/fyers/plugin.json`
    /// activates it at discovery time.
    pub fn register(registry: &mut BrokerRegistry) {
        let _ = registry.register_plugin_factory("fyers", || Box::new(FyersBroker::new()));
    }

    /// Fyers symbology: cash equity `NSE:SBIN-EQ`, indices
    /// `NSE:NIFTY50-INDEX`, derivatives unchanged beyond the exchange prefix.
    pub fn format_symbol(exchange: &str, symbol: &str) -> String {
        if symbol.contains(':') {
            return symbol.to_string();
        }
        if symbol.ends_with("-INDEX") || symbol.ends_with("-EQ") {
            return format!("{exchange}:{symbol}");
        }
        let is_derivative = symbol.ends_with("FUT")
            || symbol.ends_with("CE")
            || symbol.ends_with("PE");
        if is_derivative {
            format!("{exchange}:{symbol}")
        } else {
            format!("{exchange}:{symbol}-EQ")
        }
    }

    /// Resolution string for the history API.
    pub fn resolution(interval: Interval) -> &'static str {
        match interval {
            Interval::Min1 => "1",
            Interval::Min5 => "5",
            Interval::Min15 => "15",
            Interval::Min30 => "30",
            Interval::Hour1 => "60",
            Interval::Day1 => "D",
        }
    }

    fn order_type_code(order_type: OrderType) -> i64 {
        match order_type {
            OrderType::Limit => 1,
            OrderType::Market => 2,
            OrderType::StopLossMarket => 3,
            OrderType::StopLoss => 4,
        }
    }

    fn map_status(code: i64) -> OrderStatus {
        match code {
            1 => OrderStatus::Cancelled,
            2 => OrderStatus::Filled,
            4 => OrderStatus::Pending,
            5 => OrderStatus::Rejected,
            6 => OrderStatus::Open,
            _ => OrderStatus::Pending,
        }
    }

    fn auth_header(&self) -> Result<String, BrokerError> {
        let session = self.session.lock().expect("fyers session poisoned");
        let creds = session
            .as_ref()
            .map(|s| &s.credentials)
            .ok_or_else(|| BrokerError::auth("not connected"))?;
        let client_id = creds
            .client_id
            .as_deref()
            .ok_or_else(|| BrokerError::auth("missing client id"))?;
        let token = creds
            .access_token
            .as_deref()
            .ok_or_else(|| BrokerError::auth("missing access token"))?;
        Ok(format!("{client_id}:{token}"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, BrokerError> {
        let response = self
            .http
            .get(url)
            .query(query)
            .header("Authorization", self.auth_header()?)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BrokerError::network(e.to_string()))?;
        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::network(format!("invalid response body: {e}")))
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, BrokerError> {
        let response = self
            .http
            .post(url)
            .json(body)
            .header("Authorization", self.auth_header()?)
            .timeout(ORDER_TIMEOUT)
            .send()
            .await
            .map_err(|e| BrokerError::network(e.to_string()))?;
        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::network(format!("invalid response body: {e}")))
    }

    fn split_symbol(full: &str) -> (String, String) {
        match full.split_once(':') {
            Some((exchange, rest)) => {
                let symbol = rest.strip_suffix("-EQ").unwrap_or(rest);
                (exchange.to_string(), symbol.to_string())
            }
            None => (String::new(), full.to_string()),
        }
    }
}

impl Default for FyersBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for FyersBroker {
    fn name(&self) -> &'static str {
        "fyers"
    }

    async fn connect(&self, credentials: BrokerCredentials) -> Result<bool, BrokerError> {
        if credentials.access_token.is_none() {
            return Err(BrokerError::auth(
                "fyers requires an access token; run the oauth flow first",
            ));
        }
        {
            let mut session = self.session.lock().expect("fyers session poisoned");
            *session = Some(Session { credentials });
        }
        // Validate the token with a profile call before reporting connected.
        match self.get_profile().await {
            Ok(_) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(true)
            }
            Err(err) => {
                let mut session = self.session.lock().expect("fyers session poisoned");
                *session = None;
                Err(err)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        self.ws.stop();
        let mut session = self.session.lock().expect("fyers session poisoned");
        *session = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_profile(&self) -> Result<BrokerProfile, BrokerError> {
        let url = format!("{}/profile", self.base_url);
        let resp: ProfileResponse = self.get_json(&url, &[], ORDER_TIMEOUT).await?;
        if resp.s != "ok" {
            return Err(BrokerError::auth(resp.message));
        }
        let data = resp
            .data
            .ok_or_else(|| BrokerError::exchange("PROFILE", "empty profile payload"))?;
        Ok(BrokerProfile {
            name: data.name,
            email: data.email,
            broker: "Fyers".to_string(),
            client_id: data.fy_id,
        })
    }

    async fn get_margin(&self) -> Result<MarginInfo, BrokerError> {
        let url = format!("{}/funds", self.base_url);
        let resp: FundsResponse = self.get_json(&url, &[], ORDER_TIMEOUT).await?;
        if resp.s != "ok" {
            return Err(BrokerError::exchange("FUNDS", resp.message));
        }
        let mut available = 0.0;
        let mut used = 0.0;
        for row in resp.fund_limit {
            match row.title.as_str() {
                "Available Balance" => available = row.equity_amount,
                "Utilized Amount" => used = row.equity_amount,
                _ => {}
            }
        }
        Ok(MarginInfo {
            available_micros: micros_from_f64(available),
            used_micros: micros_from_f64(used),
        })
    }

    async fn place_order(&self, request: PlaceOrderRequest) -> Result<BrokerOrder, BrokerError> {
        let payload = PlaceOrderPayload {
            symbol: Self::format_symbol(&request.exchange, &request.symbol),
            qty: request.quantity,
            order_type: Self::order_type_code(request.order_type),
            side: match request.side {
                Side::Buy => 1,
                Side::Sell => -1,
            },
            product_type: request.product_type.clone(),
            limit_price: request.price_micros.map(micros_to_f64).unwrap_or(0.0),
            stop_price: request
                .trigger_price_micros
                .map(micros_to_f64)
                .unwrap_or(0.0),
            validity: "DAY".to_string(),
            disclosed_qty: 0,
            offline_order: false,
            stop_loss: 0.0,
            take_profit: 0.0,
        };

        let url = format!("{}/orders/sync", self.base_url);
        let resp: OrderAckResponse = self.post_json(&url, &payload).await?;
        if resp.s != "ok" {
            return Err(BrokerError::exchange(resp.code.to_string(), resp.message));
        }
        debug!(order_id = %resp.id, symbol = %request.symbol, "fyers order placed");
        Ok(BrokerOrder {
            order_id: resp.id.clone(),
            broker_order_id: Some(resp.id),
            symbol: request.symbol,
            exchange: request.exchange,
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            price_micros: request.price_micros,
            trigger_price_micros: request.trigger_price_micros,
            status: OrderStatus::Placed,
            filled_quantity: 0,
            filled_price_micros: None,
            message: resp.message,
            placed_at: Some(Utc::now()),
        })
    }

    async fn modify_order(
        &self,
        order_id: &str,
        quantity: Option<i64>,
        price_micros: Option<i64>,
        trigger_price_micros: Option<i64>,
    ) -> Result<BrokerOrder, BrokerError> {
        let mut payload = serde_json::json!({ "id": order_id });
        if let Some(q) = quantity {
            payload["qty"] = serde_json::json!(q);
        }
        if let Some(p) = price_micros {
            payload["limitPrice"] = serde_json::json!(micros_to_f64(p));
        }
        if let Some(t) = trigger_price_micros {
            payload["stopPrice"] = serde_json::json!(micros_to_f64(t));
        }

        let url = format!("{}/orders", self.base_url);
        let response = self
            .http
            .patch(&url)
            .json(&payload)
            .header("Authorization", self.auth_header()?)
            .timeout(ORDER_TIMEOUT)
            .send()
            .await
            .map_err(|e| BrokerError::network(e.to_string()))?;
        let resp: OrderAckResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::network(format!("invalid response body: {e}")))?;
        if resp.s != "ok" {
            return Err(BrokerError::exchange(resp.code.to_string(), resp.message));
        }
        self.get_order_status(order_id).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, BrokerError> {
        let url = format!("{}/orders", self.base_url);
        let payload = serde_json::json!({ "id": order_id });
        let response = self
            .http
            .delete(&url)
            .json(&payload)
            .header("Authorization", self.auth_header()?)
            .timeout(ORDER_TIMEOUT)
            .send()
            .await
            .map_err(|e| BrokerError::network(e.to_string()))?;
        let resp: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| BrokerError::network(format!("invalid response body: {e}")))?;
        Ok(resp.s == "ok")
    }

    async fn get_order_status(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
        let orders = self.get_orders().await?;
        orders
            .into_iter()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| BrokerError::validation(format!("unknown order {order_id}")))
    }

    async fn get_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let url = format!("{}/orders", self.base_url);
        let resp: OrderBookResponse = self.get_json(&url, &[], ORDER_TIMEOUT).await?;
        if resp.s != "ok" {
            return Err(BrokerError::exchange("ORDERS", resp.message));
        }
        Ok(resp
            .order_book
            .into_iter()
            .map(|row| {
                let (exchange, symbol) = Self::split_symbol(&row.symbol);
                BrokerOrder {
                    order_id: row.id.clone(),
                    broker_order_id: Some(row.id),
                    symbol,
                    exchange,
                    side: if row.side >= 0 { Side::Buy } else { Side::Sell },
                    quantity: row.qty,
                    order_type: match row.order_type {
                        1 => OrderType::Limit,
                        3 => OrderType::StopLossMarket,
                        4 => OrderType::StopLoss,
                        _ => OrderType::Market,
                    },
                    price_micros: (row.limit_price > 0.0).then(|| micros_from_f64(row.limit_price)),
                    trigger_price_micros: (row.stop_price > 0.0)
                        .then(|| micros_from_f64(row.stop_price)),
                    status: Self::map_status(row.status),
                    filled_quantity: row.filled_qty,
                    filled_price_micros: (row.traded_price > 0.0)
                        .then(|| micros_from_f64(row.traded_price)),
                    message: row.message,
                    placed_at: None,
                }
            })
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/positions", self.base_url);
        let resp: PositionsResponse = self.get_json(&url, &[], ORDER_TIMEOUT).await?;
        if resp.s != "ok" {
            return Err(BrokerError::exchange("POSITIONS", resp.message));
        }
        Ok(resp
            .net_positions
            .into_iter()
            .map(|p| {
                let (exchange, symbol) = Self::split_symbol(&p.symbol);
                BrokerPosition {
                    symbol,
                    exchange,
                    quantity: p.net_qty,
                    avg_price_micros: micros_from_f64(p.avg_price),
                    ltp_micros: micros_from_f64(p.ltp),
                    pnl_micros: micros_from_f64(p.pl),
                    product_type: p.product_type,
                }
            })
            .collect())
    }

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<MarketQuote, BrokerError> {
        let fyers_symbol = Self::format_symbol(exchange, symbol);
        let url = format!("{}/quotes", self.data_url);
        let resp: QuotesResponse = self
            .get_json(&url, &[("symbols", fyers_symbol.clone())], ORDER_TIMEOUT)
            .await?;
        if resp.s != "ok" {
            return Err(BrokerError::exchange("QUOTES", resp.message));
        }
        let row = resp
            .d
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::exchange("QUOTES", format!("no quote for {fyers_symbol}")))?;
        Ok(MarketQuote {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            ltp_micros: micros_from_f64(row.v.lp),
            open_micros: micros_from_f64(row.v.open_price),
            high_micros: micros_from_f64(row.v.high_price),
            low_micros: micros_from_f64(row.v.low_price),
            close_micros: micros_from_f64(row.v.prev_close_price),
            volume: row.v.volume,
            bid_micros: micros_from_f64(row.v.bid),
            ask_micros: micros_from_f64(row.v.ask),
            bid_qty: row.v.bid_qty,
            ask_qty: row.v.ask_qty,
            ts: Utc::now(),
        })
    }

    async fn get_historical_data(
        &self,
        symbol: &str,
        exchange: &str,
        interval: Interval,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError> {
        let fyers_symbol = Self::format_symbol(exchange, symbol);
        let resolution = Self::resolution(interval);
        let url = format!("{}/history", self.data_url);

        fetch_history_chunked(interval, from, to, |start, end| {
            let url = url.clone();
            let fyers_symbol = fyers_symbol.clone();
            async move {
                let range_from = start
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc().timestamp())
                    .unwrap_or_default();
                let range_to = end
                    .and_hms_opt(23, 59, 59)
                    .map(|dt| dt.and_utc().timestamp())
                    .unwrap_or_default();
                let query = [
                    ("symbol", fyers_symbol.clone()),
                    ("resolution", resolution.to_string()),
                    ("date_format", "0".to_string()),
                    ("range_from", range_from.to_string()),
                    ("range_to", range_to.to_string()),
                    ("cont_flag", "1".to_string()),
                ];
                let resp: HistoryResponse =
                    self.get_json(&url, &query, HISTORY_TIMEOUT).await?;
                if resp.s != "ok" {
                    return Err(BrokerError::exchange(resp.code.to_string(), resp.message));
                }
                Ok(resp
                    .candles
                    .into_iter()
                    .filter_map(|row| {
                        let ts = Utc.timestamp_opt(row[0] as i64, 0).single()?;
                        Some(Candle {
                            ts,
                            open_micros: micros_from_f64(row[1]),
                            high_micros: micros_from_f64(row[2]),
                            low_micros: micros_from_f64(row[3]),
                            close_micros: micros_from_f64(row[4]),
                            volume: row[5] as i64,
                        })
                    })
                    .collect())
            }
        })
        .await
    }

    async fn subscribe_market_data(
        &self,
        symbols: &[String],
        callback: TickCallback,
    ) -> Result<(), BrokerError> {
        let auth = self.auth_header()?;
        let fyers_symbols: Vec<String> = symbols
            .iter()
            .map(|s| match s.split_once(':') {
                Some((exchange, symbol)) => Self::format_symbol(exchange, symbol),
                None => Self::format_symbol("NSE", s),
            })
            .collect();
        self.ws.subscribe(&auth, fyers_symbols, callback);
        Ok(())
    }

    async fn unsubscribe_market_data(&self, symbols: &[String]) -> Result<(), BrokerError> {
        let fyers_symbols: Vec<String> = symbols
            .iter()
            .map(|s| match s.split_once(':') {
                Some((exchange, symbol)) => Self::format_symbol(exchange, symbol),
                None => Self::format_symbol("NSE", s),
            })
            .collect();
        self.ws.unsubscribe(fyers_symbols);
        Ok(())
    }

    fn oauth_authorize_url(&self, redirect_uri: &str, state: &str) -> Option<String> {
        let session = self.session.lock().expect("fyers session poisoned");
        let client_id = session
            .as_ref()
            .and_then(|s| s.credentials.client_id.clone())?;
        Some(format!(
            "{AUTH_URL}?client_id={client_id}&redirect_uri={redirect_uri}&response_type=code&state={state}"
        ))
    }

    async fn exchange_auth_code(&self, code: &str) -> Result<BrokerCredentials, BrokerError> {
        let (api_key, api_secret, client_id) = {
            let session = self.session.lock().expect("fyers session poisoned");
            let creds = session
                .as_ref()
                .map(|s| s.credentials.clone())
                .ok_or_else(|| BrokerError::auth("set api credentials before token exchange"))?;
            (creds.api_key, creds.api_secret, creds.client_id)
        };
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(BrokerError::auth("app_id and secret_key are required"));
        }

        let app_id_hash = app_id_hash(&api_key, &api_secret);
        let payload = serde_json::json!({
            "grant_type": "authorization_code",
            "appIdHash": app_id_hash,
            "code": code,
        });
        let response = self
            .http
            .post(TOKEN_URL)
            .json(&payload)
            .timeout(ORDER_TIMEOUT)
            .send()
            .await
            .map_err(|e| BrokerError::network(e.to_string()))?;
        let resp: TokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::network(format!("invalid response body: {e}")))?;
        if resp.s != "ok" {
            return Err(BrokerError::auth(format!(
                "token exchange failed: {}",
                resp.message
            )));
        }
        Ok(BrokerCredentials {
            api_key,
            api_secret,
            access_token: Some(resp.access_token),
            refresh_token: (!resp.refresh_token.is_empty()).then_some(resp.refresh_token),
            client_id,
        })
    }
}

/// Fyers `appIdHash`: sha256 of `"{app_id}:{secret}"`.
pub fn app_id_hash(api_key: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{api_key}:{api_secret}").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equity_symbols_get_eq_suffix() {
        assert_eq!(FyersBroker::format_symbol("NSE", "SBIN"), "NSE:SBIN-EQ");
        assert_eq!(FyersBroker::format_symbol("BSE", "ACC"), "BSE:ACC-EQ");
    }

    #[test]
    fn index_symbols_keep_index_suffix() {
        assert_eq!(
            FyersBroker::format_symbol("NSE", "NIFTY50-INDEX"),
            "NSE:NIFTY50-INDEX"
        );
    }

    #[test]
    fn derivatives_pass_through_unchanged() {
        assert_eq!(
            FyersBroker::format_symbol("NSE", "NIFTY24DECFUT"),
            "NSE:NIFTY24DECFUT"
        );
        assert_eq!(
            FyersBroker::format_symbol("NSE", "NIFTY2412619500CE"),
            "NSE:NIFTY2412619500CE"
        );
    }

    #[test]
    fn already_prefixed_symbols_are_untouched() {
        assert_eq!(
            FyersBroker::format_symbol("NSE", "NSE:SBIN-EQ"),
            "NSE:SBIN-EQ"
        );
    }

    #[test]
    fn resolution_mapping() {
        assert_eq!(FyersBroker::resolution(Interval::Min1), "1");
        assert_eq!(FyersBroker::resolution(Interval::Hour1), "60");
        assert_eq!(FyersBroker::resolution(Interval::Day1), "D");
    }

    #[test]
    fn app_id_hash_is_stable() {
        let h = app_id_hash("ABC-100", "secret");
        assert_eq!(h.len(), 64);
        assert_eq!(h, app_id_hash("ABC-100", "secret"));
        assert_ne!(h, app_id_hash("ABC-100", "other"));
    }

    #[test]
    fn split_symbol_strips_eq_suffix() {
        assert_eq!(
            FyersBroker::split_symbol("NSE:SBIN-EQ"),
            ("NSE".to_string(), "SBIN".to_string())
        );
        assert_eq!(
            FyersBroker::split_symbol("NSE:NIFTY50-INDEX"),
            ("NSE".to_string(), "NIFTY50-INDEX".to_string())
        );
    }

    #[test]
    fn history_rows_parse() {
        let raw = r#"{"s":"ok","candles":[[1700000000,100.5,101.0,99.5,100.0,1200]]}"#;
        let resp: HistoryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.candles.len(), 1);
        assert_eq!(resp.candles[0][5], 1200.0);
    }

    #[test]
    fn connect_without_token_fails() {
        let broker = FyersBroker::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(broker.connect(BrokerCredentials::default()))
            .unwrap_err();
        assert_eq!(err.kind, adk_broker::BrokerErrorKind::Auth);
    }
}
