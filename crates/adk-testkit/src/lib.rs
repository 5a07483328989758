//! adk-testkit
//!
//! Shared wiring for the end-to-end scenario tests under `tests/`:
//! a recording broker, tick/context builders, and a scripted strategy
//! registered alongside the platform's reference strategies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use adk_broker::{
    Broker, BrokerCredentials, BrokerError, BrokerOrder, BrokerPosition, BrokerProfile,
    MarginInfo, MarketQuote, OrderStatus, PlaceOrderRequest, TickCallback,
};
use adk_schemas::{
    micros_from_f64, Candle, Interval, MarketTick, OrderRequest, RiskLimits, Signal,
    StrategyContext, MICROS_SCALE,
};
use adk_strategy::{ConfigMap, StateMap, Strategy, StrategyDescriptor, StrategyRegistry};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

// ---------------------------------------------------------------------------
// Recording broker
// ---------------------------------------------------------------------------

/// In-memory broker that records every placed order and exposes the feed
/// callback so tests can inject quotes.
pub struct RecordingBroker {
    connected: AtomicBool,
    orders: Mutex<Vec<PlaceOrderRequest>>,
    callback: Mutex<Option<TickCallback>>,
    next_id: Mutex<u64>,
    /// When set, every place_order fails with this broker error message.
    pub fail_orders_with: Mutex<Option<String>>,
}

impl RecordingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            orders: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            next_id: Mutex::new(1),
            fail_orders_with: Mutex::new(None),
        })
    }

    pub fn placed_orders(&self) -> Vec<PlaceOrderRequest> {
        self.orders.lock().expect("orders poisoned").clone()
    }

    /// Push a quote into the installed feed callback.
    pub fn push_quote(&self, quote: MarketQuote) {
        let cb = self.callback.lock().expect("callback poisoned").clone();
        if let Some(cb) = cb {
            cb(quote);
        }
    }

    pub fn has_feed(&self) -> bool {
        self.callback.lock().expect("callback poisoned").is_some()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn connect(&self, _credentials: BrokerCredentials) -> Result<bool, BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_profile(&self) -> Result<BrokerProfile, BrokerError> {
        Ok(BrokerProfile {
            name: "Recording".to_string(),
            email: "test@local".to_string(),
            broker: "recording".to_string(),
            client_id: "REC001".to_string(),
        })
    }

    async fn get_margin(&self) -> Result<MarginInfo, BrokerError> {
        Ok(MarginInfo {
            available_micros: 1_000_000 * MICROS_SCALE,
            used_micros: 0,
        })
    }

    async fn place_order(&self, request: PlaceOrderRequest) -> Result<BrokerOrder, BrokerError> {
        if let Some(message) = self
            .fail_orders_with
            .lock()
            .expect("fail flag poisoned")
            .clone()
        {
            return Err(BrokerError::exchange("TEST", message));
        }

        let id = {
            let mut next = self.next_id.lock().expect("id poisoned");
            let id = *next;
            *next += 1;
            id
        };
        self.orders
            .lock()
            .expect("orders poisoned")
            .push(request.clone());

        Ok(BrokerOrder {
            order_id: format!("rec-{id:06}"),
            broker_order_id: Some(format!("REC_{id:06}")),
            symbol: request.symbol,
            exchange: request.exchange,
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            price_micros: request.price_micros,
            trigger_price_micros: request.trigger_price_micros,
            status: OrderStatus::Filled,
            filled_quantity: request.quantity,
            filled_price_micros: request.price_micros,
            message: "ok".to_string(),
            placed_at: Some(Utc::now()),
        })
    }

    async fn modify_order(
        &self,
        order_id: &str,
        _quantity: Option<i64>,
        _price_micros: Option<i64>,
        _trigger_price_micros: Option<i64>,
    ) -> Result<BrokerOrder, BrokerError> {
        Err(BrokerError::validation(format!("unknown order {order_id}")))
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<bool, BrokerError> {
        Ok(false)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<BrokerOrder, BrokerError> {
        Err(BrokerError::validation(format!("unknown order {order_id}")))
    }

    async fn get_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        Ok(vec![])
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(vec![])
    }

    async fn get_quote(&self, symbol: &str, exchange: &str) -> Result<MarketQuote, BrokerError> {
        Ok(quote(symbol, exchange, 100.0, 0))
    }

    async fn get_historical_data(
        &self,
        _symbol: &str,
        _exchange: &str,
        _interval: Interval,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<Vec<Candle>, BrokerError> {
        Ok(vec![])
    }

    async fn subscribe_market_data(
        &self,
        _symbols: &[String],
        callback: TickCallback,
    ) -> Result<(), BrokerError> {
        *self.callback.lock().expect("callback poisoned") = Some(callback);
        Ok(())
    }

    async fn unsubscribe_market_data(&self, _symbols: &[String]) -> Result<(), BrokerError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted strategy
// ---------------------------------------------------------------------------

/// Emits a prepared order on the n-th tick it sees.
pub struct EmitOnTick {
    emit_at: usize,
    order: OrderRequest,
    seen: usize,
}

impl EmitOnTick {
    pub fn new(emit_at: usize, order: OrderRequest) -> Self {
        Self {
            emit_at,
            order,
            seen: 0,
        }
    }
}

impl Strategy for EmitOnTick {
    fn descriptor(&self) -> StrategyDescriptor {
        emit_on_tick_descriptor()
    }

    fn on_market_data(
        &mut self,
        _ctx: &StrategyContext,
        _tick: &MarketTick,
    ) -> Option<OrderRequest> {
        self.seen += 1;
        (self.seen == self.emit_at).then(|| self.order.clone())
    }

    fn apply_config(&mut self, _config: &ConfigMap) {}
    fn get_state(&self) -> StateMap {
        StateMap::new()
    }
    fn set_state(&mut self, _state: &StateMap) {}
}

fn emit_on_tick_descriptor() -> StrategyDescriptor {
    StrategyDescriptor {
        name: "emit_on_tick",
        display_name: "Emit On Tick",
        version: "1.0.0",
        description: "scenario seed: emits one prepared order",
        min_capital_micros: 0,
        supported_symbols: &[],
        interval: Interval::Min5,
    }
}

/// Builtin strategies plus the scripted scenario seed.
pub fn test_registry(order: OrderRequest, emit_at: usize) -> Arc<StrategyRegistry> {
    let mut registry = StrategyRegistry::builtin();
    registry
        .register(emit_on_tick_descriptor(), vec![], move || {
            Box::new(EmitOnTick::new(emit_at, order.clone()))
        })
        .expect("scenario strategy name is unique");
    Arc::new(registry)
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn quote(symbol: &str, exchange: &str, close: f64, seq: i64) -> MarketQuote {
    let price = micros_from_f64(close);
    MarketQuote {
        symbol: symbol.to_string(),
        exchange: exchange.to_string(),
        ltp_micros: price,
        open_micros: price,
        high_micros: price,
        low_micros: price,
        close_micros: price,
        volume: 100,
        bid_micros: price,
        ask_micros: price,
        bid_qty: 10,
        ask_qty: 10,
        ts: ts(seq),
    }
}

pub fn tick(symbol: &str, exchange: &str, close: f64, seq: i64) -> MarketTick {
    quote(symbol, exchange, close, seq).to_tick()
}

pub fn ts(seq: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seq * 60, 0).unwrap()
}

pub fn limits() -> RiskLimits {
    RiskLimits::new(1_000, 5_000 * MICROS_SCALE, 200, 5)
}

pub fn context(subscription_id: &str, user_id: &str, capital_rupees: i64) -> StrategyContext {
    StrategyContext::new(
        "emit_on_tick",
        user_id,
        subscription_id,
        capital_rupees * MICROS_SCALE,
        &limits(),
        true,
    )
}

pub fn buy_order(symbol: &str, quantity: i64) -> OrderRequest {
    OrderRequest::market(symbol, "NSE", Signal::Buy, quantity)
        .with_stop_loss(micros_from_f64(98.0))
        .with_reason("scenario entry")
}
